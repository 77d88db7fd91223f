//! Error types for Trellis.

use std::fmt;

/// The main error type for Trellis core operations.
#[derive(Debug)]
pub enum TrellisError {
    /// Event registration error.
    Event(EventError),
    /// Attributes could not be converted to or from a typed value.
    Serialization(serde_json::Error),
    /// A typed conversion expected a JSON object.
    NotAnObject(&'static str),
}

impl fmt::Display for TrellisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(err) => write!(f, "Event error: {err}"),
            Self::Serialization(err) => write!(f, "Serialization error: {err}"),
            Self::NotAnObject(found) => {
                write!(f, "Expected a JSON object for attributes, found {found}")
            }
        }
    }
}

impl std::error::Error for TrellisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Event(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::NotAnObject(_) => None,
        }
    }
}

impl From<EventError> for TrellisError {
    fn from(err: EventError) -> Self {
        Self::Event(err)
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err)
    }
}

/// Event-registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A foreign emitter refused a handler registration.
    RegistrationRejected {
        /// The event name that was being registered.
        event: String,
        /// The emitter's explanation.
        reason: String,
    },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistrationRejected { event, reason } => {
                write!(f, "Emitter rejected handler for '{event}': {reason}")
            }
        }
    }
}

impl std::error::Error for EventError {}

/// A specialized Result type for Trellis core operations.
pub type Result<T> = std::result::Result<T, TrellisError>;
