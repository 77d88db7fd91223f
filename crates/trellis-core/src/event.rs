//! Event and payload types dispatched through an [`EventBus`](crate::EventBus).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Model;

/// Global counter for emitter identities.
static NEXT_EMITTER_ID: AtomicU64 = AtomicU64::new(1);

/// The wildcard event name. Handlers bound to it receive every event.
pub const ALL: &str = "all";

/// A process-unique identity for anything that can emit or listen to events.
///
/// Subscriptions are keyed by pairs of `EmitterId`s rather than by references,
/// so neither side of a listening relationship owns the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmitterId(u64);

impl EmitterId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        Self(NEXT_EMITTER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emitter#{}", self.0)
    }
}

/// The persistence verb passed to a sync adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    /// Persist a model that has no identity yet.
    Create,
    /// Load a model or a collection.
    Read,
    /// Replace a persisted model.
    Update,
    /// Partially update a persisted model.
    Patch,
    /// Delete a persisted model.
    Delete,
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// The `{added, removed, merged}` summary carried by an `"update"` event.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// Members inserted by the operation.
    pub added: Vec<Model>,
    /// Members extracted by the operation.
    pub removed: Vec<Model>,
    /// Existing members whose attributes were merged.
    pub merged: Vec<Model>,
}

impl Delta {
    /// Total number of members touched.
    pub fn total(&self) -> usize {
        self.added.len() + self.removed.len() + self.merged.len()
    }

    /// Returns `true` if nothing was added, removed or merged.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Data attached to an [`Event`].
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No data.
    #[default]
    Empty,
    /// Free-form data for user-defined events.
    Data(Value),
    /// `"change:<attr>"`: the attribute's value at the time of dispatch.
    Attribute {
        /// The store whose attribute changed.
        model: Model,
        /// The attribute's current value (`null` once unset).
        value: Value,
    },
    /// `"change"` and `"destroy"`.
    Model {
        /// The store the event concerns.
        model: Model,
    },
    /// `"invalid"`: a validation hook rejected a candidate state.
    Invalid {
        /// The store that failed validation.
        model: Model,
        /// The value returned by the validation hook.
        error: Value,
    },
    /// `"add"`: a member entered a collection or view.
    Added {
        /// The member.
        model: Model,
        /// The collection or view that inserted it.
        source: EmitterId,
        /// The requested insertion index, if any.
        index: Option<usize>,
    },
    /// `"remove"`: a member left a collection or view.
    Removed {
        /// The member.
        model: Model,
        /// The collection or view that extracted it.
        source: EmitterId,
        /// The member's index before removal.
        index: usize,
    },
    /// `"update"`: one reconciliation touched at least one member.
    Update {
        /// The collection or view that changed.
        source: EmitterId,
        /// What changed.
        delta: Delta,
    },
    /// `"reset"`: the whole content was replaced.
    Reset {
        /// The collection or view that was reset.
        source: EmitterId,
        /// Content before the reset.
        previous: Vec<Model>,
    },
    /// `"sort"`: the order changed.
    Sort {
        /// The collection or view that was reordered.
        source: EmitterId,
    },
    /// `"filter"`: a view's acceptance predicate was replaced.
    Filter {
        /// The view.
        source: EmitterId,
    },
    /// `"request"`: a persistence call started.
    Request {
        /// The model or collection being synced.
        source: EmitterId,
        /// The verb passed to the adapter.
        method: SyncMethod,
    },
    /// `"sync"`: a persistence call succeeded.
    Synced {
        /// The model or collection that was synced.
        source: EmitterId,
        /// The raw data returned by the adapter.
        response: Value,
    },
    /// `"error"`: a persistence call failed.
    Failed {
        /// The model or collection whose sync failed.
        source: EmitterId,
        /// A readable description of the failure.
        message: String,
    },
}

/// A named notification delivered synchronously to registered handlers.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    payload: Payload,
}

impl Event {
    /// Create an event with a payload.
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create an event with no payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Payload::Empty)
    }

    /// The event name, e.g. `"change:title"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached data.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The model this event concerns, if any.
    pub fn model(&self) -> Option<&Model> {
        match &self.payload {
            Payload::Attribute { model, .. }
            | Payload::Model { model }
            | Payload::Invalid { model, .. }
            | Payload::Added { model, .. }
            | Payload::Removed { model, .. } => Some(model),
            _ => None,
        }
    }

    /// The emitter that originated a collection-level event, if recorded.
    pub fn source(&self) -> Option<EmitterId> {
        match &self.payload {
            Payload::Added { source, .. }
            | Payload::Removed { source, .. }
            | Payload::Update { source, .. }
            | Payload::Reset { source, .. }
            | Payload::Sort { source }
            | Payload::Filter { source }
            | Payload::Request { source, .. }
            | Payload::Synced { source, .. }
            | Payload::Failed { source, .. } => Some(*source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_ids_are_unique() {
        let a = EmitterId::next();
        let b = EmitterId::next();
        assert_ne!(a, b);
        assert!(b.as_raw() > a.as_raw());
    }

    #[test]
    fn test_delta_totals() {
        let mut delta = Delta::default();
        assert!(delta.is_empty());
        delta.added.push(Model::new());
        delta.merged.push(Model::new());
        assert_eq!(delta.total(), 2);
    }

    #[test]
    fn test_source_of_collection_payloads() {
        let origin = EmitterId::next();
        let event = Event::new("sort", Payload::Sort { source: origin });
        assert_eq!(event.source(), Some(origin));
        assert_eq!(Event::named("ping").source(), None);
    }

    #[test]
    fn test_sync_method_serializes_lowercase() {
        let json = serde_json::to_string(&SyncMethod::Patch).unwrap();
        assert_eq!(json, "\"patch\"");
        assert_eq!(SyncMethod::Delete.to_string(), "delete");
    }
}
