//! Logging and debugging facilities for Trellis.
//!
//! This module provides:
//! - Target and span names for filtering `tracing` output by subsystem
//! - A formatter for the live subscription arena, for hunting leaked listeners
//! - A performance span guard
//!
//! # Tracing Integration
//!
//! Trellis uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("trellis_core::model=trace,trellis::collection=debug")
//!     .init();
//! ```
//!
//! # Subscription Debugging
//!
//! ```
//! use trellis_core::logging::SubscriptionDebug;
//!
//! println!("{}", SubscriptionDebug::new());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::event::EmitterId;
use crate::subscription::{subscriptions, SubscriptionInfo};

/// Span names used throughout Trellis for tracing.
pub mod span_names {
    /// Event dispatch span.
    pub const TRIGGER: &str = "trigger";
    /// Attribute batch span.
    pub const SET: &str = "set_with";
    /// Collection reconciliation span.
    pub const RECONCILE: &str = "set";
    /// Persistence call span.
    pub const SYNC: &str = "trellis::sync";
    /// Performance measurement span.
    pub const PERF: &str = "trellis::perf";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "trellis_core";
    /// Event bus target.
    pub const EVENTS: &str = "trellis_core::events";
    /// Attribute store target.
    pub const MODEL: &str = "trellis_core::model";
    /// Subscription arena target.
    pub const SUBSCRIPTION: &str = "trellis_core::subscription";
    /// Ordered collection target.
    pub const COLLECTION: &str = "trellis::collection";
    /// Derived view target.
    pub const VIRTUAL_COLLECTION: &str = "trellis::virtual_collection";
    /// Persistence adapter target.
    pub const SYNC: &str = "trellis::sync";
}

/// Branch characters used by [`SubscriptionDebug`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
}

/// Renders the subscription arena grouped by listener.
///
/// ```text
/// Subscriptions (3 live):
/// emitter#4
/// ├── emitter#7 (refs: 2)
/// └── emitter#9 (refs: 1, interop)
/// emitter#12
/// └── emitter#7 (refs: 5)
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscriptionDebug {
    style: TreeStyle,
    listener: Option<EmitterId>,
}

impl SubscriptionDebug {
    /// Render every live subscription.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render only the subscriptions held by `listener`.
    pub fn for_listener(listener: EmitterId) -> Self {
        Self {
            listener: Some(listener),
            ..Self::default()
        }
    }

    /// Choose the branch characters.
    pub fn with_style(mut self, style: TreeStyle) -> Self {
        self.style = style;
        self
    }

    fn render(&self, infos: &[SubscriptionInfo], f: &mut impl fmt::Write) -> fmt::Result {
        let mut by_listener: BTreeMap<EmitterId, Vec<&SubscriptionInfo>> = BTreeMap::new();
        for info in infos {
            if self.listener.is_none_or(|id| id == info.listener) {
                by_listener.entry(info.listener).or_default().push(info);
            }
        }
        let total: usize = by_listener.values().map(Vec::len).sum();

        writeln!(f, "Subscriptions ({total} live):")?;
        if by_listener.is_empty() {
            return writeln!(f, "  (none)");
        }

        let (tee, corner) = match self.style {
            TreeStyle::Ascii => ("+--", "`--"),
            TreeStyle::Unicode => ("\u{251c}\u{2500}\u{2500}", "\u{2514}\u{2500}\u{2500}"),
        };
        for (listener, records) in by_listener {
            writeln!(f, "{listener}")?;
            let last = records.len() - 1;
            for (i, info) in records.into_iter().enumerate() {
                let branch = if i == last { corner } else { tee };
                write!(f, "{branch} {} (refs: {}", info.listenee, info.refcount)?;
                if info.interop {
                    f.write_str(", interop")?;
                }
                writeln!(f, ")")?;
            }
        }
        Ok(())
    }

    /// Render a given snapshot rather than the live arena.
    pub fn format_snapshot(&self, infos: &[SubscriptionInfo]) -> String {
        let mut output = String::new();
        // Writing into a String cannot fail.
        let _ = self.render(infos, &mut output);
        output
    }
}

impl fmt::Display for SubscriptionDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(&subscriptions(), f)
    }
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for timing rebuilds and reconciliations.
#[derive(Debug)]
pub struct PerfSpan {
    _span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Enter a new performance span.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::debug_span!(target: "trellis::perf", "perf", operation = name);
        Self {
            _span: span.entered(),
        }
    }
}
