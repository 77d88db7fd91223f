//! Core systems for Trellis.
//!
//! This crate provides the foundational reactive components that the
//! collection layer in `trellis` is built on:
//!
//! - **Event Bus**: Per-object publish/subscribe with a wildcard `"all"` event
//! - **Subscriptions**: Inversion-of-control listening tracked in an arena
//! - **Models**: Observable attribute stores with batch-scoped change tracking
//!
//! All propagation is synchronous: a `set` or `trigger` returns only after
//! every handler it caused has run.
//!
//! # Event Bus Example
//!
//! ```
//! use trellis_core::{Event, EventBus, Handler};
//! use std::sync::Arc;
//!
//! let source = Arc::new(EventBus::new());
//! let observer = EventBus::new();
//!
//! observer
//!     .listen_to(&source, "ping", &Handler::new(|event| {
//!         println!("received {}", event.name());
//!     }))
//!     .unwrap();
//!
//! source.trigger(&Event::named("ping"));
//!
//! // Releases every relationship without needing a handle to `source`.
//! observer.stop_listening_all();
//! assert_eq!(observer.listening_count(), 0);
//! ```
//!
//! # Model Example
//!
//! ```
//! use trellis_core::{Handler, Model, ModelConfig, SetOptions};
//! use serde_json::json;
//!
//! let config = ModelConfig::builder()
//!     .default_value("done", false)
//!     .validate(|attrs, _| {
//!         let title = attrs.get("title").and_then(|t| t.as_str()).unwrap_or("");
//!         title.is_empty().then(|| json!("title is required"))
//!     })
//!     .build();
//!
//! let todo = Model::with_config(config, json!({"title": "write docs"}), SetOptions::new());
//! todo.events().on("change:done", &Handler::new(|event| {
//!     println!("{} fired", event.name());
//! }));
//!
//! todo.set(json!({"done": true}));
//! assert_eq!(todo.previous("done"), Some(json!(false)));
//!
//! let applied = todo.set_with(json!({"title": ""}), SetOptions::new().with_validate(true));
//! assert!(!applied);
//! assert_eq!(todo.validation_error(), Some(json!("title is required")));
//! ```

mod error;
mod event;
pub mod events;
pub mod logging;
pub mod model;
pub mod subscription;

pub use error::{EventError, Result, TrellisError};
pub use event::{ALL, Delta, EmitterId, Event, Payload, SyncMethod};
pub use events::{Emitter, EventBus, Handler};
pub use logging::{PerfSpan, SubscriptionDebug, TreeStyle};
pub use model::{
    Attributes, IntoAttributes, Model, ModelConfig, ModelConfigBuilder, ParseFn, SetOptions,
    ValidateFn,
};
pub use subscription::{subscriptions, subscriptions_of, SubscriptionId, SubscriptionInfo};

static_assertions::assert_impl_all!(EventBus: Send, Sync);
static_assertions::assert_impl_all!(Handler: Send, Sync, Clone);
static_assertions::assert_impl_all!(Event: Send, Sync, Clone);
