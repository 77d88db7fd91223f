//! Trellis - reactive models, collections and derived views.
//!
//! This is the umbrella crate. It re-exports everything from
//! `trellis-core` (event bus, subscriptions, models) and adds:
//!
//! - [`Collection`]: an ordered, indexed member set with reconciliation
//! - [`VirtualCollection`]: a filtered, optionally re-sorted live view
//! - [`sync`]: the persistence adapter contract and fetch/save/destroy
//!
//! # Example
//!
//! ```
//! use trellis::prelude::*;
//! use serde_json::json;
//!
//! let tasks = Collection::builder()
//!     .comparator(Comparator::attribute("priority"))
//!     .build();
//! let urgent = VirtualCollection::builder(&tasks)
//!     .filter(Filter::predicate(|task, _| {
//!         task.get("priority").and_then(|p| p.as_i64()).is_some_and(|p| p <= 1)
//!     }))
//!     .build();
//!
//! tasks.add(
//!     vec![
//!         json!({"id": 1, "priority": 3}),
//!         json!({"id": 2, "priority": 1}),
//!         json!({"id": 3, "priority": 0}),
//!     ],
//!     UpdateOptions::add(),
//! );
//!
//! assert_eq!(tasks.pluck("id"), vec![json!(3), json!(2), json!(1)]);
//! assert_eq!(urgent.pluck("id"), vec![json!(3), json!(2)]);
//!
//! tasks.get(1).unwrap().set(("priority", 1));
//! assert_eq!(urgent.len(), 3);
//! ```

pub use trellis_core::*;

pub mod collection;
pub mod prelude;
pub mod sync;
pub mod virtual_collection;

pub use collection::{
    Collection, CollectionBuilder, CollectionConfig, Comparator, Lookup, Member, UpdateOptions,
};
pub use sync::{
    CollectionSync, InMemoryAdapter, ModelSync, SyncAdapter, SyncError, SyncOptions, SyncResult,
    SyncTarget,
};
pub use virtual_collection::{Filter, ViewOptions, VirtualCollection, VirtualCollectionBuilder};
