//! Prelude module for Trellis.
//!
//! ```ignore
//! use trellis::prelude::*;
//! ```
//!
//! This provides access to:
//! - Events (`EventBus`, `Handler`, `Event`, `Payload`)
//! - Models (`Model`, `ModelConfig`, `SetOptions`)
//! - Collections and views (`Collection`, `VirtualCollection`, `Filter`)
//! - Persistence (`ModelSync`, `CollectionSync`, `SyncAdapter`)

// ============================================================================
// Events
// ============================================================================

pub use crate::{ALL, Delta, Emitter, EmitterId, Event, EventBus, Handler, Payload};

// ============================================================================
// Models
// ============================================================================

pub use crate::{Attributes, IntoAttributes, Model, ModelConfig, SetOptions};

// ============================================================================
// Collections and Views
// ============================================================================

pub use crate::collection::{Collection, Comparator, Lookup, Member, UpdateOptions};
pub use crate::virtual_collection::{Filter, VirtualCollection, VirtualCollectionBuilder};

// ============================================================================
// Persistence
// ============================================================================

pub use crate::sync::{CollectionSync, ModelSync, SyncAdapter, SyncOptions};
pub use crate::SyncMethod;
