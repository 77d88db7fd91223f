//! Subscription arena for inversion-of-control listening.
//!
//! When one emitter listens to another via [`EventBus::listen_to`], the
//! relationship is recorded here rather than as a pair of references between
//! the two objects.
//!
//! # How It Works
//!
//! 1. `listen_to` acquires the record for the `(listener, listenee)` pair,
//!    creating it on first use.
//!
//! 2. Every handler registered through that pair bumps the record's
//!    reference count. Handlers registered on an [`EventBus`] remember the
//!    record's [`SubscriptionId`] so that removing them from either side
//!    (`off` on the listenee, `stop_listening` on the listener) releases the
//!    count.
//!
//! 3. When the count reaches zero the record is removed, which also drops the
//!    listener's handle to the listenee.
//!
//! Emitters that are not backed by an `EventBus` cannot report removals back,
//! so their records track the registered handlers themselves and are cleaned
//! up only through `stop_listening`.
//!
//! [`EventBus`]: crate::EventBus
//! [`EventBus::listen_to`]: crate::EventBus::listen_to

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::event::EmitterId;
use crate::events::{Emitter, Handler};

new_key_type! {
    /// A key into the global subscription arena.
    pub struct SubscriptionId;
}

/// Global subscription arena.
static SUBSCRIPTIONS: OnceLock<Mutex<SubscriptionArena>> = OnceLock::new();

/// Access the global subscription arena.
///
/// Callers must not drop a removed [`Subscription`] while holding the lock:
/// its target handle may be the last owner of another emitter whose teardown
/// touches the arena again.
pub(crate) fn arena() -> &'static Mutex<SubscriptionArena> {
    SUBSCRIPTIONS.get_or_init(|| Mutex::new(SubscriptionArena::new()))
}

/// Handlers registered on an emitter that is not backed by an `EventBus`.
type InteropEntries = Vec<(String, Handler)>;

/// One listener-to-listenee relationship.
pub(crate) struct Subscription {
    listener: EmitterId,
    listenee: EmitterId,
    /// Handle used by the listener to unregister its handlers.
    target: Arc<dyn Emitter>,
    /// Handlers registered on the listenee's bus through this record.
    count: usize,
    /// Present only for emitters without an `EventBus`.
    interop: Option<InteropEntries>,
}

impl Subscription {
    fn refcount(&self) -> usize {
        match &self.interop {
            Some(entries) => entries.len(),
            None => self.count,
        }
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            listener: self.listener,
            listenee: self.listenee,
            refcount: self.refcount(),
            interop: self.interop.is_some(),
        }
    }
}

/// A read-only snapshot of one subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// The emitter that called `listen_to`.
    pub listener: EmitterId,
    /// The emitter being listened to.
    pub listenee: EmitterId,
    /// Number of live handlers registered through this relationship.
    pub refcount: usize,
    /// Whether the listenee is a foreign emitter tracked by manual counting.
    pub interop: bool,
}

/// A target the listener holds while a subscription exists.
pub(crate) struct ListenTarget {
    pub(crate) id: SubscriptionId,
    pub(crate) target: Arc<dyn Emitter>,
    pub(crate) interop: bool,
}

/// Arena of subscription records keyed by `(listener, listenee)`.
pub(crate) struct SubscriptionArena {
    records: SlotMap<SubscriptionId, Subscription>,
    by_pair: HashMap<(EmitterId, EmitterId), SubscriptionId>,
}

impl SubscriptionArena {
    fn new() -> Self {
        Self {
            records: SlotMap::with_key(),
            by_pair: HashMap::new(),
        }
    }

    /// Find or create the record for `listener` listening to `target`.
    pub(crate) fn acquire(
        &mut self,
        listener: EmitterId,
        target: &Arc<dyn Emitter>,
        interop: bool,
    ) -> SubscriptionId {
        let listenee = target.emitter_id();
        if let Some(&id) = self.by_pair.get(&(listener, listenee)) {
            return id;
        }
        let id = self.records.insert(Subscription {
            listener,
            listenee,
            target: Arc::clone(target),
            count: 0,
            interop: interop.then(Vec::new),
        });
        self.by_pair.insert((listener, listenee), id);
        tracing::trace!(target: "trellis_core::subscription", %listener, %listenee, interop, "subscription created");
        id
    }

    /// Record `n` more handlers registered through `id`.
    pub(crate) fn retain(&mut self, id: SubscriptionId, n: usize) {
        if let Some(record) = self.records.get_mut(id) {
            record.count += n;
        }
    }

    /// Record one handler removed; returns the record if it is now unused.
    #[must_use]
    pub(crate) fn release(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let record = self.records.get_mut(id)?;
        record.count = record.count.saturating_sub(1);
        if record.count == 0 {
            self.remove(id)
        } else {
            None
        }
    }

    /// Remove the record if nothing is registered through it.
    ///
    /// Used to roll back `acquire` when registration on the listenee fails.
    #[must_use]
    pub(crate) fn discard_if_unused(&mut self, id: SubscriptionId) -> Option<Subscription> {
        match self.records.get(id) {
            Some(record) if record.refcount() == 0 => self.remove(id),
            _ => None,
        }
    }

    /// Track a handler registered on a foreign emitter.
    pub(crate) fn track_interop(&mut self, id: SubscriptionId, name: &str, handler: &Handler) {
        if let Some(entries) = self.records.get_mut(id).and_then(|r| r.interop.as_mut()) {
            entries.push((name.to_string(), handler.clone()));
        }
    }

    /// Forget foreign handlers matching the filters; returns the record once empty.
    #[must_use]
    pub(crate) fn forget_interop(
        &mut self,
        id: SubscriptionId,
        names: Option<&[&str]>,
        handler: Option<&Handler>,
    ) -> Option<Subscription> {
        let entries = self.records.get_mut(id)?.interop.as_mut()?;
        entries.retain(|(name, registered)| {
            let name_matches = names.is_none_or(|names| names.contains(&name.as_str()));
            let handler_matches = handler.is_none_or(|h| h.ptr_eq(registered));
            !(name_matches && handler_matches)
        });
        if entries.is_empty() {
            self.remove(id)
        } else {
            None
        }
    }

    /// Every target `listener` currently holds, optionally restricted to one listenee.
    pub(crate) fn targets_of(
        &self,
        listener: EmitterId,
        listenee: Option<EmitterId>,
    ) -> Vec<ListenTarget> {
        let matches = |record: &Subscription| {
            record.listener == listener && listenee.is_none_or(|id| record.listenee == id)
        };
        self.records
            .iter()
            .filter(|(_, record)| matches(record))
            .map(|(id, record)| ListenTarget {
                id,
                target: Arc::clone(&record.target),
                interop: record.interop.is_some(),
            })
            .collect()
    }

    /// Remove every bus-backed record whose listenee is `listenee`.
    #[must_use]
    pub(crate) fn detach_listenee(&mut self, listenee: EmitterId) -> Vec<Subscription> {
        let ids: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.listenee == listenee && r.interop.is_none())
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let record = self.records.remove(id)?;
        self.by_pair.remove(&(record.listener, record.listenee));
        tracing::trace!(
            target: "trellis_core::subscription",
            listener = %record.listener,
            listenee = %record.listenee,
            "subscription released"
        );
        Some(record)
    }

    /// Number of records where `listener` is the listening side.
    pub(crate) fn listening_count(&self, listener: EmitterId) -> usize {
        self.records.values().filter(|r| r.listener == listener).count()
    }

    /// Number of records where `listenee` is the listened-to side.
    pub(crate) fn listener_count(&self, listenee: EmitterId) -> usize {
        self.records.values().filter(|r| r.listenee == listenee).count()
    }

    /// Reference count of the `(listener, listenee)` record, zero if absent.
    pub(crate) fn refcount(&self, listener: EmitterId, listenee: EmitterId) -> usize {
        self.by_pair
            .get(&(listener, listenee))
            .and_then(|&id| self.records.get(id))
            .map_or(0, Subscription::refcount)
    }

    /// Snapshot every record, ordered by listener then listenee.
    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self.records.values().map(Subscription::info).collect();
        infos.sort_by_key(|info| (info.listener, info.listenee));
        infos
    }
}

/// Snapshot all live subscriptions in the process.
pub fn subscriptions() -> Vec<SubscriptionInfo> {
    arena().lock().snapshot()
}

/// Snapshot the subscriptions held by one listener.
pub fn subscriptions_of(listener: EmitterId) -> Vec<SubscriptionInfo> {
    arena()
        .lock()
        .snapshot()
        .into_iter()
        .filter(|info| info.listener == listener)
        .collect()
}
