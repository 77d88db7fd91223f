//! Event bus for Trellis.
//!
//! This module provides a per-object publish/subscribe mechanism with
//! inversion-of-control subscription tracking. Every observable object in
//! Trellis owns an [`EventBus`]; handlers are registered on it by event name
//! and invoked synchronously, in registration order, when the event is
//! triggered.
//!
//! # Key Types
//!
//! - [`EventBus`] - Registers handlers and dispatches events
//! - [`Handler`] - A shared callback; its identity is used by `off`
//! - [`Emitter`] - The narrow `on`/`off`/`trigger` surface used by `listen_to`
//!
//! # Dispatch Order
//!
//! `trigger("x")` invokes every handler bound to `"x"`, then every handler
//! bound to the wildcard [`ALL`] event. Both lists are captured before the
//! first handler runs: handlers registered during dispatch are not invoked by
//! the dispatch in progress, and handlers removed during dispatch still
//! complete it. Changes take effect from the next `trigger`.
//!
//! # Listening
//!
//! `a.listen_to(&b, "change", &handler)` registers `handler` on `b` and
//! records the `(a, b)` relationship in the subscription arena, so that
//! `a.stop_listening(None, None, None)` can release every relationship
//! without the caller holding a reference to `b`.
//!
//! # Example
//!
//! ```
//! use trellis_core::{Event, EventBus, Handler};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let count = Arc::new(AtomicUsize::new(0));
//!
//! let count_clone = count.clone();
//! let handler = Handler::new(move |_event| {
//!     count_clone.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.on("ping", &handler);
//! bus.trigger(&Event::named("ping"));
//! bus.off(Some("ping"), Some(&handler), None);
//! bus.trigger(&Event::named("ping"));
//!
//! assert_eq!(count.load(Ordering::SeqCst), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EventError;
use crate::event::{ALL, EmitterId, Event};
use crate::subscription::{arena, SubscriptionId};

/// A shared event callback.
///
/// Cloning a `Handler` shares the callback; two handlers are the same for
/// the purposes of [`EventBus::off`] only if one is a clone of the other.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&Event) + Send + Sync>);

impl Handler {
    /// Wrap a closure.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    /// Invoke the callback.
    #[inline]
    pub fn call(&self, event: &Event) {
        (self.0)(event);
    }

    /// Returns `true` if both handlers share the same callback.
    #[inline]
    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// The minimal surface an object must expose to be listened to.
///
/// Everything in Trellis implements this by delegating to its [`EventBus`]
/// and returning it from [`event_bus`](Self::event_bus). Foreign emitters
/// that only provide `on`/`off`/`trigger` are supported too; listening to
/// them falls back to manual reference counting in the subscription arena.
pub trait Emitter: Send + Sync + 'static {
    /// The identity used to key subscriptions.
    fn emitter_id(&self) -> EmitterId;

    /// Register `handler` for the event `name`.
    fn on(&self, name: &str, handler: Handler, context: Option<EmitterId>)
    -> Result<(), EventError>;

    /// Remove registrations matching every given filter.
    fn off(&self, names: Option<&str>, handler: Option<&Handler>, context: Option<EmitterId>);

    /// Dispatch an event.
    fn trigger(&self, event: &Event);

    /// The backing bus, if this emitter has one.
    fn event_bus(&self) -> Option<&EventBus> {
        None
    }
}

/// Internal storage for a single registration.
struct Registration {
    /// The callback as supplied by the caller; used for identity matching.
    callback: Handler,
    /// The listener on whose behalf this was registered, if any.
    context: Option<EmitterId>,
    /// The arena record this registration counts towards.
    subscription: Option<SubscriptionId>,
    /// `Some` for one-shot registrations; flips to `true` on first delivery.
    fired: Option<AtomicBool>,
}

impl Registration {
    fn matches(&self, handler: Option<&Handler>, context: Option<EmitterId>) -> bool {
        handler.is_none_or(|h| h.ptr_eq(&self.callback))
            && context.is_none_or(|c| self.context == Some(c))
    }
}

type HandlerMap = HashMap<String, Vec<Arc<Registration>>>;

/// A per-object publish/subscribe registry.
///
/// # Related Types
///
/// - [`Handler`] - What gets registered
/// - [`Emitter`] - What can be listened to
/// - [`crate::Model`] - Owns a bus and emits `"change"` events on it
pub struct EventBus {
    id: EmitterId,
    /// Registrations by event name, each list in registration order.
    handlers: Mutex<HandlerMap>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no registrations.
    pub fn new() -> Self {
        Self {
            id: EmitterId::next(),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// This bus's identity.
    pub fn id(&self) -> EmitterId {
        self.id
    }

    /// Register `handler` for one or more space-separated event names.
    pub fn on(&self, names: &str, handler: &Handler) {
        self.register(names, handler, None, None, false);
    }

    /// Register `handler` on behalf of `context`.
    ///
    /// `off(None, None, Some(context))` later removes exactly these.
    pub fn on_with_context(&self, names: &str, handler: &Handler, context: EmitterId) {
        self.register(names, handler, Some(context), None, false);
    }

    /// Register several `(names, handler)` pairs.
    pub fn on_map<'a, I>(&self, map: I)
    where
        I: IntoIterator<Item = (&'a str, &'a Handler)>,
    {
        for (names, handler) in map {
            self.register(names, handler, None, None, false);
        }
    }

    /// Register a handler that is removed before its first delivery.
    ///
    /// Each space-separated name gets its own independent one-shot.
    pub fn once(&self, names: &str, handler: &Handler) {
        self.register(names, handler, None, None, true);
    }

    fn register(
        &self,
        names: &str,
        handler: &Handler,
        context: Option<EmitterId>,
        subscription: Option<SubscriptionId>,
        once: bool,
    ) -> usize {
        let mut map = self.handlers.lock();
        let mut registered = 0;
        for name in names.split_whitespace() {
            map.entry(name.to_string())
                .or_default()
                .push(Arc::new(Registration {
                    callback: handler.clone(),
                    context,
                    subscription,
                    fired: once.then(|| AtomicBool::new(false)),
                }));
            registered += 1;
        }
        tracing::trace!(target: "trellis_core::events", bus = %self.id, names, registered, "registered handler");
        registered
    }

    /// Remove registrations matching every given filter.
    ///
    /// Calling with no filters at all is equivalent to [`off_all`](Self::off_all).
    pub fn off(&self, names: Option<&str>, handler: Option<&Handler>, context: Option<EmitterId>) {
        if names.is_none() && handler.is_none() && context.is_none() {
            self.off_all();
            return;
        }

        let removed = {
            let mut map = self.handlers.lock();
            let keys: Vec<String> = match names {
                Some(names) => names.split_whitespace().map(str::to_string).collect(),
                None => map.keys().cloned().collect(),
            };
            let mut removed = Vec::new();
            for key in keys {
                let Some(list) = map.get_mut(&key) else {
                    continue;
                };
                let (dropped, kept): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|reg| reg.matches(handler, context));
                *list = kept;
                if list.is_empty() {
                    map.remove(&key);
                }
                removed.extend(dropped);
            }
            removed
        };

        self.release_subscriptions(&removed);
    }

    /// Remove every registration and release every subscription referencing this bus.
    pub fn off_all(&self) {
        let removed: Vec<_> = self.handlers.lock().drain().flat_map(|(_, list)| list).collect();
        let detached = arena().lock().detach_listenee(self.id);
        tracing::trace!(target: "trellis_core::events", bus = %self.id, removed = removed.len(), detached = detached.len(), "removed all handlers");
        drop(detached);
        drop(removed);
    }

    fn release_subscriptions(&self, removed: &[Arc<Registration>]) {
        let released: Vec<_> = {
            let mut arena = arena().lock();
            removed
                .iter()
                .filter_map(|reg| reg.subscription)
                .filter_map(|id| arena.release(id))
                .collect()
        };
        drop(released);
    }

    fn remove_registration(&self, name: &str, target: &Arc<Registration>) {
        let removed = {
            let mut map = self.handlers.lock();
            let Some(list) = map.get_mut(name) else {
                return;
            };
            let Some(pos) = list.iter().position(|reg| Arc::ptr_eq(reg, target)) else {
                return;
            };
            let removed = list.remove(pos);
            if list.is_empty() {
                map.remove(name);
            }
            removed
        };
        self.release_subscriptions(std::slice::from_ref(&removed));
    }

    /// Dispatch an event to its handlers, then to the `"all"` handlers.
    ///
    /// Handlers run inline; a handler that panics propagates to the caller.
    #[tracing::instrument(skip_all, target = "trellis_core::events", level = "trace", fields(event = event.name()))]
    pub fn trigger(&self, event: &Event) {
        let name = event.name();
        let (specific, wildcard) = {
            let map = self.handlers.lock();
            let specific = map.get(name).cloned().unwrap_or_default();
            let wildcard = if name == ALL {
                Vec::new()
            } else {
                map.get(ALL).cloned().unwrap_or_default()
            };
            (specific, wildcard)
        };
        tracing::trace!(target: "trellis_core::events", specific = specific.len(), wildcard = wildcard.len(), "dispatching");

        for reg in &specific {
            self.invoke(name, reg, event);
        }
        for reg in &wildcard {
            self.invoke(ALL, reg, event);
        }
    }

    /// Dispatch a payload-less event.
    pub fn trigger_name(&self, name: &str) {
        self.trigger(&Event::named(name));
    }

    fn invoke(&self, list: &str, reg: &Arc<Registration>, event: &Event) {
        if let Some(fired) = &reg.fired {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            self.remove_registration(list, reg);
        }
        reg.callback.call(event);
    }

    /// Register `handler` on `other` and track the relationship.
    ///
    /// If `other` is not backed by an [`EventBus`] and rejects the
    /// registration, the tracking record is rolled back and the error
    /// returned.
    pub fn listen_to<E>(&self, other: &E, names: &str, handler: &Handler) -> Result<(), EventError>
    where
        E: Emitter + Clone,
    {
        self.listen(Arc::new(other.clone()), names, handler, false)
    }

    /// Like [`listen_to`](Self::listen_to), but each name fires at most once.
    pub fn listen_to_once<E>(
        &self,
        other: &E,
        names: &str,
        handler: &Handler,
    ) -> Result<(), EventError>
    where
        E: Emitter + Clone,
    {
        self.listen(Arc::new(other.clone()), names, handler, true)
    }

    fn listen(
        &self,
        target: Arc<dyn Emitter>,
        names: &str,
        handler: &Handler,
        once: bool,
    ) -> Result<(), EventError> {
        let count = names.split_whitespace().count();
        if count == 0 {
            return Ok(());
        }

        if let Some(bus) = target.event_bus() {
            let id = {
                let mut arena = arena().lock();
                let id = arena.acquire(self.id, &target, false);
                arena.retain(id, count);
                id
            };
            bus.register(names, handler, Some(self.id), Some(id), once);
            return Ok(());
        }

        let id = arena().lock().acquire(self.id, &target, true);
        let mut registered: Vec<(&str, Handler)> = Vec::with_capacity(count);
        for name in names.split_whitespace() {
            let callback = if once {
                once_guard(handler)
            } else {
                handler.clone()
            };
            if let Err(err) = target.on(name, callback.clone(), Some(self.id)) {
                self.roll_back(&target, id, &registered);
                tracing::warn!(target: "trellis_core::events", listener = %self.id, listenee = %target.emitter_id(), %err, "listen_to rolled back");
                return Err(err);
            }
            arena().lock().track_interop(id, name, &callback);
            registered.push((name, callback));
        }
        Ok(())
    }

    /// Undo the foreign registrations made by one failed `listen_to` call.
    fn roll_back(
        &self,
        target: &Arc<dyn Emitter>,
        id: SubscriptionId,
        registered: &[(&str, Handler)],
    ) {
        for (name, callback) in registered {
            target.off(Some(*name), Some(callback), Some(self.id));
        }
        let mut arena = arena().lock();
        let mut gone = Vec::new();
        for (name, callback) in registered {
            gone.extend(arena.forget_interop(id, Some(&[*name][..]), Some(callback)));
        }
        gone.extend(arena.discard_if_unused(id));
        drop(arena);
        drop(gone);
    }

    /// Release handlers this bus registered through `listen_to`.
    ///
    /// Every argument is an optional filter; with none, every relationship
    /// this bus holds is released.
    pub fn stop_listening(
        &self,
        other: Option<&dyn Emitter>,
        names: Option<&str>,
        handler: Option<&Handler>,
    ) {
        let targets = arena()
            .lock()
            .targets_of(self.id, other.map(Emitter::emitter_id));
        let name_list: Option<Vec<&str>> = names.map(|n| n.split_whitespace().collect());

        for listening in targets {
            listening.target.off(names, handler, Some(self.id));
            if listening.interop {
                let gone = arena()
                    .lock()
                    .forget_interop(listening.id, name_list.as_deref(), handler);
                drop(gone);
            }
        }
    }

    /// Release every relationship this bus holds.
    pub fn stop_listening_all(&self) {
        self.stop_listening(None, None, None);
    }

    /// Number of registrations for `name`, or across all names.
    pub fn handler_count(&self, name: Option<&str>) -> usize {
        let map = self.handlers.lock();
        match name {
            Some(name) => map.get(name).map_or(0, Vec::len),
            None => map.values().map(Vec::len).sum(),
        }
    }

    /// Number of emitters this bus is listening to.
    pub fn listening_count(&self) -> usize {
        arena().lock().listening_count(self.id)
    }

    /// Number of listeners holding a subscription to this bus.
    pub fn listener_count(&self) -> usize {
        arena().lock().listener_count(self.id)
    }

    /// Live handler count of this bus's subscription to `other`.
    pub fn subscription_refcount(&self, other: &dyn Emitter) -> usize {
        arena().lock().refcount(self.id, other.emitter_id())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop_listening_all();
        self.off_all();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.id)
            .field("handlers", &self.handler_count(None))
            .finish()
    }
}

/// A standalone shared bus can be listened to like any other emitter.
impl Emitter for Arc<EventBus> {
    fn emitter_id(&self) -> EmitterId {
        self.id
    }

    fn on(
        &self,
        name: &str,
        handler: Handler,
        context: Option<EmitterId>,
    ) -> Result<(), EventError> {
        self.register(name, &handler, context, None, false);
        Ok(())
    }

    fn off(&self, names: Option<&str>, handler: Option<&Handler>, context: Option<EmitterId>) {
        EventBus::off(self, names, handler, context);
    }

    fn trigger(&self, event: &Event) {
        EventBus::trigger(self, event);
    }

    fn event_bus(&self) -> Option<&EventBus> {
        Some(self)
    }
}

/// Wrap `handler` so it delivers at most one event.
fn once_guard(handler: &Handler) -> Handler {
    let inner = handler.clone();
    let fired = AtomicBool::new(false);
    Handler::new(move |event| {
        if !fired.swap(true, Ordering::SeqCst) {
            inner.call(event);
        }
    })
}
