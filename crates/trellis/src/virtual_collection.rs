//! Filtered, optionally re-sorted views over a collection.
//!
//! A [`VirtualCollection`] holds no data of its own. It listens to its
//! parent [`Collection`] and keeps an incrementally maintained sequence of
//! the parent's members that pass its [`Filter`], ordered either like the
//! parent or by its own [`Comparator`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use trellis_core::{
    ALL, Attributes, Delta, Emitter, EmitterId, Event, EventBus, EventError, Handler,
    IntoAttributes, Model, Payload, PerfSpan,
};

use crate::collection::{
    matches_attributes, Collection, Comparator, Lookup, Member, UpdateOptions,
};

/// Decides whether a member belongs in a view. Receives the member's index
/// in the parent.
pub type PredicateFn = dyn Fn(&Model, usize) -> bool + Send + Sync;

/// The acceptance rule of a [`VirtualCollection`].
#[derive(Clone, Default)]
pub enum Filter {
    /// Accept every member.
    #[default]
    All,
    /// Accept members for which the predicate returns `true`.
    Predicate(Arc<PredicateFn>),
    /// Accept members whose attributes include every listed pair.
    Attributes(Attributes),
}

impl Filter {
    /// Filter by predicate.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Model, usize) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Filter by attribute equality.
    pub fn attributes(attrs: impl IntoAttributes) -> Self {
        Self::Attributes(attrs.into_attributes())
    }

    /// Returns `true` if `model`, found at `index` in the parent, is accepted.
    pub fn accepts(&self, model: &Model, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::Predicate(predicate) => predicate(model, index),
            Self::Attributes(attrs) => matches_attributes(model, attrs),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("Filter::All"),
            Self::Predicate(_) => f.write_str("Filter::Predicate(..)"),
            Self::Attributes(attrs) => f.debug_tuple("Filter::Attributes").field(attrs).finish(),
        }
    }
}

/// Construction options for a [`VirtualCollection`].
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    /// Which parent members the view holds.
    pub filter: Filter,
    /// Own ordering; `None` mirrors the parent's order.
    pub comparator: Option<Comparator>,
}

/// Builder for [`VirtualCollection`].
#[derive(Debug, Default)]
pub struct VirtualCollectionBuilder {
    parent: Option<Collection>,
    options: ViewOptions,
}

impl VirtualCollectionBuilder {
    /// Start a view over `parent`.
    pub fn new(parent: &Collection) -> Self {
        Self {
            parent: Some(parent.clone()),
            options: ViewOptions::default(),
        }
    }

    /// Start a view with no parent yet.
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Set the acceptance rule.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.options.filter = filter;
        self
    }

    /// Order the view by its own comparator.
    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.options.comparator = Some(comparator);
        self
    }

    /// Build the view and index the parent's current members.
    pub fn build(self) -> VirtualCollection {
        VirtualCollection::with_options(self.parent.as_ref(), self.options)
    }
}

#[derive(Default)]
struct ViewState {
    parent: Option<Collection>,
    filter: Filter,
    comparator: Option<Comparator>,
    models: Vec<Model>,
    members: HashSet<String>,
    /// Members removed since the parent's last `"update"`.
    pending_removed: Vec<Model>,
}

impl ViewState {
    fn position(&self, model: &Model) -> Option<usize> {
        if !self.members.contains(model.cid()) {
            return None;
        }
        self.models.iter().position(|m| m.ptr_eq(model))
    }
}

struct ViewInner {
    bus: EventBus,
    state: Mutex<ViewState>,
    /// Registered on the parent's `"all"` event through `listen_to`.
    parent_handler: Handler,
}

/// A derived, read-only projection of a [`Collection`].
///
/// The view reacts to parent events one member at a time: accepted
/// additions are inserted at their ordered position, removals are
/// extracted, and a `"change"` re-evaluates acceptance for that member
/// alone. Only `"reset"`, a new filter or a new parent rebuild the whole
/// sequence.
///
/// Iterating the view never calls the filter.
///
/// # Example
///
/// ```
/// use trellis::{Collection, Filter, UpdateOptions, VirtualCollectionBuilder};
/// use serde_json::json;
///
/// let todos = Collection::with_models(vec![
///     json!({"id": 1, "done": false}),
///     json!({"id": 2, "done": true}),
/// ]);
/// let open = VirtualCollectionBuilder::new(&todos)
///     .filter(Filter::attributes(json!({"done": false})))
///     .build();
/// assert_eq!(open.len(), 1);
///
/// todos.get(2).unwrap().set(json!({"done": false}));
/// assert_eq!(open.len(), 2);
///
/// todos.add(vec![json!({"id": 3, "done": true})], UpdateOptions::add());
/// assert_eq!(open.len(), 2);
/// ```
#[derive(Clone)]
pub struct VirtualCollection {
    inner: Arc<ViewInner>,
}

static_assertions::assert_impl_all!(VirtualCollection: Send, Sync);

impl VirtualCollection {
    /// A view over `parent` that accepts everything in parent order.
    pub fn new(parent: &Collection) -> Self {
        VirtualCollectionBuilder::new(parent).build()
    }

    /// Start building a view over `parent`.
    pub fn builder(parent: &Collection) -> VirtualCollectionBuilder {
        VirtualCollectionBuilder::new(parent)
    }

    /// Create a view from explicit options.
    pub fn with_options(parent: Option<&Collection>, options: ViewOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ViewInner>| {
            let weak = weak.clone();
            let parent_handler = Handler::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    VirtualCollection { inner }.on_parent_event(event);
                }
            });
            ViewInner {
                bus: EventBus::new(),
                state: Mutex::new(ViewState {
                    filter: options.filter,
                    comparator: options.comparator,
                    ..ViewState::default()
                }),
                parent_handler,
            }
        });
        let view = Self { inner };
        if let Some(parent) = parent {
            view.attach(parent.clone());
            view.rebuild();
        }
        view
    }

    /// The view's identity.
    pub fn id(&self) -> EmitterId {
        self.inner.bus.id()
    }

    /// The view's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The current parent.
    pub fn parent(&self) -> Option<Collection> {
        self.inner.state.lock().parent.clone()
    }

    /// The current acceptance rule.
    pub fn current_filter(&self) -> Filter {
        self.inner.state.lock().filter.clone()
    }

    /// The view's own comparator.
    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.state.lock().comparator.clone()
    }

    /// Switch to another parent, or detach with `None`.
    ///
    /// The old parent is fully unsubscribed. The view is rebuilt and
    /// announces the new content with `"reset"`.
    pub fn set_parent(&self, parent: Option<&Collection>) {
        let old = self.inner.state.lock().parent.take();
        if let Some(old) = &old {
            self.inner
                .bus
                .stop_listening(Some(old as &dyn Emitter), None, None);
        }
        if let Some(parent) = parent {
            self.attach(parent.clone());
        }
        tracing::debug!(
            target: "trellis::virtual_collection",
            view = %self.id(),
            old = ?old.as_ref().map(Collection::id),
            new = ?parent.map(Collection::id),
            "re-parented"
        );
        let previous = self.rebuild();
        self.trigger_reset(previous);
    }

    fn attach(&self, parent: Collection) {
        if let Err(err) = self
            .inner
            .bus
            .listen_to(&parent, ALL, &self.inner.parent_handler)
        {
            tracing::warn!(target: "trellis::virtual_collection", view = %self.id(), %err, "could not listen to parent");
        }
        self.inner.state.lock().parent = Some(parent);
    }

    /// Replace the acceptance rule, rebuild, then fire `"filter"` and `"reset"`.
    pub fn update_filter(&self, filter: Filter) {
        self.inner.state.lock().filter = filter;
        let previous = self.rebuild();
        self.inner
            .bus
            .trigger(&Event::new("filter", Payload::Filter { source: self.id() }));
        self.trigger_reset(previous);
    }

    /// Replace the view's own comparator and reorder.
    ///
    /// With `None` the view goes back to mirroring the parent's order.
    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.inner.state.lock().comparator = comparator;
        self.reorder();
    }

    /// Re-sort by the view's own comparator and fire `"sort"`.
    ///
    /// # Panics
    ///
    /// Panics if the view has no comparator of its own.
    pub fn sort(&self) {
        if self.comparator().is_none() {
            panic!("cannot sort a view without a comparator");
        }
        self.reorder();
    }

    fn reorder(&self) {
        let (mut models, comparator, parent, members) = {
            let state = self.inner.state.lock();
            (
                state.models.clone(),
                state.comparator.clone(),
                state.parent.clone(),
                state.members.clone(),
            )
        };
        match (&comparator, &parent) {
            (Some(comparator), _) => comparator.sort(&mut models),
            (None, Some(parent)) => models = in_parent_order(parent, &members),
            (None, None) => {}
        }
        self.inner.state.lock().models = models;
        self.inner
            .bus
            .trigger(&Event::new("sort", Payload::Sort { source: self.id() }));
    }

    /// Re-derive the whole sequence from the parent. Returns the old one.
    fn rebuild(&self) -> Vec<Model> {
        let _span = PerfSpan::new("virtual_collection_rebuild");
        let (parent, filter, comparator) = {
            let state = self.inner.state.lock();
            (state.parent.clone(), state.filter.clone(), state.comparator.clone())
        };
        let candidates = parent.as_ref().map(Collection::models).unwrap_or_default();
        let mut models: Vec<Model> = candidates
            .into_iter()
            .enumerate()
            .filter(|(index, model)| filter.accepts(model, *index))
            .map(|(_, model)| model)
            .collect();
        if let Some(comparator) = &comparator {
            comparator.sort(&mut models);
        }

        tracing::debug!(target: "trellis::virtual_collection", view = %self.id(), len = models.len(), "rebuilt");
        let mut state = self.inner.state.lock();
        state.members = models.iter().map(|m| m.cid().to_string()).collect();
        state.pending_removed.clear();
        std::mem::replace(&mut state.models, models)
    }

    fn trigger_reset(&self, previous: Vec<Model>) {
        self.inner.bus.trigger(&Event::new(
            "reset",
            Payload::Reset {
                source: self.id(),
                previous,
            },
        ));
    }

    fn on_parent_event(&self, event: &Event) {
        match (event.name(), event.payload()) {
            ("add", Payload::Added { model, .. }) => self.on_add(model),
            ("remove", Payload::Removed { model, .. }) => self.on_remove(model),
            ("change", Payload::Model { model }) => self.on_change(model, event),
            ("reset", _) => {
                let previous = self.rebuild();
                self.trigger_reset(previous);
            }
            ("sort", _) => self.on_sort(),
            ("update", Payload::Update { delta, .. }) => self.on_update(delta),
            ("request" | "sync" | "error", _) => {
                if self.originates_in_view(event) {
                    self.inner.bus.trigger(event);
                }
            }
            (_, _) => {
                if event.model().is_some_and(|model| self.contains(model)) {
                    self.inner.bus.trigger(event);
                }
            }
        }
    }

    /// Sync events from the parent itself or from a member the view holds.
    fn originates_in_view(&self, event: &Event) -> bool {
        let Some(source) = event.source() else {
            return false;
        };
        let state = self.inner.state.lock();
        state.parent.as_ref().is_some_and(|parent| parent.id() == source)
            || state.models.iter().any(|model| model.events().id() == source)
    }

    fn on_add(&self, model: &Model) {
        if self.contains(model) {
            return;
        }
        let Some(parent) = self.parent() else {
            return;
        };
        let Some(parent_index) = parent.index_of(model) else {
            return;
        };
        if self.current_filter().accepts(model, parent_index) {
            self.insert(model, &parent);
        }
    }

    /// Insert an accepted member at its ordered position and announce it.
    fn insert(&self, model: &Model, parent: &Collection) {
        let (snapshot, comparator) = {
            let state = self.inner.state.lock();
            (state.models.clone(), state.comparator.clone())
        };
        let index = match &comparator {
            Some(comparator) => comparator.upper_bound(&snapshot, model),
            None => {
                let positions = parent_positions(parent);
                let target = positions.get(model.cid()).copied().unwrap_or(usize::MAX);
                snapshot.partition_point(|other| {
                    positions.get(other.cid()).copied().unwrap_or(usize::MAX) < target
                })
            }
        };

        let index = {
            let mut state = self.inner.state.lock();
            let index = index.min(state.models.len());
            state.models.insert(index, model.clone());
            state.members.insert(model.cid().to_string());
            index
        };
        tracing::trace!(target: "trellis::virtual_collection", view = %self.id(), cid = model.cid(), index, "member accepted");

        self.inner.bus.trigger(&Event::new(
            "add",
            Payload::Added {
                model: model.clone(),
                source: self.id(),
                index: Some(index),
            },
        ));
        if comparator.is_some() {
            self.inner
                .bus
                .trigger(&Event::new("sort", Payload::Sort { source: self.id() }));
        }
    }

    /// Extract a member and announce it. Returns `false` if it was absent.
    fn extract(&self, model: &Model, track: bool) -> bool {
        let index = {
            let mut state = self.inner.state.lock();
            let Some(index) = state.position(model) else {
                return false;
            };
            state.models.remove(index);
            state.members.remove(model.cid());
            if track {
                state.pending_removed.push(model.clone());
            }
            index
        };
        tracing::trace!(target: "trellis::virtual_collection", view = %self.id(), cid = model.cid(), index, "member dropped");

        self.inner.bus.trigger(&Event::new(
            "remove",
            Payload::Removed {
                model: model.clone(),
                source: self.id(),
                index,
            },
        ));
        true
    }

    fn on_remove(&self, model: &Model) {
        self.extract(model, true);
    }

    fn on_change(&self, model: &Model, event: &Event) {
        let Some(parent) = self.parent() else {
            return;
        };
        let Some(parent_index) = parent.index_of(model) else {
            return;
        };
        let accepted = self.current_filter().accepts(model, parent_index);
        match (self.contains(model), accepted) {
            (true, true) => {
                self.reposition(model);
                self.inner.bus.trigger(event);
            }
            (false, true) => self.insert(model, &parent),
            (true, false) => {
                self.extract(model, false);
            }
            (false, false) => {}
        }
    }

    /// Move a changed member if the view's comparator now places it elsewhere.
    fn reposition(&self, model: &Model) {
        let Some(comparator) = self.comparator() else {
            return;
        };
        let (mut rest, old_index) = {
            let state = self.inner.state.lock();
            let Some(index) = state.position(model) else {
                return;
            };
            let mut rest = state.models.clone();
            rest.remove(index);
            (rest, index)
        };
        let fits = (old_index == 0 || comparator.ordering(&rest[old_index - 1], model).is_le())
            && rest
                .get(old_index)
                .is_none_or(|next| comparator.ordering(model, next).is_le());
        if fits {
            return;
        }

        let new_index = comparator.upper_bound(&rest, model);
        rest.insert(new_index, model.clone());
        self.inner.state.lock().models = rest;
        self.inner
            .bus
            .trigger(&Event::new("sort", Payload::Sort { source: self.id() }));
    }

    fn on_sort(&self) {
        if self.comparator().is_some() {
            return;
        }
        self.reorder();
    }

    fn on_update(&self, delta: &Delta) {
        let pending = std::mem::take(&mut self.inner.state.lock().pending_removed);
        let local = Delta {
            added: delta
                .added
                .iter()
                .filter(|m| self.contains(m))
                .cloned()
                .collect(),
            removed: pending
                .into_iter()
                .filter(|m| delta.removed.iter().any(|r| r.ptr_eq(m)))
                .collect(),
            merged: delta
                .merged
                .iter()
                .filter(|m| self.contains(m))
                .cloned()
                .collect(),
        };
        if local.is_empty() {
            return;
        }
        self.inner.bus.trigger(&Event::new(
            "update",
            Payload::Update {
                source: self.id(),
                delta: local,
            },
        ));
    }

    /// Add members to the parent.
    pub fn add<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        match self.parent_for("add") {
            Some(parent) => parent.add(members, options),
            None => Vec::new(),
        }
    }

    /// Remove members from the parent.
    pub fn remove<I, L>(&self, targets: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = L>,
        L: Into<Lookup>,
    {
        match self.parent_for("remove") {
            Some(parent) => parent.remove(targets, options),
            None => Vec::new(),
        }
    }

    /// Reconcile the parent against `members`.
    pub fn set<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        match self.parent_for("set") {
            Some(parent) => parent.set(members, options),
            None => Vec::new(),
        }
    }

    /// Reset the parent.
    pub fn reset<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        match self.parent_for("reset") {
            Some(parent) => parent.reset(members, options),
            None => Vec::new(),
        }
    }

    pub(crate) fn parent_for(&self, operation: &'static str) -> Option<Collection> {
        let parent = self.parent();
        if parent.is_none() {
            tracing::warn!(target: "trellis::virtual_collection", view = %self.id(), operation, "view has no parent");
        }
        parent
    }

    /// Returns `true` if `model` is in the view.
    pub fn contains(&self, model: &Model) -> bool {
        self.inner.state.lock().members.contains(model.cid())
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.state.lock().models.len()
    }

    /// Returns `true` if the view holds nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().models.is_empty()
    }

    /// A snapshot of the members in view order.
    pub fn models(&self) -> Vec<Model> {
        self.inner.state.lock().models.clone()
    }

    /// The member at `index`; negative indices count from the end.
    pub fn at(&self, index: isize) -> Option<Model> {
        let state = self.inner.state.lock();
        let len = state.models.len() as isize;
        let index = if index < 0 { index + len } else { index };
        usize::try_from(index)
            .ok()
            .and_then(|i| state.models.get(i))
            .cloned()
    }

    /// Find a member through the parent's indexes.
    pub fn get(&self, lookup: impl Into<Lookup>) -> Option<Model> {
        self.parent()?.get(lookup).filter(|model| self.contains(model))
    }

    /// Position of `model` in the view.
    pub fn index_of(&self, model: &Model) -> Option<usize> {
        self.inner.state.lock().position(model)
    }

    /// The first member.
    pub fn first(&self) -> Option<Model> {
        self.inner.state.lock().models.first().cloned()
    }

    /// The last member.
    pub fn last(&self) -> Option<Model> {
        self.inner.state.lock().models.last().cloned()
    }

    /// Visit every member in view order.
    pub fn each(&self, mut f: impl FnMut(&Model, usize)) {
        for (i, model) in self.models().iter().enumerate() {
            f(model, i);
        }
    }

    /// Map every member in view order.
    pub fn map<T>(&self, mut f: impl FnMut(&Model, usize) -> T) -> Vec<T> {
        self.models()
            .iter()
            .enumerate()
            .map(|(i, model)| f(model, i))
            .collect()
    }

    /// Members accepted by `predicate`.
    pub fn filter(&self, mut predicate: impl FnMut(&Model) -> bool) -> Vec<Model> {
        self.models().into_iter().filter(|m| predicate(m)).collect()
    }

    /// The first member accepted by `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&Model) -> bool) -> Option<Model> {
        self.models().into_iter().find(|m| predicate(m))
    }

    /// Members whose attributes include every pair in `attrs`.
    pub fn where_attrs(&self, attrs: &Attributes) -> Vec<Model> {
        self.filter(|model| matches_attributes(model, attrs))
    }

    /// The first member whose attributes include every pair in `attrs`.
    pub fn find_where(&self, attrs: &Attributes) -> Option<Model> {
        self.find(|model| matches_attributes(model, attrs))
    }

    /// One attribute from every member; null where absent.
    pub fn pluck(&self, attr: &str) -> Vec<Value> {
        self.map(|model, _| model.get(attr).unwrap_or(Value::Null))
    }

    /// Every member's attributes as a JSON array.
    pub fn to_json(&self) -> Value {
        Value::Array(self.map(|model, _| model.to_json()))
    }
}

fn parent_positions(parent: &Collection) -> HashMap<String, usize> {
    parent
        .models()
        .iter()
        .enumerate()
        .map(|(i, model)| (model.cid().to_string(), i))
        .collect()
}

/// The members of `members` in their current parent order.
fn in_parent_order(parent: &Collection, members: &HashSet<String>) -> Vec<Model> {
    parent
        .models()
        .into_iter()
        .filter(|model| members.contains(model.cid()))
        .collect()
}

impl fmt::Debug for VirtualCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("VirtualCollection")
            .field("id", &self.inner.bus.id())
            .field("parent", &state.parent.as_ref().map(Collection::id))
            .field("filter", &state.filter)
            .field("comparator", &state.comparator)
            .field("len", &state.models.len())
            .finish()
    }
}

impl Emitter for VirtualCollection {
    fn emitter_id(&self) -> EmitterId {
        self.inner.bus.id()
    }

    fn on(&self, name: &str, handler: Handler, context: Option<EmitterId>) -> Result<(), EventError> {
        match context {
            Some(context) => self.inner.bus.on_with_context(name, &handler, context),
            None => self.inner.bus.on(name, &handler),
        }
        Ok(())
    }

    fn off(&self, names: Option<&str>, handler: Option<&Handler>, context: Option<EmitterId>) {
        self.inner.bus.off(names, handler, context);
    }

    fn trigger(&self, event: &Event) {
        self.inner.bus.trigger(event);
    }

    fn event_bus(&self) -> Option<&EventBus> {
        Some(&self.inner.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(view: &VirtualCollection) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        view.events().on(
            ALL,
            &Handler::new(move |event| log_clone.lock().push(event.name().to_string())),
        );
        log
    }

    fn ids(view: &VirtualCollection) -> Vec<i64> {
        view.pluck("id").iter().filter_map(Value::as_i64).collect()
    }

    fn even(model: &Model, _: usize) -> bool {
        model
            .get("id")
            .and_then(|id| id.as_i64())
            .is_some_and(|id| id % 2 == 0)
    }

    fn numbered(range: std::ops::RangeInclusive<i64>) -> Vec<Value> {
        range.map(|id| json!({ "id": id })).collect()
    }

    #[test]
    fn test_initial_content_follows_parent_order() {
        let parent = Collection::with_models(numbered(1..=6));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        assert_eq!(ids(&view), vec![2, 4, 6]);
        assert!(view.parent().unwrap().ptr_eq(&parent));
    }

    #[test]
    fn test_parent_add_inserts_in_parent_order() {
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let log = record(&view);

        parent.add(vec![json!({"id": 10})], UpdateOptions::add().with_at(1));
        parent.add(vec![json!({"id": 11})], UpdateOptions::add());

        assert_eq!(ids(&view), vec![10, 2, 4]);
        assert_eq!(*log.lock(), vec!["add", "update"]);
    }

    #[test]
    fn test_own_comparator_orders_and_announces_sort() {
        let parent = Collection::with_models(vec![json!({"id": 1, "rank": 3}), json!({"id": 2, "rank": 1})]);
        let view = VirtualCollection::builder(&parent)
            .comparator(Comparator::attribute("rank"))
            .build();
        assert_eq!(ids(&view), vec![2, 1]);
        let log = record(&view);

        parent.add(vec![json!({"id": 3, "rank": 2})], UpdateOptions::add());

        assert_eq!(ids(&view), vec![2, 3, 1]);
        assert_eq!(*log.lock(), vec!["add", "sort", "update"]);
    }

    #[test]
    fn test_parent_remove_reports_view_index() {
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let removed_at = Arc::new(Mutex::new(Vec::new()));
        let removed_clone = removed_at.clone();
        view.events().on(
            "remove",
            &Handler::new(move |event| {
                if let Payload::Removed { index, .. } = event.payload() {
                    removed_clone.lock().push(*index);
                }
            }),
        );

        parent.remove([4], UpdateOptions::set());
        parent.remove([1], UpdateOptions::set());

        assert_eq!(*removed_at.lock(), vec![1]);
        assert_eq!(ids(&view), vec![2]);
    }

    #[test]
    fn test_change_moves_members_in_and_out() {
        let parent = Collection::with_models(vec![json!({"id": 1, "done": false}), json!({"id": 2, "done": true})]);
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::attributes(json!({"done": false})))
            .build();
        let log = record(&view);

        parent.get(2).unwrap().set(("done", false));
        assert_eq!(ids(&view), vec![1, 2]);

        parent.get(1).unwrap().set(("done", true));
        assert_eq!(ids(&view), vec![2]);

        parent.get(2).unwrap().set(("title", "x"));

        assert_eq!(*log.lock(), vec!["add", "change:done", "remove", "change:title", "change"]);
    }

    #[test]
    fn test_change_of_rejected_member_is_not_relayed() {
        let parent = Collection::with_models(numbered(1..=2));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let log = record(&view);

        parent.get(1).unwrap().set(("title", "x"));

        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_change_repositions_under_own_comparator() {
        let parent = Collection::with_models(vec![json!({"id": 1, "rank": 1}), json!({"id": 2, "rank": 2})]);
        let view = VirtualCollection::builder(&parent)
            .comparator(Comparator::attribute("rank"))
            .build();
        let log = record(&view);

        parent.get(1).unwrap().set(("rank", 5));

        assert_eq!(ids(&view), vec![2, 1]);
        assert_eq!(*log.lock(), vec!["change:rank", "sort", "change"]);
    }

    #[test]
    fn test_parent_sort_is_mirrored_without_own_comparator() {
        let parent = Collection::with_models(vec![json!({"id": 3}), json!({"id": 1}), json!({"id": 2})]);
        let mirror = VirtualCollection::new(&parent);
        let own = VirtualCollection::builder(&parent)
            .comparator(Comparator::compare(|a, b| {
                compare_ids(b, a)
            }))
            .build();

        parent.set_comparator(Some(Comparator::attribute("id")));
        parent.sort();

        assert_eq!(ids(&mirror), vec![1, 2, 3]);
        assert_eq!(ids(&own), vec![3, 2, 1]);
    }

    #[test]
    fn test_parent_reorder_keeps_filtered_members_only() {
        let parent = Collection::with_models(vec![
            json!({"id": 4}),
            json!({"id": 3}),
            json!({"id": 2}),
            json!({"id": 1}),
        ]);
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let log = record(&view);

        parent.set_comparator(Some(Comparator::attribute("id")));
        parent.sort();

        assert_eq!(ids(&view), vec![2, 4]);
        assert_eq!(*log.lock(), vec!["sort"]);
    }

    #[test]
    fn test_sync_events_relayed_only_from_parent_or_members() {
        let parent = Collection::with_models(numbered(1..=2));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let log = record(&view);
        let request = |source| {
            Event::new(
                "request",
                Payload::Request {
                    source,
                    method: trellis_core::SyncMethod::Read,
                },
            )
        };

        let rejected = parent.get(1).unwrap();
        let accepted = parent.get(2).unwrap();
        rejected.events().trigger(&request(rejected.events().id()));
        accepted.events().trigger(&request(accepted.events().id()));
        parent.events().trigger(&request(parent.id()));

        assert_eq!(*log.lock(), vec!["request", "request"]);
    }

    fn compare_ids(a: &Model, b: &Model) -> std::cmp::Ordering {
        crate::collection::compare_values(&a.get("id").unwrap_or_default(), &b.get("id").unwrap_or_default())
    }

    #[test]
    fn test_update_delta_is_view_local() {
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let deltas_clone = deltas.clone();
        view.events().on(
            "update",
            &Handler::new(move |event| {
                if let Payload::Update { delta, .. } = event.payload() {
                    deltas_clone.lock().push((delta.added.len(), delta.removed.len(), delta.merged.len()));
                }
            }),
        );

        parent.set(numbered(1..=3).into_iter().chain([json!({"id": 6})]), UpdateOptions::set());
        parent.add(vec![json!({"id": 7})], UpdateOptions::add());

        assert_eq!(*deltas.lock(), vec![(1, 1, 0)]);
    }

    #[test]
    fn test_parent_reset_rebuilds() {
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();
        let log = record(&view);

        parent.reset(numbered(5..=8), UpdateOptions::set());

        assert_eq!(ids(&view), vec![6, 8]);
        assert_eq!(*log.lock(), vec!["reset"]);
    }

    #[test]
    fn test_update_filter_fires_filter_then_reset() {
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::new(&parent);
        let log = record(&view);

        view.update_filter(Filter::predicate(even));

        assert_eq!(ids(&view), vec![2, 4]);
        assert_eq!(*log.lock(), vec!["filter", "reset"]);
        assert!(matches!(view.current_filter(), Filter::Predicate(_)));
    }

    #[test]
    fn test_iteration_does_not_call_filter() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();
        let parent = Collection::with_models(numbered(1..=4));
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(move |_, _| {
                *calls_clone.lock() += 1;
                true
            }))
            .build();
        let after_build = *calls.lock();

        let _ = view.models();
        view.each(|_, _| {});
        let _ = view.pluck("id");
        let _ = view.at(1);

        assert_eq!(after_build, 4);
        assert_eq!(*calls.lock(), after_build);
    }

    #[test]
    fn test_set_parent_switches_subscriptions() {
        let first = Collection::with_models(numbered(1..=2));
        let second = Collection::with_models(numbered(10..=12));
        let view = VirtualCollection::new(&first);
        let log = record(&view);

        view.set_parent(Some(&second));
        assert_eq!(ids(&view), vec![10, 11, 12]);
        assert_eq!(view.events().subscription_refcount(&first), 0);

        first.add(vec![json!({"id": 3})], UpdateOptions::add());
        second.add(vec![json!({"id": 13})], UpdateOptions::add());

        assert_eq!(ids(&view), vec![10, 11, 12, 13]);
        assert_eq!(*log.lock(), vec!["reset", "add", "update"]);
    }

    #[test]
    fn test_mutations_delegate_to_parent() {
        let parent = Collection::new();
        let view = VirtualCollection::builder(&parent)
            .filter(Filter::predicate(even))
            .build();

        view.add(numbered(1..=4), UpdateOptions::add());
        assert_eq!(parent.len(), 4);
        assert_eq!(ids(&view), vec![2, 4]);

        view.remove([2], UpdateOptions::set());
        assert_eq!(parent.len(), 3);
        assert_eq!(ids(&view), vec![4]);
        assert_eq!(view.get(4), parent.get(4));
        assert_eq!(view.get(3), None);
    }

    #[test]
    fn test_unbound_view_is_empty_and_inert() {
        let view = VirtualCollectionBuilder::unbound().build();
        assert!(view.is_empty());
        assert!(view.add(numbered(1..=2), UpdateOptions::add()).is_empty());
        assert_eq!(view.get(1), None);
    }

    #[test]
    fn test_destroyed_member_leaves_view() {
        let parent = Collection::with_models(numbered(1..=2));
        let view = VirtualCollection::new(&parent);

        parent.get(1).unwrap().destroy();

        assert_eq!(ids(&view), vec![2]);
    }

    #[test]
    fn test_dropping_view_releases_parent() {
        let parent = Collection::with_models(numbered(1..=2));
        let view = VirtualCollection::new(&parent);
        let view_id = view.id();
        assert_eq!(parent.events().handler_count(Some(ALL)), 1);

        drop(view);

        assert_eq!(parent.events().handler_count(Some(ALL)), 0);
        assert!(trellis_core::subscriptions_of(view_id).is_empty());
    }

    #[test]
    #[should_panic(expected = "without a comparator")]
    fn test_sort_without_comparator_panics() {
        VirtualCollection::new(&Collection::new()).sort();
    }
}
