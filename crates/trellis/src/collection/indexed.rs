//! The ordered, indexed member set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use trellis_core::{
    ALL, Attributes, Delta, EmitterId, Emitter, Event, EventBus, EventError, Handler, Model,
    ModelConfig, Payload, SetOptions,
};

use super::comparator::{compare_values, Comparator};
use super::matches_attributes;
use super::options::{index_key, Lookup, Member, UpdateOptions};

/// Builds a model from raw attributes.
pub type ModelFactory = dyn Fn(Attributes, &SetOptions) -> Model + Send + Sync;

/// Resolves the identity key of raw attributes.
pub type IdentityFn = dyn Fn(&Attributes) -> Option<Value> + Send + Sync;

/// Turns a raw persistence response into an array of member attributes.
pub type ResponseParseFn = dyn Fn(Value) -> Value + Send + Sync;

/// Construction-time configuration of a [`Collection`].
#[derive(Clone, Default)]
pub struct CollectionConfig {
    model_config: Arc<ModelConfig>,
    factory: Option<Arc<ModelFactory>>,
    identity: Option<Arc<IdentityFn>>,
    parse: Option<Arc<ResponseParseFn>>,
}

impl CollectionConfig {
    /// Configuration of models built from raw attributes.
    pub fn model_config(&self) -> &Arc<ModelConfig> {
        &self.model_config
    }

    /// Run the response parse hook, or pass the response through.
    pub fn parse(&self, response: Value) -> Value {
        match &self.parse {
            Some(parse) => parse(response),
            None => response,
        }
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("model_config", &self.model_config)
            .field("factory", &self.factory.is_some())
            .field("identity", &self.identity.is_some())
            .field("parse", &self.parse.is_some())
            .finish()
    }
}

/// Builder for [`Collection`].
#[derive(Default)]
pub struct CollectionBuilder {
    config: CollectionConfig,
    comparator: Option<Comparator>,
}

impl CollectionBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for models built from raw attributes.
    pub fn model_config(mut self, config: Arc<ModelConfig>) -> Self {
        self.config.model_config = config;
        self
    }

    /// Build members with a custom factory instead of the model config.
    pub fn model_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Attributes, &SetOptions) -> Model + Send + Sync + 'static,
    {
        self.config.factory = Some(Arc::new(factory));
        self
    }

    /// Keep the collection sorted.
    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Resolve identity with a custom hook instead of the id attribute.
    pub fn identity<F>(mut self, identity: F) -> Self
    where
        F: Fn(&Attributes) -> Option<Value> + Send + Sync + 'static,
    {
        self.config.identity = Some(Arc::new(identity));
        self
    }

    /// Transform persistence responses before they are applied.
    pub fn parse<F>(mut self, parse: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.config.parse = Some(Arc::new(parse));
        self
    }

    /// Build an empty collection.
    pub fn build(self) -> Collection {
        Collection::from_parts(self.config, self.comparator)
    }

    /// Build a collection holding `members`, without firing events.
    pub fn build_with<I, M>(self, members: I) -> Collection
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        let collection = self.build();
        collection.reset(members, UpdateOptions::add().with_silent(true));
        collection
    }
}

#[derive(Default)]
struct CollectionState {
    models: Vec<Model>,
    /// Members by identity key.
    by_key: HashMap<String, Model>,
    /// Members by client id.
    by_cid: HashMap<String, Model>,
    comparator: Option<Comparator>,
    loading: bool,
}

impl CollectionState {
    fn position(&self, model: &Model) -> Option<usize> {
        self.models.iter().position(|m| m.ptr_eq(model))
    }
}

struct CollectionInner {
    bus: EventBus,
    config: CollectionConfig,
    state: Mutex<CollectionState>,
    /// Registered on every member's `"all"` event.
    relay: Handler,
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        let id = self.bus.id();
        for model in self.state.get_mut().models.drain(..) {
            model.events().off(Some(ALL), Some(&self.relay), Some(id));
        }
    }
}

/// An ordered set of models with O(1) lookup by identity key or client id.
///
/// `set` reconciles the collection against a new member list: existing
/// members are merged, new ones inserted, missing ones removed, and the
/// outcome announced as `"add"`/`"remove"` events, an optional `"sort"`, and
/// one `"update"` carrying the whole [`Delta`].
///
/// Every member event is relayed on the collection. A member that fires
/// `"destroy"` is removed automatically, and a member whose identity key
/// changes is re-indexed.
///
/// # Example
///
/// ```
/// use trellis::{Collection, UpdateOptions};
/// use serde_json::json;
///
/// let people = Collection::with_models(vec![json!({"id": 1, "name": "Moe"})]);
///
/// people.add(vec![json!({"id": 1, "name": "Moses"})], UpdateOptions::add());
/// assert_eq!(people.get(1).unwrap().get("name"), Some(json!("Moe")));
///
/// people.add(vec![json!({"id": 1, "name": "Moses"})], UpdateOptions::add().with_merge(true));
/// assert_eq!(people.get(1).unwrap().get("name"), Some(json!("Moses")));
/// ```
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

static_assertions::assert_impl_all!(Collection: Send, Sync);

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    /// Create an empty, unsorted collection.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create an unsorted collection holding `members`.
    pub fn with_models<I, M>(members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        Self::builder().build_with(members)
    }

    /// Start building a collection.
    pub fn builder() -> CollectionBuilder {
        CollectionBuilder::new()
    }

    fn from_parts(config: CollectionConfig, comparator: Option<Comparator>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<CollectionInner>| {
            let weak = weak.clone();
            let relay = Handler::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    Collection { inner }.on_model_event(event);
                }
            });
            CollectionInner {
                bus: EventBus::new(),
                config,
                state: Mutex::new(CollectionState {
                    comparator,
                    ..CollectionState::default()
                }),
                relay,
            }
        });
        Self { inner }
    }

    /// The collection's identity.
    pub fn id(&self) -> EmitterId {
        self.inner.bus.id()
    }

    /// The collection's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Construction-time configuration.
    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    /// Returns `true` if both handles refer to the same collection.
    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current comparator.
    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.state.lock().comparator.clone()
    }

    /// Replace the comparator. The current order is kept until the next sort.
    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.inner.state.lock().comparator = comparator;
    }

    /// The identity key of raw attributes, if any.
    pub fn model_id(&self, attrs: &Attributes) -> Option<Value> {
        let id = match &self.inner.config.identity {
            Some(identity) => identity(attrs),
            None => attrs
                .get(self.inner.config.model_config.id_attribute())
                .cloned(),
        };
        id.filter(|id| !id.is_null())
    }

    fn model_key(&self, model: &Model) -> Option<String> {
        self.model_id(&model.attributes()).map(|id| index_key(&id))
    }

    /// Reconcile the collection against `members`.
    ///
    /// Returns the resolved members in input order: existing instances for
    /// entries that matched, new instances for entries that were added.
    /// Entries rejected by validation are skipped and announced with an
    /// `"invalid"` event on the collection.
    #[tracing::instrument(skip_all, target = "trellis::collection", level = "trace", fields(collection = %self.id()))]
    pub fn set<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        let inputs: Vec<Member> = members.into_iter().map(Into::into).collect();
        let (len, comparator) = {
            let state = self.inner.state.lock();
            (state.models.len(), state.comparator.clone())
        };
        let at = options.at.map(|at| clamp_index(at, len));
        let sortable = comparator.is_some() && at.is_none() && options.sort != Some(false);
        let sort_attr = comparator.as_ref().and_then(Comparator::attribute_name);

        let mut resolved = Vec::with_capacity(inputs.len());
        let mut to_add = Vec::new();
        let mut to_merge = Vec::new();
        let mut kept = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut sort_needed = false;

        for member in inputs {
            if let Some(existing) = self.get(&member) {
                if !seen.insert(existing.cid().to_string()) {
                    continue;
                }
                if options.merge && !member.is(&existing) {
                    let mut attrs = member.attributes();
                    if options.parse {
                        attrs = existing.config().parse(Value::Object(attrs));
                    }
                    let applied = existing.set_with(attrs, options.set_options());
                    if applied && existing.has_changed(None) {
                        if sortable && !sort_needed {
                            sort_needed = existing.has_changed(sort_attr);
                        }
                        to_merge.push(existing.clone());
                    }
                }
                kept.push(existing.clone());
                resolved.push(existing);
            } else if options.add {
                let Ok(model) = self.prepare_model(member, &options) else {
                    continue;
                };
                seen.insert(model.cid().to_string());
                self.add_reference(&model);
                kept.push(model.clone());
                to_add.push(model.clone());
                resolved.push(model);
            }
        }

        let mut removed = Vec::new();
        if options.remove {
            let stale: Vec<Lookup> = self
                .inner
                .state
                .lock()
                .models
                .iter()
                .filter(|m| !seen.contains(m.cid()))
                .cloned()
                .map(Lookup::Model)
                .collect();
            if !stale.is_empty() {
                removed = self.remove_models(stale, options.silent);
            }
        }

        let mut order_changed = false;
        let mut inserted_at = None;
        let replace = !sortable && at.is_none() && options.add && options.remove;
        {
            let mut state = self.inner.state.lock();
            if !kept.is_empty() && replace {
                order_changed = state.models.len() != kept.len()
                    || state.models.iter().zip(&kept).any(|(a, b)| !a.ptr_eq(b));
                state.models = kept;
            } else if !to_add.is_empty() {
                if sortable {
                    sort_needed = true;
                }
                let index = at.unwrap_or(state.models.len()).min(state.models.len());
                state.models.splice(index..index, to_add.iter().cloned());
                inserted_at = at.map(|_| index);
            }
        }

        if sort_needed {
            self.sort_models();
        }

        tracing::debug!(
            target: "trellis::collection",
            added = to_add.len(),
            removed = removed.len(),
            merged = to_merge.len(),
            sorted = sort_needed,
            "reconciled"
        );

        if !options.silent {
            for (i, model) in to_add.iter().enumerate() {
                model.events().trigger(&Event::new(
                    "add",
                    Payload::Added {
                        model: model.clone(),
                        source: self.id(),
                        index: inserted_at.map(|at| at + i),
                    },
                ));
            }
            if sort_needed || order_changed {
                self.inner
                    .bus
                    .trigger(&Event::new("sort", Payload::Sort { source: self.id() }));
            }
            let delta = Delta {
                added: to_add,
                removed,
                merged: to_merge,
            };
            if !delta.is_empty() {
                self.inner.bus.trigger(&Event::new(
                    "update",
                    Payload::Update {
                        source: self.id(),
                        delta,
                    },
                ));
            }
        }

        resolved
    }

    /// Insert members without removing anything.
    ///
    /// Pass [`UpdateOptions::add`] for the usual no-merge behaviour.
    pub fn add<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        self.set(members, options.with_add(true).with_remove(false))
    }

    /// Extract the listed members, leaving every other member in place.
    pub fn remove<I, L>(&self, targets: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = L>,
        L: Into<Lookup>,
    {
        let removed = self.remove_models(targets.into_iter().map(Into::into).collect(), options.silent);
        if !options.silent && !removed.is_empty() {
            self.inner.bus.trigger(&Event::new(
                "update",
                Payload::Update {
                    source: self.id(),
                    delta: Delta {
                        removed: removed.clone(),
                        ..Delta::default()
                    },
                },
            ));
        }
        removed
    }

    /// Replace the whole content, then fire a single `"reset"`.
    pub fn reset<I, M>(&self, members: I, options: UpdateOptions) -> Vec<Model>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        let previous = {
            let mut state = self.inner.state.lock();
            state.by_key.clear();
            state.by_cid.clear();
            std::mem::take(&mut state.models)
        };
        for model in &previous {
            self.remove_reference(model);
        }

        let added = self.set(
            members,
            options.with_add(true).with_remove(false).with_silent(true),
        );
        tracing::debug!(target: "trellis::collection", previous = previous.len(), current = added.len(), "reset");

        if !options.silent {
            self.inner.bus.trigger(&Event::new(
                "reset",
                Payload::Reset {
                    source: self.id(),
                    previous,
                },
            ));
        }
        added
    }

    /// Append one member.
    pub fn push(&self, member: impl Into<Member>, options: UpdateOptions) -> Option<Model> {
        let member: Member = member.into();
        let at = self.len() as isize;
        self.add([member], options.with_at(at)).into_iter().next()
    }

    /// Remove and return the last member.
    pub fn pop(&self, options: UpdateOptions) -> Option<Model> {
        let model = self.at(-1)?;
        self.remove([&model], options);
        Some(model)
    }

    /// Prepend one member.
    pub fn unshift(&self, member: impl Into<Member>, options: UpdateOptions) -> Option<Model> {
        let member: Member = member.into();
        self.add([member], options.with_at(0)).into_iter().next()
    }

    /// Remove and return the first member.
    pub fn shift(&self, options: UpdateOptions) -> Option<Model> {
        let model = self.at(0)?;
        self.remove([&model], options);
        Some(model)
    }

    /// Sort by the comparator and fire `"sort"`.
    ///
    /// # Panics
    ///
    /// Panics if the collection has no comparator.
    pub fn sort(&self) {
        self.sort_with(false);
    }

    /// Sort by the comparator, optionally without firing `"sort"`.
    ///
    /// # Panics
    ///
    /// Panics if the collection has no comparator.
    pub fn sort_with(&self, silent: bool) {
        if !self.sort_models() {
            panic!("cannot sort a collection without a comparator");
        }
        if !silent {
            self.inner
                .bus
                .trigger(&Event::new("sort", Payload::Sort { source: self.id() }));
        }
    }

    /// Sort outside the lock so comparators may read the collection.
    fn sort_models(&self) -> bool {
        let (mut models, comparator) = {
            let state = self.inner.state.lock();
            (state.models.clone(), state.comparator.clone())
        };
        let Some(comparator) = comparator else {
            return false;
        };
        comparator.sort(&mut models);
        self.inner.state.lock().models = models;
        true
    }

    /// Turn an entry into a model, building one from raw attributes.
    ///
    /// A built model that failed validation is announced with `"invalid"`
    /// and handed back as the error.
    pub(crate) fn prepare_model(&self, member: Member, options: &UpdateOptions) -> Result<Model, Model> {
        let attrs = match member {
            Member::Model(model) => return Ok(model),
            Member::Attributes(attrs) => attrs,
        };
        let set_options = SetOptions::new()
            .with_validate(options.validate)
            .with_parse(options.parse);
        let model = match &self.inner.config.factory {
            Some(factory) => factory(attrs, &set_options),
            None => Model::with_config(
                Arc::clone(&self.inner.config.model_config),
                attrs,
                set_options,
            ),
        };

        let Some(error) = model.validation_error() else {
            return Ok(model);
        };
        tracing::debug!(target: "trellis::collection", cid = model.cid(), %error, "dropping invalid member");
        self.inner
            .bus
            .trigger(&Event::new(
                "invalid",
                Payload::Invalid {
                    model: model.clone(),
                    error,
                },
            ));
        Err(model)
    }

    fn add_reference(&self, model: &Model) {
        let key = self.model_key(model);
        {
            let mut state = self.inner.state.lock();
            state.by_cid.insert(model.cid().to_string(), model.clone());
            if let Some(key) = key {
                state.by_key.insert(key, model.clone());
            }
        }
        model
            .events()
            .on_with_context(ALL, &self.inner.relay, self.id());
    }

    fn remove_reference(&self, model: &Model) {
        model
            .events()
            .off(Some(ALL), Some(&self.inner.relay), Some(self.id()));
    }

    fn remove_models(&self, targets: Vec<Lookup>, silent: bool) -> Vec<Model> {
        let mut removed = Vec::new();
        for target in targets {
            let Some(model) = self.get(target) else {
                continue;
            };
            let key = self.model_key(&model);
            let index = {
                let mut state = self.inner.state.lock();
                let Some(index) = state.position(&model) else {
                    continue;
                };
                state.models.remove(index);
                state.by_cid.remove(model.cid());
                if let Some(key) = key {
                    if state.by_key.get(&key).is_some_and(|m| m.ptr_eq(&model)) {
                        state.by_key.remove(&key);
                    }
                }
                index
            };

            if !silent {
                model.events().trigger(&Event::new(
                    "remove",
                    Payload::Removed {
                        model: model.clone(),
                        source: self.id(),
                        index,
                    },
                ));
            }
            self.remove_reference(&model);
            removed.push(model);
        }
        removed
    }

    fn on_model_event(&self, event: &Event) {
        let name = event.name();
        if let Some(model) = event.model() {
            if matches!(name, "add" | "remove") && event.source() != Some(self.id()) {
                return;
            }
            if name == "destroy" {
                self.remove([model], UpdateOptions::set());
            }
            if name == "change" {
                self.reindex(model);
            }
        }
        self.inner.bus.trigger(event);
    }

    fn reindex(&self, model: &Model) {
        let previous = self.model_id(&model.previous_attributes());
        let current = self.model_id(&model.attributes());
        if previous == current {
            return;
        }

        let mut state = self.inner.state.lock();
        if !state.by_cid.contains_key(model.cid()) {
            return;
        }
        if let Some(previous) = &previous {
            let key = index_key(previous);
            if state.by_key.get(&key).is_some_and(|m| m.ptr_eq(model)) {
                state.by_key.remove(&key);
            }
        }
        if let Some(current) = &current {
            state.by_key.insert(index_key(current), model.clone());
        }
        tracing::trace!(target: "trellis::collection", cid = model.cid(), ?previous, ?current, "re-keyed member");
    }

    /// Find a member by instance, identity key, client id or attributes.
    pub fn get(&self, lookup: impl Into<Lookup>) -> Option<Model> {
        match lookup.into() {
            Lookup::Model(model) => {
                let key = self.model_key(&model);
                let state = self.inner.state.lock();
                key.and_then(|key| state.by_key.get(&key))
                    .or_else(|| state.by_cid.get(model.cid()))
                    .cloned()
            }
            Lookup::Id(id) => {
                let key = index_key(&id);
                let state = self.inner.state.lock();
                state
                    .by_key
                    .get(&key)
                    .or_else(|| state.by_cid.get(&key))
                    .cloned()
            }
            Lookup::Attributes(attrs) => {
                let key = self.model_id(&attrs).map(|id| index_key(&id))?;
                self.inner.state.lock().by_key.get(&key).cloned()
            }
        }
    }

    /// Returns `true` if [`get`](Self::get) would find a member.
    pub fn has(&self, lookup: impl Into<Lookup>) -> bool {
        self.get(lookup).is_some()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.state.lock().models.len()
    }

    /// Returns `true` if there are no members.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().models.is_empty()
    }

    /// A snapshot of the members in order.
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

    /// Position of `model`, if it is a member.
    pub fn index_of(&self, model: &Model) -> Option<usize> {
        self.inner.state.lock().position(model)
    }

    /// Members in `start..end`, clamped to the current length.
    pub fn slice(&self, start: usize, end: usize) -> Vec<Model> {
        let state = self.inner.state.lock();
        let end = end.min(state.models.len());
        let start = start.min(end);
        state.models[start..end].to_vec()
    }

    /// The first member.
    pub fn first(&self) -> Option<Model> {
        self.inner.state.lock().models.first().cloned()
    }

    /// The last member.
    pub fn last(&self) -> Option<Model> {
        self.inner.state.lock().models.last().cloned()
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

    /// Visit every member in order.
    pub fn each(&self, mut f: impl FnMut(&Model, usize)) {
        for (i, model) in self.models().iter().enumerate() {
            f(model, i);
        }
    }

    /// Map every member in order.
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

    /// Returns `true` if any member satisfies `predicate`.
    pub fn some(&self, predicate: impl FnMut(&Model) -> bool) -> bool {
        self.models().iter().any(predicate)
    }

    /// Returns `true` if every member satisfies `predicate`.
    pub fn every(&self, predicate: impl FnMut(&Model) -> bool) -> bool {
        self.models().iter().all(predicate)
    }

    /// Members stably ordered by a derived key. The collection is not changed.
    pub fn sort_by(&self, mut key: impl FnMut(&Model) -> Value) -> Vec<Model> {
        let mut keyed: Vec<(Value, Model)> = self
            .models()
            .into_iter()
            .map(|model| (key(&model), model))
            .collect();
        keyed.sort_by(|a, b| compare_values(&a.0, &b.0));
        keyed.into_iter().map(|(_, model)| model).collect()
    }

    /// Members grouped by a derived key.
    pub fn group_by(&self, mut key: impl FnMut(&Model) -> Value) -> BTreeMap<String, Vec<Model>> {
        let mut groups: BTreeMap<String, Vec<Model>> = BTreeMap::new();
        for model in self.models() {
            groups.entry(index_key(&key(&model))).or_default().push(model);
        }
        groups
    }

    /// Number of members per derived key.
    pub fn count_by(&self, mut key: impl FnMut(&Model) -> Value) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for model in self.models() {
            *counts.entry(index_key(&key(&model))).or_default() += 1;
        }
        counts
    }

    /// The last member for each derived key.
    pub fn index_by(&self, mut key: impl FnMut(&Model) -> Value) -> BTreeMap<String, Model> {
        self.models()
            .into_iter()
            .map(|model| (index_key(&key(&model)), model))
            .collect()
    }

    /// Every member's attributes as a JSON array.
    pub fn to_json(&self) -> Value {
        Value::Array(self.map(|model, _| model.to_json()))
    }

    /// Whether a persistence call is in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    /// Set by persistence adapters around their calls.
    pub fn set_loading(&self, loading: bool) {
        self.inner.state.lock().loading = loading;
    }
}

/// Resolve an insertion index; negative values count from the end.
fn clamp_index(at: isize, len: usize) -> usize {
    let len = len as isize;
    let at = if at < 0 { at + len + 1 } else { at };
    at.clamp(0, len) as usize
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Collection")
            .field("id", &self.inner.bus.id())
            .field("len", &state.models.len())
            .field("comparator", &state.comparator)
            .finish()
    }
}

impl Emitter for Collection {
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
