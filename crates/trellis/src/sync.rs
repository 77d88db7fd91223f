//! Persistence adapter contract and the fetch/save/destroy layer on top of it.
//!
//! Trellis does no I/O of its own. A [`SyncAdapter`] is handed a
//! [`SyncMethod`] and the model or collection concerned, and returns the raw
//! data the backend answered with. The extension traits [`ModelSync`] and
//! [`CollectionSync`] wrap each call the same way:
//!
//! 1. `is_loading` is set and `"request"` fires on the target
//! 2. the adapter runs
//! 3. `is_loading` is cleared
//! 4. on success the data is fed back through `set`/`reset` and `"sync"`
//!    fires; on failure `"error"` fires and the target is left untouched
//!
//! # Example
//!
//! ```
//! use trellis::sync::{CollectionSync, InMemoryAdapter, ModelSync, SyncOptions};
//! use trellis::Collection;
//! use serde_json::json;
//!
//! let backend = InMemoryAdapter::new();
//! let notes = Collection::new();
//!
//! let note = notes.create(&backend, json!({"text": "hello"}), SyncOptions::new()).unwrap();
//! assert_eq!(note.id(), Some(json!(1)));
//!
//! note.set(json!({"text": "edited"}));
//! note.save(&backend, None, SyncOptions::new()).unwrap();
//!
//! let mirror = Collection::new();
//! mirror.fetch(&backend, SyncOptions::new()).unwrap();
//! assert_eq!(mirror.get(1).unwrap().get("text"), Some(json!("edited")));
//! ```

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use trellis_core::{
    Attributes, EmitterId, Event, IntoAttributes, Model, Payload, SetOptions, SyncMethod,
};

use crate::collection::{index_key, Collection, Member, UpdateOptions};
use crate::virtual_collection::VirtualCollection;

/// Errors surfaced by persistence calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The adapter reported a failure.
    #[error("adapter failed: {0}")]
    Adapter(String),

    /// A model failed validation before or after the call.
    #[error("model {cid} failed validation: {error}")]
    Invalid { cid: String, error: Value },

    /// The adapter answered with data of the wrong shape.
    #[error("unexpected response: {0}")]
    Response(String),

    /// A view was asked to persist without a parent collection.
    #[error("view has no parent collection")]
    MissingParent,

    /// The backend holds no record with this identity.
    #[error("no record with id {0}")]
    NotFound(String),
}

/// Result type for persistence calls.
pub type SyncResult<T> = Result<T, SyncError>;

/// What a persistence call concerns.
#[derive(Debug, Clone, Copy)]
pub enum SyncTarget<'a> {
    /// A single model.
    Model(&'a Model),
    /// A whole collection.
    Collection(&'a Collection),
}

impl SyncTarget<'_> {
    /// Emitter identity of the target.
    pub fn id(&self) -> EmitterId {
        match self {
            Self::Model(model) => model.events().id(),
            Self::Collection(collection) => collection.id(),
        }
    }

    fn set_loading(&self, loading: bool) {
        match self {
            Self::Model(model) => model.set_loading(loading),
            Self::Collection(collection) => collection.set_loading(loading),
        }
    }

    fn trigger(&self, event: &Event) {
        match self {
            Self::Model(model) => model.events().trigger(event),
            Self::Collection(collection) => collection.events().trigger(event),
        }
    }
}

/// Options for persistence calls.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Apply local changes only after the backend confirmed them.
    pub wait: bool,
    /// Send only the given attributes, as a partial update.
    pub patch: bool,
    /// On collection fetch, `reset` instead of reconciling with `set`.
    pub reset: bool,
    /// Run parse hooks on the response.
    pub parse: bool,
    /// The attributes to send, when they differ from the model's own.
    pub attrs: Option<Attributes>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            wait: false,
            patch: false,
            reset: false,
            parse: true,
            attrs: None,
        }
    }
}

impl SyncOptions {
    /// Default options: apply immediately, full update, parse responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `wait` flag.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Set the `patch` flag.
    pub fn with_patch(mut self, patch: bool) -> Self {
        self.patch = patch;
        self
    }

    /// Set the `reset` flag.
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Set the `parse` flag.
    pub fn with_parse(mut self, parse: bool) -> Self {
        self.parse = parse;
        self
    }
}

/// A backend that models and collections can be persisted to.
pub trait SyncAdapter: Send + Sync {
    /// Perform `method` on `target` and return the backend's raw answer.
    fn sync(&self, method: SyncMethod, target: SyncTarget<'_>, options: &SyncOptions)
    -> SyncResult<Value>;
}

/// Run one adapter call with the loading flag and `"request"`/`"error"` events.
fn request(
    adapter: &dyn SyncAdapter,
    method: SyncMethod,
    target: SyncTarget<'_>,
    options: &SyncOptions,
) -> SyncResult<Value> {
    let source = target.id();
    let _span = tracing::debug_span!(target: "trellis::sync", "trellis::sync", %method, %source).entered();

    target.set_loading(true);
    target.trigger(&Event::new("request", Payload::Request { source, method }));
    let result = adapter.sync(method, target, options);
    target.set_loading(false);

    result.map_err(|err| fail(target, err))
}

fn fail(target: SyncTarget<'_>, err: SyncError) -> SyncError {
    tracing::warn!(target: "trellis::sync", source = %target.id(), %err, "sync failed");
    target.trigger(&Event::new(
        "error",
        Payload::Failed {
            source: target.id(),
            message: err.to_string(),
        },
    ));
    err
}

fn synced(target: SyncTarget<'_>, response: Value) {
    tracing::debug!(target: "trellis::sync", source = %target.id(), "synced");
    target.trigger(&Event::new(
        "sync",
        Payload::Synced {
            source: target.id(),
            response,
        },
    ));
}

fn invalid(model: &Model, error: Value) -> SyncError {
    SyncError::Invalid {
        cid: model.cid().to_string(),
        error,
    }
}

/// Persistence operations on a [`Model`].
pub trait ModelSync {
    /// Load the model's attributes from the backend and apply them.
    fn fetch(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()>;

    /// Persist the model, optionally setting `attrs` first.
    ///
    /// New models are created; persisted ones are updated, or patched with
    /// only `attrs` when `patch` is set. With `wait`, `attrs` are applied
    /// only once the backend accepted them.
    fn save(
        &self,
        adapter: &dyn SyncAdapter,
        attrs: Option<Attributes>,
        options: SyncOptions,
    ) -> SyncResult<()>;

    /// Delete the model on the backend and destroy it locally.
    ///
    /// A model that was never persisted is destroyed without a backend call.
    fn destroy_with(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()>;
}

fn response_attributes(model: &Model, response: Value, parse: bool) -> Attributes {
    if parse {
        model.config().parse(response)
    } else {
        response.into_attributes()
    }
}

impl ModelSync for Model {
    fn fetch(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()> {
        let response = request(adapter, SyncMethod::Read, SyncTarget::Model(self), &options)?;
        let attrs = response_attributes(self, response.clone(), options.parse);
        if !self.set_with(attrs, SetOptions::new()) {
            let error = self.validation_error().unwrap_or_default();
            return Err(fail(SyncTarget::Model(self), invalid(self, error)));
        }
        synced(SyncTarget::Model(self), response);
        Ok(())
    }

    fn save(
        &self,
        adapter: &dyn SyncAdapter,
        attrs: Option<Attributes>,
        mut options: SyncOptions,
    ) -> SyncResult<()> {
        let validate = SetOptions::new().with_validate(true);
        match (&attrs, options.wait) {
            (Some(attrs), false) => {
                if !self.set_with(attrs.clone(), validate) {
                    return Err(invalid(self, self.validation_error().unwrap_or_default()));
                }
            }
            _ => {
                let mut candidate = self.attributes();
                if let Some(attrs) = &attrs {
                    candidate.extend(attrs.clone());
                }
                if let Some(error) = self.config().validate(&candidate, &validate) {
                    return Err(invalid(self, error));
                }
                if options.wait && !options.patch && attrs.is_some() {
                    options.attrs = Some(candidate);
                }
            }
        }

        let method = if self.is_new() {
            SyncMethod::Create
        } else if options.patch {
            SyncMethod::Patch
        } else {
            SyncMethod::Update
        };
        if method == SyncMethod::Patch && options.attrs.is_none() {
            options.attrs = Some(attrs.clone().unwrap_or_default());
        }

        let response = request(adapter, method, SyncTarget::Model(self), &options)?;
        let mut server = response_attributes(self, response.clone(), options.parse);
        if options.wait {
            let mut confirmed = attrs.unwrap_or_default();
            confirmed.extend(server);
            server = confirmed;
        }
        if !server.is_empty() && !self.set_with(server, validate) {
            let error = self.validation_error().unwrap_or_default();
            return Err(fail(SyncTarget::Model(self), invalid(self, error)));
        }
        synced(SyncTarget::Model(self), response);
        Ok(())
    }

    fn destroy_with(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()> {
        if self.is_new() {
            self.destroy();
            return Ok(());
        }
        if !options.wait {
            self.destroy();
        }
        let response = request(adapter, SyncMethod::Delete, SyncTarget::Model(self), &options)?;
        if options.wait {
            self.destroy();
        }
        synced(SyncTarget::Model(self), response);
        Ok(())
    }
}

/// Persistence operations on a collection or a view of one.
pub trait CollectionSync {
    /// Load the member list from the backend and reconcile against it.
    fn fetch(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()>;

    /// Build a member, add it, and save it.
    ///
    /// With `wait` the member is added only after the backend accepted it.
    fn create(
        &self,
        adapter: &dyn SyncAdapter,
        member: impl Into<Member>,
        options: SyncOptions,
    ) -> SyncResult<Model>;
}

impl CollectionSync for Collection {
    fn fetch(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()> {
        let target = SyncTarget::Collection(self);
        let response = request(adapter, SyncMethod::Read, target, &options)?;
        let parsed = if options.parse {
            self.config().parse(response.clone())
        } else {
            response.clone()
        };
        let Value::Array(items) = parsed else {
            let err = SyncError::Response(format!("expected an array, got {parsed}"));
            return Err(fail(target, err));
        };

        let update = UpdateOptions::set().with_parse(options.parse);
        if options.reset {
            self.reset(items, update);
        } else {
            self.set(items, update);
        }
        synced(target, response);
        Ok(())
    }

    fn create(
        &self,
        adapter: &dyn SyncAdapter,
        member: impl Into<Member>,
        options: SyncOptions,
    ) -> SyncResult<Model> {
        let model = self
            .prepare_model(member.into(), &UpdateOptions::add().with_validate(true))
            .map_err(|rejected| {
                let error = rejected.validation_error().unwrap_or_default();
                invalid(&rejected, error)
            })?;
        if !options.wait {
            self.add([&model], UpdateOptions::add());
        }
        let wait = options.wait;
        model.save(adapter, None, options)?;
        if wait {
            self.add([&model], UpdateOptions::add().with_merge(true));
        }
        Ok(model)
    }
}

impl CollectionSync for VirtualCollection {
    fn fetch(&self, adapter: &dyn SyncAdapter, options: SyncOptions) -> SyncResult<()> {
        self.parent_for("fetch")
            .ok_or(SyncError::MissingParent)?
            .fetch(adapter, options)
    }

    fn create(
        &self,
        adapter: &dyn SyncAdapter,
        member: impl Into<Member>,
        options: SyncOptions,
    ) -> SyncResult<Model> {
        self.parent_for("create")
            .ok_or(SyncError::MissingParent)?
            .create(adapter, member, options)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Records by identity key, in insertion order.
    records: Vec<(String, Attributes)>,
    next_id: u64,
    revision: u64,
    fail_next: Option<String>,
}

impl MemoryState {
    fn position(&self, key: &str) -> Option<usize> {
        self.records.iter().position(|(k, _)| k == key)
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

/// An adapter that keeps records in memory.
///
/// Identities are assigned sequentially from 1. Every write bumps a
/// revision counter owned by the adapter instance.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    state: Mutex<MemoryState>,
}

impl InMemoryAdapter {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, keyed by its `id` attribute.
    ///
    /// Records without an `id` are assigned the next one.
    pub fn seed(&self, attrs: impl IntoAttributes) -> Value {
        let mut attrs = attrs.into_attributes();
        let mut state = self.state.lock();
        let id = match attrs.get("id").filter(|id| !id.is_null()) {
            Some(id) => {
                if let Some(n) = id.as_u64() {
                    state.next_id = state.next_id.max(n);
                }
                id.clone()
            }
            None => {
                state.next_id += 1;
                let id = Value::from(state.next_id);
                attrs.insert("id".to_string(), id.clone());
                id
            }
        };
        state.records.push((index_key(&id), attrs));
        state.bump();
        id
    }

    /// Make the next call fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().fail_next = Some(message.into());
    }

    /// Number of writes performed so far.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// A copy of the record stored under `id`.
    pub fn record(&self, id: &Value) -> Option<Attributes> {
        let key = index_key(id);
        let state = self.state.lock();
        state.position(&key).map(|i| state.records[i].1.clone())
    }

    fn model_key(model: &Model) -> SyncResult<String> {
        model
            .id()
            .map(|id| index_key(&id))
            .ok_or_else(|| SyncError::NotFound(model.cid().to_string()))
    }
}

impl SyncAdapter for InMemoryAdapter {
    fn sync(
        &self,
        method: SyncMethod,
        target: SyncTarget<'_>,
        options: &SyncOptions,
    ) -> SyncResult<Value> {
        let model = match target {
            SyncTarget::Collection(_) if method == SyncMethod::Read => {
                let mut state = self.state.lock();
                if let Some(message) = state.fail_next.take() {
                    return Err(SyncError::Adapter(message));
                }
                return Ok(Value::Array(
                    state
                        .records
                        .iter()
                        .map(|(_, attrs)| Value::Object(attrs.clone()))
                        .collect(),
                ));
            }
            SyncTarget::Collection(_) => {
                return Err(SyncError::Adapter(format!("{method} is not supported on collections")));
            }
            SyncTarget::Model(model) => model,
        };

        let outgoing = options.attrs.clone().unwrap_or_else(|| model.attributes());
        let id_attribute = model.config().id_attribute().to_string();
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(SyncError::Adapter(message));
        }

        match method {
            SyncMethod::Create => {
                state.next_id += 1;
                let id = Value::from(state.next_id);
                let mut record = outgoing;
                record.insert(id_attribute, id.clone());
                state.records.push((index_key(&id), record.clone()));
                state.bump();
                Ok(Value::Object(record))
            }
            SyncMethod::Read => {
                let key = Self::model_key(model)?;
                let index = state.position(&key).ok_or(SyncError::NotFound(key))?;
                Ok(Value::Object(state.records[index].1.clone()))
            }
            SyncMethod::Update => {
                let key = Self::model_key(model)?;
                let index = state.position(&key).ok_or(SyncError::NotFound(key))?;
                state.records[index].1 = outgoing.clone();
                state.bump();
                Ok(Value::Object(outgoing))
            }
            SyncMethod::Patch => {
                let key = Self::model_key(model)?;
                let index = state.position(&key).ok_or(SyncError::NotFound(key))?;
                state.records[index].1.extend(outgoing);
                state.bump();
                Ok(Value::Object(state.records[index].1.clone()))
            }
            SyncMethod::Delete => {
                let key = Self::model_key(model)?;
                let index = state.position(&key).ok_or(SyncError::NotFound(key))?;
                state.records.remove(index);
                state.bump();
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use trellis_core::{Handler, ModelConfig, ALL};

    fn record(model: &Model) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        model.events().on(
            ALL,
            &Handler::new(move |event| log_clone.lock().push(event.name().to_string())),
        );
        log
    }

    #[test]
    fn test_save_creates_then_updates() {
        let backend = InMemoryAdapter::new();
        let model = Model::with_attributes(json!({"title": "a"}));
        let log = record(&model);

        model.save(&backend, None, SyncOptions::new()).unwrap();
        assert_eq!(model.id(), Some(json!(1)));
        assert!(!model.is_loading());

        model
            .save(&backend, Some(json!({"title": "b"}).into_attributes()), SyncOptions::new())
            .unwrap();
        assert_eq!(backend.record(&json!(1)).unwrap()["title"], json!("b"));
        assert_eq!(backend.revision(), 2);
        assert_eq!(
            *log.lock(),
            vec![
                "request", "change:id", "change", "sync",
                "change:title", "change", "request", "sync",
            ]
        );
    }

    #[test]
    fn test_patch_sends_only_given_attributes() {
        let backend = InMemoryAdapter::new();
        backend.seed(json!({"id": 1, "title": "a", "done": false}));
        let model = Model::with_attributes(json!({"id": 1, "title": "stale"}));

        model
            .save(
                &backend,
                Some(json!({"done": true}).into_attributes()),
                SyncOptions::new().with_patch(true),
            )
            .unwrap();

        let stored = backend.record(&json!(1)).unwrap();
        assert_eq!(stored["title"], json!("a"));
        assert_eq!(stored["done"], json!(true));
        assert_eq!(model.get("title"), Some(json!("a")));
    }

    #[test]
    fn test_wait_applies_after_success_only() {
        let backend = InMemoryAdapter::new();
        backend.seed(json!({"id": 1, "title": "a"}));
        let model = Model::with_attributes(json!({"id": 1, "title": "a"}));

        backend.fail_next("offline");
        let result = model.save(
            &backend,
            Some(json!({"title": "b"}).into_attributes()),
            SyncOptions::new().with_wait(true),
        );

        assert_eq!(result, Err(SyncError::Adapter("offline".to_string())));
        assert_eq!(model.get("title"), Some(json!("a")));

        model
            .save(
                &backend,
                Some(json!({"title": "b"}).into_attributes()),
                SyncOptions::new().with_wait(true),
            )
            .unwrap();
        assert_eq!(model.get("title"), Some(json!("b")));
        assert_eq!(backend.record(&json!(1)).unwrap()["title"], json!("b"));
    }

    #[test]
    fn test_failure_fires_error_and_clears_loading() {
        let backend = InMemoryAdapter::new();
        let model = Model::with_attributes(json!({"id": 9}));
        let log = record(&model);

        let result = model.fetch(&backend, SyncOptions::new());

        assert_eq!(result, Err(SyncError::NotFound("9".to_string())));
        assert!(!model.is_loading());
        assert_eq!(*log.lock(), vec!["request", "error"]);
    }

    #[test]
    fn test_invalid_save_never_reaches_backend() {
        let config = ModelConfig::builder()
            .validate(|attrs, _| attrs.get("title").is_none().then(|| json!("title required")))
            .build();
        let model = Model::with_config(config, json!({"x": 1}), SetOptions::new());
        let backend = InMemoryAdapter::new();

        let result = model.save(&backend, None, SyncOptions::new());

        assert!(matches!(result, Err(SyncError::Invalid { .. })));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_destroy_with() {
        let backend = InMemoryAdapter::new();
        let collection = Collection::new();
        let model = collection
            .create(&backend, json!({"title": "a"}), SyncOptions::new())
            .unwrap();
        assert_eq!(backend.len(), 1);

        model.destroy_with(&backend, SyncOptions::new().with_wait(true)).unwrap();

        assert!(backend.is_empty());
        assert!(collection.is_empty());

        let fresh = Model::new();
        fresh.destroy_with(&backend, SyncOptions::new()).unwrap();
        assert_eq!(backend.revision(), 2);
    }

    #[test]
    fn test_collection_fetch_set_and_reset() {
        let backend = InMemoryAdapter::new();
        backend.seed(json!({"id": 1, "n": 1}));
        backend.seed(json!({"id": 2, "n": 2}));
        let collection = Collection::with_models(vec![json!({"id": 1, "n": 0}), json!({"id": 5})]);
        let kept = collection.get(1).unwrap();

        collection.fetch(&backend, SyncOptions::new()).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.get(1).unwrap().ptr_eq(&kept));
        assert_eq!(kept.get("n"), Some(json!(1)));

        collection
            .fetch(&backend, SyncOptions::new().with_reset(true))
            .unwrap();
        assert!(!collection.get(1).unwrap().ptr_eq(&kept));
    }

    #[test]
    fn test_collection_parse_hook_and_bad_response() {
        let backend = InMemoryAdapter::new();
        backend.seed(json!({"id": 1}));
        let wrapped = Collection::builder()
            .parse(|response| json!({"items": response}))
            .build();

        let result = wrapped.fetch(&backend, SyncOptions::new());
        assert!(matches!(result, Err(SyncError::Response(_))));
        assert!(!wrapped.is_loading());

        let unwrapped = Collection::builder()
            .parse(|response| response)
            .build();
        unwrapped.fetch(&backend, SyncOptions::new()).unwrap();
        assert_eq!(unwrapped.len(), 1);
    }

    #[test]
    fn test_create_with_wait_adds_after_success() {
        let backend = InMemoryAdapter::new();
        let collection = Collection::new();

        backend.fail_next("rejected");
        let result = collection.create(&backend, json!({"t": 1}), SyncOptions::new().with_wait(true));
        assert!(result.is_err());
        assert!(collection.is_empty());

        let model = collection
            .create(&backend, json!({"t": 1}), SyncOptions::new().with_wait(true))
            .unwrap();
        assert_eq!(collection.get(1), Some(model));
    }

    #[test]
    fn test_view_delegates_to_parent() {
        let backend = InMemoryAdapter::new();
        backend.seed(json!({"id": 1}));
        let parent = Collection::new();
        let view = VirtualCollection::new(&parent);

        view.fetch(&backend, SyncOptions::new()).unwrap();
        assert_eq!(view.len(), 1);

        let unbound = crate::VirtualCollectionBuilder::unbound().build();
        assert_eq!(
            unbound.fetch(&backend, SyncOptions::new()),
            Err(SyncError::MissingParent)
        );
    }
}
