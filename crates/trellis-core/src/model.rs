//! Observable attribute stores.
//!
//! A [`Model`] is a keyed bag of JSON values with batch-scoped change
//! tracking. Every `set` call is a batch: the store snapshots its attributes
//! when the outermost batch starts, applies the assignments, then fires one
//! `"change:<attr>"` event per attribute whose value changed followed by a
//! single `"change"` event.
//!
//! # Nested Sets
//!
//! Handlers may call `set` again while a batch is being announced. The nested
//! call applies its assignments and fires its own `"change:<attr>"` events
//! immediately, but its `"change"` is coalesced into the outer batch: the
//! outermost `set` keeps firing `"change"` until no nested call asked for
//! another one.
//!
//! ```
//! use trellis_core::{Event, Handler, Model};
//! use parking_lot::Mutex;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let model = Model::new();
//! let changes = Arc::new(Mutex::new(0));
//!
//! let nested = model.clone();
//! model.events().on("change:x", &Handler::new(move |_| {
//!     nested.set(json!({"y": true}));
//! }));
//!
//! let counter = changes.clone();
//! model.events().on("change", &Handler::new(move |_| *counter.lock() += 1));
//!
//! model.set(json!({"x": true}));
//! assert_eq!(*changes.lock(), 1);
//! assert!(model.has_changed(Some("y")));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{EventError, Result, TrellisError};
use crate::event::{EmitterId, Event, Payload};
use crate::events::{Emitter, EventBus, Handler};

/// An insertion-ordered attribute map.
pub type Attributes = serde_json::Map<String, Value>;

/// Validation hook: returns `Some(error)` to reject a candidate state.
pub type ValidateFn = dyn Fn(&Attributes, &SetOptions) -> Option<Value> + Send + Sync;

/// Parse hook: converts raw data into attributes.
pub type ParseFn = dyn Fn(Value) -> Attributes + Send + Sync;

/// Global counter for client ids.
static NEXT_CID: AtomicU64 = AtomicU64::new(1);

/// Options for [`Model::set_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Remove the listed attributes instead of assigning them.
    pub unset: bool,
    /// Suppress change events.
    pub silent: bool,
    /// Treat the input as the complete new state; missing attributes are removed.
    pub reset: bool,
    /// Run the validation hook before applying anything.
    pub validate: bool,
    /// Run the parse hook on construction input.
    pub parse: bool,
}

impl SetOptions {
    /// Default options: assign, notify, no validation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with only `silent` set.
    pub fn silent() -> Self {
        Self::default().with_silent(true)
    }

    /// Set the `unset` flag.
    pub fn with_unset(mut self, unset: bool) -> Self {
        self.unset = unset;
        self
    }

    /// Set the `silent` flag.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Set the `reset` flag.
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Set the `validate` flag.
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Set the `parse` flag.
    pub fn with_parse(mut self, parse: bool) -> Self {
        self.parse = parse;
        self
    }
}

/// Shared configuration for a family of models.
///
/// Built with [`ModelConfig::builder`] and shared as `Arc<ModelConfig>`.
#[derive(Clone)]
pub struct ModelConfig {
    id_attribute: String,
    defaults: Attributes,
    validate: Option<Arc<ValidateFn>>,
    parse: Option<Arc<ParseFn>>,
    cid_prefix: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id_attribute: "id".to_string(),
            defaults: Attributes::new(),
            validate: None,
            parse: None,
            cid_prefix: "c".to_string(),
        }
    }
}

impl ModelConfig {
    /// Start building a configuration.
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::default()
    }

    /// The attribute holding the identity key.
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// Attributes applied to every new model before its own.
    pub fn defaults(&self) -> &Attributes {
        &self.defaults
    }

    /// Prefix of generated client ids.
    pub fn cid_prefix(&self) -> &str {
        &self.cid_prefix
    }

    /// Returns `true` if a validation hook is configured.
    pub fn has_validator(&self) -> bool {
        self.validate.is_some()
    }

    /// Run the validation hook, if any.
    pub fn validate(&self, candidate: &Attributes, options: &SetOptions) -> Option<Value> {
        self.validate.as_ref().and_then(|hook| hook(candidate, options))
    }

    /// Run the parse hook, or accept a JSON object as-is.
    pub fn parse(&self, raw: Value) -> Attributes {
        match &self.parse {
            Some(hook) => hook(raw),
            None => raw.into_attributes(),
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("id_attribute", &self.id_attribute)
            .field("defaults", &self.defaults)
            .field("validate", &self.validate.is_some())
            .field("parse", &self.parse.is_some())
            .field("cid_prefix", &self.cid_prefix)
            .finish()
    }
}

/// Builder for [`ModelConfig`].
#[derive(Default)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    /// Set the identity attribute.
    pub fn id_attribute(mut self, name: impl Into<String>) -> Self {
        self.config.id_attribute = name.into();
        self
    }

    /// Add a single default attribute.
    pub fn default_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.defaults.insert(name.into(), value.into());
        self
    }

    /// Replace all default attributes.
    pub fn defaults(mut self, defaults: impl IntoAttributes) -> Self {
        self.config.defaults = defaults.into_attributes();
        self
    }

    /// Set the validation hook.
    pub fn validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Attributes, &SetOptions) -> Option<Value> + Send + Sync + 'static,
    {
        self.config.validate = Some(Arc::new(hook));
        self
    }

    /// Set the parse hook.
    pub fn parse<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> Attributes + Send + Sync + 'static,
    {
        self.config.parse = Some(Arc::new(hook));
        self
    }

    /// Set the client-id prefix.
    pub fn cid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.cid_prefix = prefix.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> Arc<ModelConfig> {
        Arc::new(self.config)
    }
}

/// Conversion into an attribute map.
pub trait IntoAttributes {
    /// Perform the conversion.
    fn into_attributes(self) -> Attributes;
}

impl IntoAttributes for Attributes {
    fn into_attributes(self) -> Attributes {
        self
    }
}

/// Objects convert directly; any other JSON value yields no attributes.
impl IntoAttributes for Value {
    fn into_attributes(self) -> Attributes {
        match self {
            Value::Object(map) => map,
            Value::Null => Attributes::new(),
            other => {
                tracing::debug!(target: "trellis_core::model", value = %other, "ignoring non-object attributes");
                Attributes::new()
            }
        }
    }
}

impl<K: Into<String>, V: Into<Value>> IntoAttributes for (K, V) {
    fn into_attributes(self) -> Attributes {
        let mut map = Attributes::new();
        map.insert(self.0.into(), self.1.into());
        map
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> IntoAttributes for [(K, V); N] {
    fn into_attributes(self) -> Attributes {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

impl<K: Into<String>, V: Into<Value>> IntoAttributes for Vec<(K, V)> {
    fn into_attributes(self) -> Attributes {
        self.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
    }
}

/// Mutable state guarded by the model's lock.
#[derive(Default)]
struct ModelState {
    attributes: Attributes,
    /// Attributes at the start of the current batch.
    previous: Attributes,
    /// Attributes that differ from `previous`; removals are recorded as null.
    changed: Attributes,
    /// A batch is in progress.
    changing: bool,
    /// A `"change"` event is owed by the outermost batch.
    pending: Option<SetOptions>,
    validation_error: Option<Value>,
    loading: bool,
}

struct ModelInner {
    cid: String,
    config: Arc<ModelConfig>,
    bus: EventBus,
    state: Mutex<ModelState>,
}

/// An observable attribute store.
///
/// `Model` is a cheap handle: clones share the same attributes and event bus.
/// Equality is identity.
///
/// # Related Types
///
/// - [`ModelConfig`] - Identity attribute, defaults and hooks
/// - [`SetOptions`] - Flags for a single `set` batch
/// - [`EventBus`] - Returned by [`events`](Self::events)
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

static_assertions::assert_impl_all!(Model: Send, Sync);

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// Create an empty model with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Arc::new(ModelConfig::default()), Attributes::new(), SetOptions::new())
    }

    /// Create a model with the default configuration and initial attributes.
    pub fn with_attributes(attributes: impl IntoAttributes) -> Self {
        Self::with_config(Arc::new(ModelConfig::default()), attributes, SetOptions::new())
    }

    /// Create a model from a configuration and initial attributes.
    ///
    /// The attributes are parsed first when `options.parse` is set, then laid
    /// over the configured defaults. A model rejected by validation starts
    /// empty and records the error in
    /// [`validation_error`](Self::validation_error).
    pub fn with_config(
        config: Arc<ModelConfig>,
        attributes: impl IntoAttributes,
        options: SetOptions,
    ) -> Self {
        let mut attributes = attributes.into_attributes();
        if options.parse {
            attributes = config.parse(Value::Object(attributes));
        }
        let mut initial = config.defaults.clone();
        initial.extend(attributes);

        let cid = format!(
            "{}{}",
            config.cid_prefix,
            NEXT_CID.fetch_add(1, Ordering::Relaxed)
        );
        let model = Self {
            inner: Arc::new(ModelInner {
                cid,
                config,
                bus: EventBus::new(),
                state: Mutex::new(ModelState::default()),
            }),
        };
        model.set_with(initial, options);
        model.inner.state.lock().changed.clear();
        model
    }

    /// Deserialize-friendly constructor from any serializable value.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self::with_attributes(map)),
            other => Err(TrellisError::NotAnObject(json_kind(&other))),
        }
    }

    /// The process-unique client id, e.g. `"c12"`.
    pub fn cid(&self) -> &str {
        &self.inner.cid
    }

    /// The shared configuration.
    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.inner.config
    }

    /// The model's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Returns `true` if both handles refer to the same model.
    #[inline]
    pub fn ptr_eq(&self, other: &Model) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The identity key, if set and non-null.
    pub fn id(&self) -> Option<Value> {
        self.get(&self.inner.config.id_attribute)
            .filter(|value| !value.is_null())
    }

    /// Returns `true` if the model has no identity key yet.
    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    /// Read one attribute.
    pub fn get(&self, attr: &str) -> Option<Value> {
        self.inner.state.lock().attributes.get(attr).cloned()
    }

    /// Read one attribute as a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, attr: &str) -> Result<Option<T>> {
        self.get(attr)
            .map(serde_json::from_value)
            .transpose()
            .map_err(TrellisError::from)
    }

    /// Returns `true` if the attribute is present and not null.
    pub fn has(&self, attr: &str) -> bool {
        self.inner
            .state
            .lock()
            .attributes
            .get(attr)
            .is_some_and(|value| !value.is_null())
    }

    /// A copy of every attribute.
    pub fn attributes(&self) -> Attributes {
        self.inner.state.lock().attributes.clone()
    }

    /// The attributes as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.attributes())
    }

    /// Convert the attributes into a typed value.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    /// Attribute names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().attributes.keys().cloned().collect()
    }

    /// Attribute values in insertion order.
    pub fn values(&self) -> Vec<Value> {
        self.inner.state.lock().attributes.values().cloned().collect()
    }

    /// `(name, value)` pairs in insertion order.
    pub fn pairs(&self) -> Vec<(String, Value)> {
        self.inner
            .state
            .lock()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// A copy of only the named attributes.
    pub fn pick(&self, names: &[&str]) -> Attributes {
        let state = self.inner.state.lock();
        names
            .iter()
            .filter_map(|name| {
                state
                    .attributes
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect()
    }

    /// A copy of every attribute except the named ones.
    pub fn omit(&self, names: &[&str]) -> Attributes {
        self.inner
            .state
            .lock()
            .attributes
            .iter()
            .filter(|(k, _)| !names.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns `true` if the model has no attributes.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().attributes.is_empty()
    }

    /// Assign attributes with default options.
    pub fn set(&self, attributes: impl IntoAttributes) -> bool {
        self.set_with(attributes, SetOptions::new())
    }

    /// Assign attributes as one batch.
    ///
    /// Returns `false` if validation was requested and rejected the
    /// candidate state, in which case nothing was applied.
    #[tracing::instrument(skip_all, target = "trellis_core::model", level = "trace", fields(cid = %self.inner.cid))]
    pub fn set_with(&self, attributes: impl IntoAttributes, options: SetOptions) -> bool {
        let attributes = attributes.into_attributes();
        if options.validate && !self.run_validation(&attributes, &options) {
            return false;
        }

        let (changes, nested) = {
            let mut state = self.inner.state.lock();
            let nested = state.changing;
            state.changing = true;
            if !nested {
                state.previous = state.attributes.clone();
                state.changed.clear();
            }

            let mut ops: Vec<(String, Option<Value>)> = Vec::with_capacity(attributes.len());
            if options.reset {
                ops.extend(
                    state
                        .attributes
                        .keys()
                        .filter(|key| !attributes.contains_key(*key))
                        .map(|key| (key.clone(), None)),
                );
            }
            ops.extend(
                attributes
                    .into_iter()
                    .map(|(key, value)| (key, (!options.unset).then_some(value))),
            );

            let mut changes = Vec::new();
            for (key, value) in ops {
                if state.attributes.get(&key) != value.as_ref() {
                    changes.push(key.clone());
                }
                if state.previous.get(&key) != value.as_ref() {
                    let recorded = value.clone().unwrap_or(Value::Null);
                    state.changed.insert(key.clone(), recorded);
                } else {
                    state.changed.remove(&key);
                }
                match value {
                    Some(value) => state.attributes.insert(key, value),
                    None => state.attributes.remove(&key),
                };
            }

            if !options.silent && !changes.is_empty() {
                state.pending = Some(options);
            }
            (changes, nested)
        };
        tracing::trace!(target: "trellis_core::model", changed = changes.len(), nested, "applied");

        if !options.silent {
            for key in &changes {
                let value = self.get(key).unwrap_or(Value::Null);
                self.inner.bus.trigger(&Event::new(
                    format!("change:{key}"),
                    Payload::Attribute {
                        model: self.clone(),
                        value,
                    },
                ));
            }
        }

        if nested {
            return true;
        }

        if !options.silent {
            while self.inner.state.lock().pending.take().is_some() {
                self.inner.bus.trigger(&Event::new(
                    "change",
                    Payload::Model {
                        model: self.clone(),
                    },
                ));
            }
        }

        let mut state = self.inner.state.lock();
        state.pending = None;
        state.changing = false;
        true
    }

    /// Remove one attribute.
    pub fn unset(&self, attr: &str, options: SetOptions) -> bool {
        self.set_with((attr, Value::Null), options.with_unset(true))
    }

    /// Remove every attribute.
    pub fn clear(&self, options: SetOptions) -> bool {
        let all: Attributes = self
            .keys()
            .into_iter()
            .map(|key| (key, Value::Null))
            .collect();
        self.set_with(all, options.with_unset(true))
    }

    /// Whether the last batch changed anything, or changed `attr`.
    pub fn has_changed(&self, attr: Option<&str>) -> bool {
        let state = self.inner.state.lock();
        match attr {
            Some(attr) => state.changed.contains_key(attr),
            None => !state.changed.is_empty(),
        }
    }

    /// The attributes changed by the last batch, or those in `diff` that
    /// differ from the current state. `None` if there are none.
    pub fn changed_attributes(&self, diff: Option<&Attributes>) -> Option<Attributes> {
        let state = self.inner.state.lock();
        let Some(diff) = diff else {
            return (!state.changed.is_empty()).then(|| state.changed.clone());
        };
        let baseline = if state.changing {
            &state.previous
        } else {
            &state.attributes
        };
        let changed: Attributes = diff
            .iter()
            .filter(|(key, value)| baseline.get(*key) != Some(*value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (!changed.is_empty()).then_some(changed)
    }

    /// The value of `attr` before the last batch.
    pub fn previous(&self, attr: &str) -> Option<Value> {
        self.inner.state.lock().previous.get(attr).cloned()
    }

    /// Every attribute as it was before the last batch.
    pub fn previous_attributes(&self) -> Attributes {
        self.inner.state.lock().previous.clone()
    }

    /// Run the validation hook against the current attributes.
    pub fn is_valid(&self, options: SetOptions) -> bool {
        self.run_validation(&Attributes::new(), &options.with_reset(false).with_validate(true))
    }

    /// The error recorded by the last validation run.
    pub fn validation_error(&self) -> Option<Value> {
        self.inner.state.lock().validation_error.clone()
    }

    fn run_validation(&self, attributes: &Attributes, options: &SetOptions) -> bool {
        if !self.inner.config.has_validator() {
            return true;
        }
        let candidate = {
            let state = self.inner.state.lock();
            let mut candidate = state.attributes.clone();
            if options.reset {
                candidate.retain(|key, _| attributes.contains_key(key));
            }
            for (key, value) in attributes {
                if options.unset {
                    candidate.remove(key);
                } else {
                    candidate.insert(key.clone(), value.clone());
                }
            }
            candidate
        };

        let error = self.inner.config.validate(&candidate, options);
        self.inner.state.lock().validation_error = error.clone();
        let Some(error) = error else {
            return true;
        };

        tracing::debug!(target: "trellis_core::model", cid = %self.inner.cid, %error, "validation rejected");
        self.inner.bus.trigger(&Event::new(
            "invalid",
            Payload::Invalid {
                model: self.clone(),
                error,
            },
        ));
        false
    }

    /// A new model with the same configuration and a copy of the attributes.
    pub fn duplicate(&self) -> Model {
        Model::with_config(
            Arc::clone(&self.inner.config),
            self.attributes(),
            SetOptions::new(),
        )
    }

    /// Announce that this model is gone.
    ///
    /// Releases everything the model listens to and fires `"destroy"`, which
    /// makes every collection holding the model drop it.
    pub fn destroy(&self) {
        tracing::debug!(target: "trellis_core::model", cid = %self.inner.cid, "destroy");
        self.inner.bus.stop_listening_all();
        self.inner.bus.trigger(&Event::new(
            "destroy",
            Payload::Model {
                model: self.clone(),
            },
        ));
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

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Model {}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("cid", &self.inner.cid)
            .field("attributes", &self.inner.state.lock().attributes)
            .finish()
    }
}

impl Emitter for Model {
    fn emitter_id(&self) -> EmitterId {
        self.inner.bus.id()
    }

    fn on(
        &self,
        name: &str,
        handler: Handler,
        context: Option<EmitterId>,
    ) -> std::result::Result<(), EventError> {
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
    use crate::event::ALL;
    use serde::Deserialize;
    use serde_json::json;

    fn record_all(model: &Model) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        model.events().on(
            ALL,
            &Handler::new(move |event| log_clone.lock().push(event.name().to_string())),
        );
        log
    }

    #[test]
    fn test_get_and_has() {
        let model = Model::with_attributes(json!({"a": 1, "b": null}));
        assert_eq!(model.get("a"), Some(json!(1)));
        assert!(model.has("a"));
        assert!(!model.has("b"));
        assert!(!model.has("missing"));
    }

    #[test]
    fn test_construction_does_not_report_changes() {
        let model = Model::with_attributes(json!({"a": 1}));
        assert!(!model.has_changed(None));
        assert_eq!(model.changed_attributes(None), None);
    }

    #[test]
    fn test_defaults_are_overridden_by_attributes() {
        let config = ModelConfig::builder()
            .default_value("title", "untitled")
            .default_value("done", false)
            .build();
        let model = Model::with_config(config, json!({"title": "write"}), SetOptions::new());
        assert_eq!(model.get("title"), Some(json!("write")));
        assert_eq!(model.get("done"), Some(json!(false)));
        assert_eq!(model.keys(), vec!["title", "done"]);
    }

    #[test]
    fn test_parse_hook_on_construction() {
        let config = ModelConfig::builder()
            .parse(|raw| raw.get("data").cloned().unwrap_or_default().into_attributes())
            .build();
        let model = Model::with_config(
            config,
            json!({"data": {"id": 4}}),
            SetOptions::new().with_parse(true),
        );
        assert_eq!(model.id(), Some(json!(4)));
    }

    #[test]
    fn test_change_events_in_order() {
        let model = Model::new();
        let log = record_all(&model);

        model.set(json!({"a": 1, "b": 2}));

        assert_eq!(*log.lock(), vec!["change:a", "change:b", "change"]);
    }

    #[test]
    fn test_set_same_value_fires_nothing() {
        let model = Model::with_attributes(json!({"a": {"deep": [1, 2]}}));
        let log = record_all(&model);

        model.set(json!({"a": {"deep": [1, 2]}}));

        assert!(log.lock().is_empty());
        assert!(!model.has_changed(None));
    }

    #[test]
    fn test_silent_set_records_changes_without_events() {
        let model = Model::new();
        let log = record_all(&model);

        model.set_with(json!({"a": 1}), SetOptions::silent());

        assert!(log.lock().is_empty());
        assert!(model.has_changed(Some("a")));
    }

    #[test]
    fn test_change_payload_carries_current_value() {
        let model = Model::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        model.events().on(
            "change:a",
            &Handler::new(move |event| {
                if let Payload::Attribute { value, .. } = event.payload() {
                    *seen_clone.lock() = Some(value.clone());
                }
            }),
        );
        model.set(("a", 5));
        assert_eq!(*seen.lock(), Some(json!(5)));
    }

    #[test]
    fn test_previous_and_has_changed() {
        let model = Model::with_attributes(json!({"a": 1, "b": 2}));
        model.set(json!({"a": 10}));

        assert!(model.has_changed(Some("a")));
        assert!(!model.has_changed(Some("b")));
        assert_eq!(model.previous("a"), Some(json!(1)));
        assert_eq!(model.previous_attributes(), json!({"a": 1, "b": 2}).into_attributes());
        assert_eq!(model.changed_attributes(None), Some(json!({"a": 10}).into_attributes()));

        model.set(json!({"b": 20}));
        assert!(!model.has_changed(Some("a")));
        assert_eq!(model.previous("a"), Some(json!(10)));
    }

    #[test]
    fn test_changed_attributes_against_diff() {
        let model = Model::with_attributes(json!({"a": 1, "b": 2}));
        let diff = json!({"a": 1, "b": 3}).into_attributes();
        assert_eq!(model.changed_attributes(Some(&diff)), Some(json!({"b": 3}).into_attributes()));
        let same = json!({"a": 1}).into_attributes();
        assert_eq!(model.changed_attributes(Some(&same)), None);
    }

    #[test]
    fn test_change_reverted_within_batch_is_not_recorded() {
        let model = Model::with_attributes(json!({"x": 1}));
        let nested = model.clone();
        model.events().once(
            "change:x",
            &Handler::new(move |_| {
                nested.set(json!({"x": 1}));
            }),
        );

        model.set(json!({"x": 2}));

        assert!(!model.has_changed(Some("x")));
        assert_eq!(model.get("x"), Some(json!(1)));
    }

    #[test]
    fn test_nested_set_event_order() {
        let model = Model::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let inner = model.clone();
        model.events().on(
            "change",
            &Handler::new(move |_| {
                inner.set_with(json!({"z": true}), SetOptions::silent());
            }),
        );
        let inner = model.clone();
        model.events().on(
            "change:x",
            &Handler::new(move |_| {
                inner.set(json!({"y": true}));
            }),
        );
        let events_clone = events.clone();
        model.events().on(
            ALL,
            &Handler::new(move |event| events_clone.lock().push(event.name().to_string())),
        );

        model.set(json!({"x": true}));

        assert_eq!(*events.lock(), vec!["change:y", "change:x", "change"]);
        assert_eq!(model.get("z"), Some(json!(true)));
    }

    #[test]
    fn test_nested_set_in_change_handler_fires_another_change() {
        let model = Model::new();
        let count = Arc::new(Mutex::new(0));

        let inner = model.clone();
        let count_clone = count.clone();
        model.events().on(
            "change",
            &Handler::new(move |_| {
                let mut count = count_clone.lock();
                *count += 1;
                if *count == 1 {
                    drop(count);
                    inner.set(json!({"second": true}));
                }
            }),
        );

        model.set(json!({"first": true}));

        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_unset_and_clear() {
        let model = Model::with_attributes(json!({"a": 1, "b": 2}));
        let log = record_all(&model);

        model.unset("a", SetOptions::new());
        assert_eq!(model.get("a"), None);
        assert_eq!(model.changed_attributes(None), Some(json!({"a": null}).into_attributes()));

        model.clear(SetOptions::new());
        assert!(model.is_empty());
        assert_eq!(
            *log.lock(),
            vec!["change:a", "change", "change:b", "change"]
        );
    }

    #[test]
    fn test_unset_missing_attribute_is_a_no_op() {
        let model = Model::new();
        let log = record_all(&model);
        model.unset("nothing", SetOptions::new());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_reset_removes_missing_attributes() {
        let model = Model::with_attributes(json!({"a": 1, "b": 2, "c": 3}));
        let log = record_all(&model);

        model.set_with(json!({"b": 20}), SetOptions::new().with_reset(true));

        assert_eq!(model.to_json(), json!({"b": 20}));
        assert_eq!(*log.lock(), vec!["change:a", "change:c", "change:b", "change"]);
    }

    #[test]
    fn test_validation_rejects_whole_batch() {
        let config = ModelConfig::builder()
            .validate(|attrs, _| {
                attrs
                    .get("age")
                    .and_then(Value::as_i64)
                    .filter(|age| *age < 0)
                    .map(|_| json!("age must be positive"))
            })
            .build();
        let model = Model::with_config(config, json!({"age": 1, "name": "a"}), SetOptions::new());
        let log = record_all(&model);

        let applied = model.set_with(
            json!({"age": -1, "name": "b"}),
            SetOptions::new().with_validate(true),
        );

        assert!(!applied);
        assert_eq!(model.get("name"), Some(json!("a")));
        assert_eq!(model.validation_error(), Some(json!("age must be positive")));
        assert_eq!(*log.lock(), vec!["invalid"]);

        assert!(model.set_with(json!({"age": 2}), SetOptions::new().with_validate(true)));
        assert_eq!(model.validation_error(), None);
    }

    #[test]
    fn test_validation_sees_the_reset_result() {
        let config = ModelConfig::builder()
            .validate(|attrs, _| (!attrs.contains_key("a")).then(|| json!("a is required")))
            .build();
        let model = Model::with_config(config, json!({"a": 1}), SetOptions::new());
        let reset = SetOptions::new().with_reset(true).with_validate(true);

        assert!(!model.set_with(json!({"b": 2}), reset));
        assert_eq!(model.to_json(), json!({"a": 1}));
        assert_eq!(model.validation_error(), Some(json!("a is required")));

        assert!(model.set_with(json!({"a": 3}), reset));
        assert_eq!(model.to_json(), json!({"a": 3}));
        assert!(model.is_valid(SetOptions::new().with_reset(true)));
    }

    #[test]
    fn test_set_without_validate_flag_skips_hook() {
        let config = ModelConfig::builder()
            .validate(|_, _| Some(json!("never valid")))
            .build();
        let model = Model::with_config(config, Attributes::new(), SetOptions::new());
        assert!(model.set(("a", 1)));
        assert!(!model.is_valid(SetOptions::new()));
        assert_eq!(model.validation_error(), Some(json!("never valid")));
    }

    #[test]
    fn test_identity() {
        let config = ModelConfig::builder().id_attribute("_id").build();
        let model = Model::with_config(config, json!({"id": 1}), SetOptions::new());
        assert!(model.is_new());
        model.set(("_id", "x"));
        assert_eq!(model.id(), Some(json!("x")));
        assert!(!model.is_new());
    }

    #[test]
    fn test_cids_are_unique_and_prefixed() {
        let config = ModelConfig::builder().cid_prefix("todo").build();
        let a = Model::with_config(config.clone(), Attributes::new(), SetOptions::new());
        let b = Model::with_config(config, Attributes::new(), SetOptions::new());
        assert!(a.cid().starts_with("todo"));
        assert_ne!(a.cid(), b.cid());
    }

    #[test]
    fn test_duplicate_is_a_new_model() {
        let model = Model::with_attributes(json!({"a": [1]}));
        let copy = model.duplicate();
        assert_ne!(model, copy);
        assert_ne!(model.cid(), copy.cid());
        assert_eq!(model.to_json(), copy.to_json());
    }

    #[test]
    fn test_pick_and_omit() {
        let model = Model::with_attributes(json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(Value::Object(model.pick(&["a", "c", "z"])), json!({"a": 1, "c": 3}));
        assert_eq!(Value::Object(model.omit(&["a"])), json!({"b": 2, "c": 3}));
        assert_eq!(model.values(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(model.pairs()[1], ("b".to_string(), json!(2)));
    }

    #[test]
    fn test_destroy_fires_and_releases_listening() {
        let model = Model::new();
        let other = Model::new();
        model
            .events()
            .listen_to(&other, "change", &Handler::new(|_| {}))
            .unwrap();
        let log = record_all(&model);

        model.destroy();

        assert_eq!(*log.lock(), vec!["destroy"]);
        assert_eq!(model.events().listening_count(), 0);
    }

    #[test]
    fn test_typed_round_trip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Todo {
            title: String,
            done: bool,
        }

        let todo = Todo {
            title: "ship".to_string(),
            done: false,
        };
        let model = Model::from_serializable(&todo).unwrap();
        assert_eq!(model.get_as::<String>("title").unwrap(), Some("ship".to_string()));
        assert_eq!(model.to_typed::<Todo>().unwrap(), todo);

        assert!(matches!(
            Model::from_serializable(&[1, 2]),
            Err(TrellisError::NotAnObject("an array"))
        ));
    }

    #[test]
    fn test_loading_flag() {
        let model = Model::new();
        assert!(!model.is_loading());
        model.set_loading(true);
        assert!(model.is_loading());
    }
}
