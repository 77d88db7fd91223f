//! Inputs to collection operations.

use serde_json::Value;
use trellis_core::{Attributes, IntoAttributes, Model, SetOptions};

/// Options for [`Collection::set`](super::Collection::set) and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert members that are not present yet.
    pub add: bool,
    /// Extract members that are absent from the input.
    pub remove: bool,
    /// Merge attributes of input entries into existing members.
    pub merge: bool,
    /// Insert new members at this index; negative counts from the end.
    pub at: Option<isize>,
    /// `Some(false)` suppresses comparator sorting for this call.
    pub sort: Option<bool>,
    /// Suppress every event, including the members' own change events.
    pub silent: bool,
    /// Validate new and merged members.
    pub validate: bool,
    /// Run the model parse hook on each entry.
    pub parse: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::set()
    }
}

impl UpdateOptions {
    /// Full reconciliation: add, remove and merge.
    pub fn set() -> Self {
        Self {
            add: true,
            remove: true,
            merge: true,
            at: None,
            sort: None,
            silent: false,
            validate: false,
            parse: false,
        }
    }

    /// Additive update: nothing is removed and nothing merged.
    pub fn add() -> Self {
        Self {
            remove: false,
            merge: false,
            ..Self::set()
        }
    }

    /// Set the `add` flag.
    pub fn with_add(mut self, add: bool) -> Self {
        self.add = add;
        self
    }

    /// Set the `remove` flag.
    pub fn with_remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }

    /// Set the `merge` flag.
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    /// Insert at a given index.
    pub fn with_at(mut self, at: isize) -> Self {
        self.at = Some(at);
        self
    }

    /// Force or suppress comparator sorting.
    pub fn with_sort(mut self, sort: bool) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Set the `silent` flag.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
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

    /// The options forwarded to member `set` calls.
    pub fn set_options(&self) -> SetOptions {
        SetOptions::new()
            .with_silent(self.silent)
            .with_validate(self.validate)
    }
}

/// One entry of a collection update: an existing model or raw attributes.
#[derive(Debug, Clone)]
pub enum Member {
    /// A model instance, inserted as-is.
    Model(Model),
    /// Attributes from which a model is built on insertion.
    Attributes(Attributes),
}

impl Member {
    /// The attributes this entry carries.
    pub fn attributes(&self) -> Attributes {
        match self {
            Self::Model(model) => model.attributes(),
            Self::Attributes(attrs) => attrs.clone(),
        }
    }

    /// Returns `true` if this entry is exactly `model`.
    pub fn is(&self, model: &Model) -> bool {
        matches!(self, Self::Model(m) if m.ptr_eq(model))
    }
}

impl From<Model> for Member {
    fn from(model: Model) -> Self {
        Self::Model(model)
    }
}

impl From<&Model> for Member {
    fn from(model: &Model) -> Self {
        Self::Model(model.clone())
    }
}

impl From<Attributes> for Member {
    fn from(attrs: Attributes) -> Self {
        Self::Attributes(attrs)
    }
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        Self::Attributes(value.into_attributes())
    }
}

/// A way of finding a member.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The instance itself, matched by identity key or client id.
    Model(Model),
    /// An identity-key value, or a client id when given as a string.
    Id(Value),
    /// Raw attributes, matched by the identity key they carry.
    Attributes(Attributes),
}

impl From<&Model> for Lookup {
    fn from(model: &Model) -> Self {
        Self::Model(model.clone())
    }
}

impl From<Model> for Lookup {
    fn from(model: Model) -> Self {
        Self::Model(model)
    }
}

impl From<&Member> for Lookup {
    fn from(member: &Member) -> Self {
        match member {
            Member::Model(model) => Self::Model(model.clone()),
            Member::Attributes(attrs) => Self::Attributes(attrs.clone()),
        }
    }
}

impl From<Value> for Lookup {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(attrs) => Self::Attributes(attrs),
            other => Self::Id(other),
        }
    }
}

impl From<&str> for Lookup {
    fn from(key: &str) -> Self {
        Self::Id(Value::String(key.to_string()))
    }
}

impl From<i64> for Lookup {
    fn from(id: i64) -> Self {
        Self::Id(Value::from(id))
    }
}

impl From<i32> for Lookup {
    fn from(id: i32) -> Self {
        Self::Id(Value::from(id))
    }
}

impl From<u64> for Lookup {
    fn from(id: u64) -> Self {
        Self::Id(Value::from(id))
    }
}

impl From<Attributes> for Lookup {
    fn from(attrs: Attributes) -> Self {
        Self::Attributes(attrs)
    }
}

/// The string under which an identity value is indexed.
///
/// `1` and `"1"` index to the same slot.
pub(crate) fn index_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presets() {
        let set = UpdateOptions::set();
        assert!(set.add && set.remove && set.merge);
        let add = UpdateOptions::add();
        assert!(add.add && !add.remove && !add.merge);
        assert_eq!(UpdateOptions::default(), set);
    }

    #[test]
    fn test_set_options_forward_flags() {
        let opts = UpdateOptions::set().with_silent(true).with_validate(true);
        let set = opts.set_options();
        assert!(set.silent && set.validate && !set.unset);
    }

    #[test]
    fn test_index_key_unifies_numbers_and_strings() {
        assert_eq!(index_key(&json!(1)), index_key(&json!("1")));
        assert_ne!(index_key(&json!(1)), index_key(&json!(2)));
    }

    #[test]
    fn test_member_identity() {
        let model = Model::new();
        let member = Member::from(&model);
        assert!(member.is(&model));
        assert!(!Member::from(json!({"id": 1})).is(&model));
    }
}
