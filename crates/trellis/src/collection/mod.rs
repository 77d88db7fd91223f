//! Ordered, indexed sets of models.
//!
//! A [`Collection`] owns an ordering of [`Model`]s and keeps two lookup
//! indexes beside it: one by identity key and one by client id. Its central
//! operation is [`Collection::set`], which reconciles the current members
//! against a new list and reports the result as a stream of events.
//!
//! # Core Types
//!
//! - [`Collection`]: The member set itself
//! - [`CollectionBuilder`]: Comparator, model factory and hooks
//! - [`Comparator`]: Sort-key, two-argument or attribute ordering
//! - [`UpdateOptions`]: Flags for `set`, `add`, `remove` and `reset`
//! - [`Member`] / [`Lookup`]: What goes in and how things are found
//!
//! # Event Order
//!
//! One `set` call announces its work in this order:
//!
//! ```text
//! change:<attr> / change   (merged members, as each merge happens)
//! remove                   (one per extracted member)
//! add                      (one per inserted member)
//! sort                     (if the order changed)
//! update                   (once, with the whole delta)
//! ```

mod comparator;
mod indexed;
mod options;

pub use comparator::{compare_values, CompareFn, Comparator, SortKeyFn};
pub use indexed::{
    Collection, CollectionBuilder, CollectionConfig, IdentityFn, ModelFactory, ResponseParseFn,
};
pub use options::{Lookup, Member, UpdateOptions};

pub(crate) use options::index_key;

use trellis_core::{Attributes, Model};

/// Returns `true` if every pair in `attrs` is present on `model`.
pub(crate) fn matches_attributes(model: &Model, attrs: &Attributes) -> bool {
    attrs
        .iter()
        .all(|(key, value)| model.get(key).as_ref() == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::IntoAttributes;

    #[test]
    fn test_matches_attributes() {
        let model = Model::with_attributes(json!({"a": 1, "b": "x"}));
        assert!(matches_attributes(&model, &json!({"a": 1}).into_attributes()));
        assert!(matches_attributes(&model, &Attributes::new()));
        assert!(!matches_attributes(&model, &json!({"a": 2}).into_attributes()));
        assert!(!matches_attributes(&model, &json!({"c": null}).into_attributes()));
    }
}
