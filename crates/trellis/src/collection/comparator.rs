//! Orderings over models.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use trellis_core::Model;

/// Derives a sort key from a model.
pub type SortKeyFn = dyn Fn(&Model) -> Value + Send + Sync;

/// Compares two models directly.
pub type CompareFn = dyn Fn(&Model, &Model) -> Ordering + Send + Sync;

/// How a collection or view orders its members.
///
/// The variant is chosen once, at construction, and decides how sorting and
/// binary-search insertion are carried out.
#[derive(Clone)]
pub enum Comparator {
    /// Order by a key derived from each model.
    SortKey(Arc<SortKeyFn>),
    /// Order by a two-argument comparison.
    Compare(Arc<CompareFn>),
    /// Order by the value of one attribute.
    Attribute(String),
}

impl Comparator {
    /// Order by a derived key.
    pub fn sort_key<F>(key: F) -> Self
    where
        F: Fn(&Model) -> Value + Send + Sync + 'static,
    {
        Self::SortKey(Arc::new(key))
    }

    /// Order by a comparison function.
    pub fn compare<F>(compare: F) -> Self
    where
        F: Fn(&Model, &Model) -> Ordering + Send + Sync + 'static,
    {
        Self::Compare(Arc::new(compare))
    }

    /// Order by an attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        Self::Attribute(name.into())
    }

    /// The attribute this comparator reads, when it is attribute-based.
    pub fn attribute_name(&self) -> Option<&str> {
        match self {
            Self::Attribute(name) => Some(name),
            _ => None,
        }
    }

    /// Compare two models.
    pub fn ordering(&self, a: &Model, b: &Model) -> Ordering {
        match self {
            Self::SortKey(key) => compare_values(&key(a), &key(b)),
            Self::Compare(compare) => compare(a, b),
            Self::Attribute(name) => compare_values(
                &a.get(name).unwrap_or(Value::Null),
                &b.get(name).unwrap_or(Value::Null),
            ),
        }
    }

    /// Stable-sort `models` in place.
    pub fn sort(&self, models: &mut Vec<Model>) {
        match self {
            Self::Compare(compare) => models.sort_by(|a, b| compare(a, b)),
            Self::SortKey(_) | Self::Attribute(_) => {
                let mut keyed: Vec<(Value, Model)> = models
                    .drain(..)
                    .map(|model| (self.key(&model), model))
                    .collect();
                keyed.sort_by(|a, b| compare_values(&a.0, &b.0));
                models.extend(keyed.into_iter().map(|(_, model)| model));
            }
        }
    }

    /// The index after every member that sorts at or before `model`.
    ///
    /// `models` must already be sorted by this comparator.
    pub fn upper_bound(&self, models: &[Model], model: &Model) -> usize {
        match self {
            Self::Compare(compare) => {
                models.partition_point(|other| compare(other, model) != Ordering::Greater)
            }
            Self::SortKey(_) | Self::Attribute(_) => {
                let key = self.key(model);
                models.partition_point(|other| {
                    compare_values(&self.key(other), &key) != Ordering::Greater
                })
            }
        }
    }

    /// Returns `true` if every adjacent pair of `models` is in order.
    pub fn is_sorted(&self, models: &[Model]) -> bool {
        models
            .windows(2)
            .all(|pair| self.ordering(&pair[0], &pair[1]) != Ordering::Greater)
    }

    fn key(&self, model: &Model) -> Value {
        match self {
            Self::SortKey(key) => key(model),
            Self::Attribute(name) => model.get(name).unwrap_or(Value::Null),
            Self::Compare(_) => Value::Null,
        }
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SortKey(_) => f.write_str("Comparator::SortKey(..)"),
            Self::Compare(_) => f.write_str("Comparator::Compare(..)"),
            Self::Attribute(name) => f.debug_tuple("Comparator::Attribute").field(name).finish(),
        }
    }
}

/// Compares two JSON values for sorting.
///
/// Numbers compare numerically, strings lexically, booleans `false < true`.
/// Null sorts after everything else; values of different kinds order by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => match (na.as_i64(), nb.as_i64()) {
            (Some(ia), Some(ib)) => ia.cmp(&ib),
            _ => {
                let fa = na.as_f64().unwrap_or(f64::NAN);
                let fb = nb.as_f64().unwrap_or(f64::NAN);
                fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        (Value::Array(xa), Value::Array(xb)) => xa
            .iter()
            .zip(xb)
            .map(|(x, y)| compare_values(x, y))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| xa.len().cmp(&xb.len())),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}
