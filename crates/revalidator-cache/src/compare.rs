//! Structural equality used to suppress redundant cache updates.
//!
//! When a fetch or a direct write produces a value that is structurally equal to the cached
//! one, the cache keeps the existing `Arc` and does not notify observers. Consumers that
//! compare by pointer therefore see a stable reference for unchanged data.

use std::sync::Arc;

use serde_json::Value;

/// Decides whether two values are interchangeable for observers.
pub trait StructuralComparator<V: ?Sized>: Send + Sync + 'static {
    fn equal(&self, a: &V, b: &V) -> bool;
}

/// Compares values with their [`PartialEq`] implementation.
///
/// Derived `PartialEq` is already deep over fields, maps and sequences, which makes this the
/// right default for most value types.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepEq;

impl<V: PartialEq + ?Sized> StructuralComparator<V> for DeepEq {
    fn equal(&self, a: &V, b: &V) -> bool {
        a == b
    }
}

/// Compares JSON documents, treating numbers as equal when they denote the same value.
///
/// `serde_json` keeps `1` and `1.0` apart, while most JSON producers do not care which of the
/// two they emit.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonComparator;

impl StructuralComparator<Value> for JsonComparator {
    fn equal(&self, a: &Value, b: &Value) -> bool {
        json_equal(a, b)
    }
}

fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| json_equal(a, b)))
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| json_equal(a, b))
        }
        (Value::Number(a), Value::Number(b)) => {
            a == b || matches!((a.as_f64(), b.as_f64()), (Some(a), Some(b)) if a == b)
        }
        (a, b) => a == b,
    }
}

impl<V, F> StructuralComparator<V> for F
where
    V: ?Sized,
    F: Fn(&V, &V) -> bool + Send + Sync + 'static,
{
    fn equal(&self, a: &V, b: &V) -> bool {
        self(a, b)
    }
}

/// Returns `previous` when it is structurally equal to `next`, and `next` wrapped otherwise.
///
/// The boolean tells whether the value changed.
pub fn share_structure<V: 'static>(
    comparator: &dyn StructuralComparator<V>,
    previous: Option<&Arc<V>>,
    next: V,
) -> (Arc<V>, bool) {
    match previous {
        Some(previous) if comparator.equal(previous, &next) => (Arc::clone(previous), false),
        _ => (Arc::new(next), true),
    }
}
