//! Shard key patterns and chunk ranges
//!
//! A shard key pattern is an ordered list of field paths, each either
//! ascending or hashed. A chunk is the half-open range `[min, max)` in
//! the pattern's key space; membership is decided on the key extracted
//! from a document, with hashed fields hashed before comparison.

use crate::doc::{cmp_values, Document};
use crate::error::{MigrateError, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::hash::BuildHasher;

/// Direction of a single shard-key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    Ascending,
    Hashed,
}

/// An ordered shard key pattern, parsed from a pattern document such as
/// `{"x": 1}` or `{"x": "hashed"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardKeyPattern {
    fields: Vec<(String, KeyOrder)>,
}

impl ShardKeyPattern {
    pub fn parse(pattern: &Document) -> Result<Self> {
        if pattern.is_empty() {
            return Err(MigrateError::invalid("empty shard key pattern"));
        }
        let mut fields = Vec::with_capacity(pattern.0.len());
        for (name, spec) in pattern.0.iter() {
            let order = match spec {
                Value::Number(_) => KeyOrder::Ascending,
                Value::String(s) if s == "hashed" => KeyOrder::Hashed,
                other => {
                    return Err(MigrateError::invalid(format!(
                        "unsupported shard key field spec {} for {}",
                        other, name
                    )))
                }
            };
            fields.push((name.clone(), order));
        }
        Ok(ShardKeyPattern { fields })
    }

    /// The pattern as a document, for wire payloads and metadata.
    pub fn pattern_doc(&self) -> Document {
        let mut doc = Document::new();
        for (name, order) in &self.fields {
            match order {
                KeyOrder::Ascending => doc.insert(name.clone(), Value::from(1)),
                KeyOrder::Hashed => doc.insert(name.clone(), Value::from("hashed")),
            }
        }
        doc
    }

    pub fn fields(&self) -> &[(String, KeyOrder)] {
        &self.fields
    }

    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|(_, o)| *o == KeyOrder::Hashed)
    }

    /// Extract the shard key of a document. Hashed fields are hashed;
    /// missing fields become null so extraction is total.
    pub fn extract_key(&self, doc: &Document) -> OrderedKey {
        let parts = self
            .fields
            .iter()
            .map(|(name, order)| {
                let value = doc.get(name).cloned().unwrap_or(Value::Null);
                match order {
                    KeyOrder::Ascending => KeyPart::Val(value),
                    KeyOrder::Hashed => KeyPart::Val(Value::from(hash_key_element(&value))),
                }
            })
            .collect();
        OrderedKey(parts)
    }

    /// Interpret a range bound document as a key. Bounds are already in
    /// key space (hashed fields hold hash values), so no hashing here.
    pub fn key_from_bound(&self, bound: &Document) -> OrderedKey {
        let parts = self
            .fields
            .iter()
            .map(|(name, _)| match bound.get(name) {
                Some(v) => KeyPart::Val(v.clone()),
                None => KeyPart::Min,
            })
            .collect();
        OrderedKey(parts)
    }

    /// Extend a possibly partial bound to the full key arity, padding
    /// missing trailing fields with MinKey so it fits the index format.
    pub fn extend_range_bound(&self, bound: &Document) -> OrderedKey {
        self.key_from_bound(bound)
    }
}

/// One element of an ordered key: the MinKey/MaxKey sentinels sort
/// below/above every concrete value.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Min,
    Val(Value),
    Max,
}

/// A comparable shard-key tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedKey(pub Vec<KeyPart>);

impl Eq for OrderedKey {}

fn cmp_parts(a: &KeyPart, b: &KeyPart) -> Ordering {
    match (a, b) {
        (KeyPart::Min, KeyPart::Min) => Ordering::Equal,
        (KeyPart::Min, _) => Ordering::Less,
        (_, KeyPart::Min) => Ordering::Greater,
        (KeyPart::Max, KeyPart::Max) => Ordering::Equal,
        (KeyPart::Max, _) => Ordering::Greater,
        (_, KeyPart::Max) => Ordering::Less,
        (KeyPart::Val(x), KeyPart::Val(y)) => cmp_values(x, y),
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = cmp_parts(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Fixed seeds keep the hashed key space stable across restarts.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x2545_f491_4f6c_dd1d,
    0x9e37_79b9_7f4a_7c15,
    0x6a09_e667_f3bc_c909,
    0xbb67_ae85_84ca_a73b,
);

/// Stable 64-bit hash of a key element, used for hashed shard keys.
pub fn hash_key_element(value: &Value) -> i64 {
    let state =
        ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    state.hash_one(value.to_string()) as i64
}

/// Whether a document's shard key lies in `[min, max)`.
pub fn is_in_range(
    doc: &Document,
    min: &Document,
    max: &Document,
    pattern: &ShardKeyPattern,
) -> bool {
    let key = pattern.extract_key(doc);
    let min_key = pattern.key_from_bound(min);
    let max_key = pattern.key_from_bound(max);
    key >= min_key && key < max_key
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn pattern(v: serde_json::Value) -> ShardKeyPattern {
        ShardKeyPattern::parse(&doc(v)).unwrap()
    }

    #[test]
    fn test_in_range_boundaries() {
        let skey = pattern(json!({"x": 1}));
        let min = doc(json!({"x": 1}));
        let max = doc(json!({"x": 5}));

        assert!(!is_in_range(&doc(json!({"x": 0})), &min, &max, &skey));
        assert!(is_in_range(&doc(json!({"x": 1})), &min, &max, &skey));
        assert!(is_in_range(&doc(json!({"x": 3})), &min, &max, &skey));
        assert!(is_in_range(&doc(json!({"x": 4})), &min, &max, &skey));
        assert!(!is_in_range(&doc(json!({"x": 5})), &min, &max, &skey));
        assert!(!is_in_range(&doc(json!({"x": 6})), &min, &max, &skey));
    }

    #[test]
    fn test_hashed_key_range() {
        let hashed = pattern(json!({"x": "hashed"}));

        let h = hash_key_element(&json!(3));
        let min = doc(json!({"x": h - 2}));
        let max = doc(json!({"x": h + 2}));

        assert!(is_in_range(&doc(json!({"x": 3})), &min, &max, &hashed));
        assert!(!is_in_range(
            &doc(json!({"x": 3})),
            &doc(json!({"x": 1})),
            &doc(json!({"x": 5})),
            &hashed
        ));
        assert!(!is_in_range(&doc(json!({"x": 4})), &min, &max, &hashed));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_key_element(&json!(42)), hash_key_element(&json!(42)));
        assert_ne!(hash_key_element(&json!(42)), hash_key_element(&json!(43)));
    }

    #[test]
    fn test_compound_pattern() {
        let skey = pattern(json!({"a": 1, "b": 1}));
        let min = doc(json!({"a": 1, "b": 1}));
        let max = doc(json!({"a": 2, "b": 1}));

        assert!(is_in_range(&doc(json!({"a": 1, "b": 9})), &min, &max, &skey));
        assert!(!is_in_range(&doc(json!({"a": 2, "b": 2})), &min, &max, &skey));
    }

    #[test]
    fn test_extend_range_bound_pads_min() {
        let skey = pattern(json!({"a": 1, "b": 1}));
        let partial = skey.extend_range_bound(&doc(json!({"a": 5})));
        let full = skey.extend_range_bound(&doc(json!({"a": 5, "b": 0})));
        assert!(partial < full);
    }

    #[test]
    fn test_missing_field_extracts_null() {
        let skey = pattern(json!({"x": 1}));
        let key = skey.extract_key(&doc(json!({"y": 1})));
        assert_eq!(key.0, vec![KeyPart::Val(json!(null))]);
    }

    #[test]
    fn test_parse_rejects_bad_spec() {
        assert!(ShardKeyPattern::parse(&doc(json!({}))).is_err());
        assert!(ShardKeyPattern::parse(&doc(json!({"x": true}))).is_err());
    }

    proptest! {
        // Membership is total and respects min-inclusive / max-exclusive.
        #[test]
        fn prop_in_range_total(v in -1000i64..1000, lo in -500i64..0, hi in 1i64..500) {
            let skey = pattern(json!({"x": 1}));
            let min = doc(json!({"x": lo}));
            let max = doc(json!({"x": hi}));
            let d = doc(json!({"x": v}));
            let inside = is_in_range(&d, &min, &max, &skey);
            prop_assert_eq!(inside, v >= lo && v < hi);
        }
    }
}
