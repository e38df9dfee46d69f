//! Document model
//!
//! Documents are ordered JSON objects. Cross-type comparison follows a
//! fixed type bracket (null < numbers < strings < objects < arrays <
//! booleans) so that shard-key ranges have a total order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// A single document: an ordered map of field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Document(Map::new())
    }

    /// Build a document from a JSON value; `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Document(map)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Field lookup supporting dotted paths (`a.b.c`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// The `_id` field, if present.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("_id")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Approximate serialized size in bytes, used for transfer budgets
    /// and capture-memory accounting.
    pub fn approx_size(&self) -> usize {
        serde_json::to_string(&self.0).map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Wrap an id value as `{ "_id": id }`.
pub fn id_doc(id: &Value) -> Document {
    let mut map = Map::new();
    map.insert("_id".to_string(), id.clone());
    Document(map)
}

/// Canonical string form of an id value, usable as a hash-index key.
pub fn canonical_id(id: &Value) -> String {
    id.to_string()
}

/// Approximate serialized size of a bare value.
pub fn value_size(value: &Value) -> usize {
    value.to_string().len()
}

/// Infer an index key pattern from a query document, e.g.
/// `{_id: ObjectId(...)}` yields `{_id: 1}`.
pub fn infer_key_pattern(query: &Document) -> Document {
    let mut map = Map::new();
    for key in query.0.keys() {
        map.insert(key.clone(), Value::from(1));
    }
    Document(map)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Total order over values. Different types compare by bracket,
/// matching types compare element-wise.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let ord = cmp_values(ea, eb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn test_id_and_get() {
        let d = doc(json!({"_id": 7, "x": {"y": "deep"}}));
        assert_eq!(d.id(), Some(&json!(7)));
        assert_eq!(d.get("x.y"), Some(&json!("deep")));
        assert_eq!(d.get("x.z"), None);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(cmp_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(cmp_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(cmp_values(&json!("a"), &json!("b")), Ordering::Less);
        // numbers sort before strings regardless of content
        assert_eq!(cmp_values(&json!(999), &json!("0")), Ordering::Less);
        assert_eq!(cmp_values(&json!(null), &json!(0)), Ordering::Less);
    }

    #[test]
    fn test_array_and_object_ordering() {
        assert_eq!(
            cmp_values(&json!([1, 2]), &json!([1, 2, 3])),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&json!({"a": 1}), &json!({"a": 2})),
            Ordering::Less
        );
    }

    #[test]
    fn test_infer_key_pattern() {
        let pattern = infer_key_pattern(&id_doc(&json!("abc")));
        assert_eq!(pattern.to_value(), json!({"_id": 1}));
    }

    #[test]
    fn test_approx_size() {
        let small = doc(json!({"_id": 1}));
        let big = doc(json!({"_id": 1, "payload": "x".repeat(100)}));
        assert!(big.approx_size() > small.approx_size());
    }
}
