// ABOUTME: Typed key/value metadata map shared by tasks, workflows and contexts
// ABOUTME: Wraps JSON values with typed getters and dotted-path lookup

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Ordered map of metadata values.
///
/// Values are the JSON union (null, bool, number, string, list, map). Callers
/// read them through the typed getters instead of matching on `Value` directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_list(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    /// Resolve a dotted path such as `build.artifacts.0.name`
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let root = self.0.get(first)?;
        lookup_value(root, segments)
    }

    /// Merge every entry of `other` into this map, overwriting existing keys
    pub fn extend(&mut self, other: Metadata) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Build metadata from a JSON object; other values yield `None`
    pub fn from_value(value: &Value) -> Option<Self> {
        value
            .as_object()
            .map(|map| Self(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
    }
}

/// Walk a dotted path into a JSON value, indexing arrays by position
pub fn lookup_value<'a, 'p>(
    root: &'a Value,
    segments: impl IntoIterator<Item = &'p str>,
) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Metadata {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters() {
        let mut metadata = Metadata::new();
        metadata.insert("name", "build");
        metadata.insert("attempts", 3);
        metadata.insert("ratio", 0.5);
        metadata.insert("enabled", true);
        metadata.insert("tags", json!(["a", "b"]));

        assert_eq!(metadata.get_str("name"), Some("build"));
        assert_eq!(metadata.get_i64("attempts"), Some(3));
        assert_eq!(metadata.get_f64("ratio"), Some(0.5));
        assert_eq!(metadata.get_bool("enabled"), Some(true));
        assert_eq!(metadata.get_list("tags").map(Vec::len), Some(2));
        assert_eq!(metadata.get_str("attempts"), None);
    }

    #[test]
    fn test_dotted_lookup() {
        let mut metadata = Metadata::new();
        metadata.insert("build", json!({"artifacts": [{"name": "app.tar"}]}));

        assert_eq!(
            metadata.lookup("build.artifacts.0.name"),
            Some(&json!("app.tar"))
        );
        assert_eq!(metadata.lookup("build.missing"), None);
        assert_eq!(metadata.lookup("build.artifacts.x"), None);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut metadata = Metadata::new();
        metadata.insert("env", "prod");
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value, json!({"env": "prod"}));
        assert_eq!(Metadata::from_value(&value), Some(metadata));
    }
}
