//! Result store abstraction.
//!
//! Each pipeline stage writes named fields and marks them dirty so the
//! persistence collaborator knows which fields to flush. Fields are
//! overwritten, never deleted, by this crate.

use std::collections::BTreeSet;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors converting between typed stage output and stored JSON values.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A value could not be serialized into the store.
    #[error("failed to serialize result field '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored field did not have the expected shape.
    #[error("result field '{key}' has an unexpected shape: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Mutable keyed result document shared by the stages of one scan.
pub trait ResultStore: Send {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&mut self, key: &str, value: Value);

    /// Flags `key` as changed for the persistence collaborator.
    fn mark_dirty(&mut self, key: &str);

    /// Returns true when `key` is present and not JSON `null`/`false`/empty.
    fn has_truthy(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }
}

/// Serializes `value` into `store[key]`.
///
/// # Errors
///
/// Returns [`StoreError::Serialize`] when `value` cannot be represented as JSON.
pub fn set_typed<T: Serialize + ?Sized>(
    store: &mut dyn ResultStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_value(value).map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
    })?;
    store.set(key, json);
    Ok(())
}

/// Deserializes `store[key]`; `Ok(None)` when the field is absent or null.
///
/// # Errors
///
/// Returns [`StoreError::Deserialize`] when the field has another shape.
pub fn get_typed<T: DeserializeOwned>(
    store: &dyn ResultStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| StoreError::Deserialize {
                key: key.to_string(),
                source,
            }),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

/// In-memory [`ResultStore`] backed by a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    fields: Map<String, Value>,
    dirty: BTreeSet<String>,
}

impl ScanResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a result pre-populated with `site_url`.
    #[must_use]
    pub fn for_site(site_url: &str) -> Self {
        let mut result = Self::new();
        result.set("site_url", Value::String(site_url.to_string()));
        result
    }

    /// Keys marked dirty since creation or the last [`Self::take_dirty`].
    #[must_use]
    pub fn dirty_keys(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Drains the dirty set, as a persistence collaborator would after a flush.
    pub fn take_dirty(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.dirty)
    }

    /// Returns the whole document.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl ResultStore for ScanResult {
    fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    fn mark_dirty(&mut self, key: &str) {
        self.dirty.insert(key.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_result_set_get_and_dirty() {
        let mut result = ScanResult::for_site("https://example.com/");
        assert_eq!(
            result.get("site_url"),
            Some(&Value::String("https://example.com/".to_string()))
        );
        assert!(result.dirty_keys().is_empty());

        result.set("tracking", Value::Null);
        result.mark_dirty("tracking");
        assert!(result.dirty_keys().contains("tracking"));

        let drained = result.take_dirty();
        assert_eq!(drained.len(), 1);
        assert!(result.dirty_keys().is_empty());
    }

    #[test]
    fn test_has_truthy_follows_json_truthiness() {
        let mut result = ScanResult::new();
        result.set("null", Value::Null);
        result.set("empty", serde_json::json!({}));
        result.set("full", serde_json::json!({"owners": {}}));
        assert!(!result.has_truthy("missing"));
        assert!(!result.has_truthy("null"));
        assert!(!result.has_truthy("empty"));
        assert!(result.has_truthy("full"));
    }

    #[test]
    fn test_typed_round_trip_and_shape_error() {
        let mut result = ScanResult::new();
        set_typed(&mut result, "fqdns", &vec!["a.com", "b.com"]).unwrap();
        let fqdns: Option<Vec<String>> = get_typed(&result, "fqdns").unwrap();
        assert_eq!(fqdns.unwrap(), ["a.com", "b.com"]);

        let err = get_typed::<u32>(&result, "fqdns").unwrap_err();
        assert!(err.to_string().contains("fqdns"));

        let absent: Option<u32> = get_typed(&result, "nope").unwrap();
        assert!(absent.is_none());
    }
}
