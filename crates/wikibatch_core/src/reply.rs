use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};

/// Parsed body of one API round-trip.
///
/// Data is located with JSON-pointer paths (`/query/pages`). Each query
/// template names the exact path of its items, so lookups never depend on
/// where a key happens to appear first in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    body: Value,
}

impl Reply {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }

    pub fn has_error(&self) -> bool {
        self.body.get("error").is_some()
    }

    pub fn error_code(&self) -> Option<&str> {
        self.body
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(Value::as_str)
    }

    pub fn error_info(&self) -> Option<&str> {
        self.body
            .get("error")
            .and_then(|error| error.get("info"))
            .and_then(Value::as_str)
    }

    /// Convert an embedded `error` object into a classified [`ApiError`].
    pub fn into_result(self) -> ApiResult<Self> {
        if self.has_error() {
            let code = self.error_code().unwrap_or("unknown_error");
            let info = self.error_info().unwrap_or("unknown info");
            return Err(ApiError::from_code(code, info));
        }
        Ok(self)
    }

    pub fn at(&self, path: &str) -> Option<&Value> {
        self.body.pointer(path)
    }

    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.at(path).and_then(Value::as_str)
    }

    pub fn i64_at(&self, path: &str) -> Option<i64> {
        self.at(path).and_then(Value::as_i64)
    }

    pub fn array_at(&self, path: &str) -> Option<&Vec<Value>> {
        self.at(path).and_then(Value::as_array)
    }

    /// Items stored at `path`: array elements, or object values for the
    /// id-keyed layout of older reply formats. Anything else yields nothing.
    pub fn items_at(&self, path: &str) -> Vec<&Value> {
        match self.at(path) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        }
    }

    pub fn decode_at<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let value = self
            .at(path)
            .cloned()
            .ok_or_else(|| ApiError::Decode(format!("missing `{path}` in reply")))?;
        serde_json::from_value(value).map_err(|error| ApiError::Decode(error.to_string()))
    }

    /// Key/value pairs of the `continue` object, to be merged verbatim into
    /// the next request. `None` signals the sequence is exhausted, which
    /// includes a `continue` object with no keys.
    pub fn continuation(&self) -> Option<Vec<(String, String)>> {
        let object = self
            .body
            .get("continue")?
            .as_object()
            .filter(|object| !object.is_empty())?;
        Some(
            object
                .iter()
                .map(|(key, value)| (key.clone(), value_to_param(value)))
                .collect(),
        )
    }
}

fn value_to_param(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
