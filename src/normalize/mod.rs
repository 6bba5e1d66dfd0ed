//! Result normalization.
//!
//! Every producer reports its outcome in its own shape. [`Normalizer`]
//! reduces any of them to one [`Envelope`], dispatching on the producer id
//! through a table of pure reducers. Unknown producers go through
//! [`generic`]. No input shape makes normalization fail.

mod producers;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest code a free-text result can turn into.
const MAX_CODE_LEN: usize = 64;

/// The canonical result shape returned for every finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    /// Stable upper-snake token, e.g. `UPLOAD_OK`.
    pub code: String,
    pub message: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub warnings: Vec<Value>,
    pub errors: Vec<Value>,
}

impl Envelope {
    pub fn new(ok: bool, code: impl Into<String>) -> Self {
        Self {
            ok,
            code: code.into(),
            message: None,
            data: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    /// Empty maps are stored as `None`.
    pub fn data(mut self, data: Option<Map<String, Value>>) -> Self {
        self.data = data.filter(|d| !d.is_empty());
        self
    }

    pub fn warnings(mut self, warnings: Vec<Value>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn errors(mut self, errors: Vec<Value>) -> Self {
        self.errors = errors;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Everything a reducer gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ReduceInput<'a> {
    /// The producer's own success flag.
    pub succeeded: bool,
    pub raw: &'a Value,
    /// Error information from the failing job, if any.
    pub error_context: Option<&'a Value>,
}

impl<'a> ReduceInput<'a> {
    pub fn field(&self, key: &str) -> Option<&'a Value> {
        self.raw.get(key).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, key: &str) -> Option<&'a str> {
        self.field(key)?.as_str()
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.field(key)?.as_bool()
    }

    /// Errors from the error context, as a list.
    pub fn context_errors(&self) -> Vec<Value> {
        self.error_context.map(coerce_list).unwrap_or_default()
    }

    /// Best message from the error context.
    pub fn context_message(&self) -> Option<String> {
        match self.error_context? {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("message")?.as_str().map(str::to_string),
            _ => None,
        }
    }

    /// The raw payload minus the given keys, if it is an object.
    pub fn rest(&self, exclude: &[&str]) -> Option<Map<String, Value>> {
        let map = self.raw.as_object()?;
        Some(
            map.iter()
                .filter(|(k, _)| !exclude.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// A pure mapping from one producer's raw shape to the envelope.
pub type Reducer = fn(&ReduceInput<'_>) -> Envelope;

/// Producer id → reducer table with a generic default.
#[derive(Debug, Clone)]
pub struct Normalizer {
    reducers: HashMap<String, Reducer>,
}

impl Default for Normalizer {
    fn default() -> Self {
        let mut normalizer = Self::empty();
        producers::register_builtin(&mut normalizer);
        normalizer
    }
}

impl Normalizer {
    /// A table with no producers; everything goes through [`generic`].
    pub fn empty() -> Self {
        Self {
            reducers: HashMap::new(),
        }
    }

    /// Register (or replace) the reducer for a producer id.
    pub fn register(&mut self, producer_id: &str, reducer: Reducer) -> &mut Self {
        self.reducers
            .insert(producer_id.trim().to_ascii_lowercase(), reducer);
        self
    }

    pub fn is_known(&self, producer_id: &str) -> bool {
        self.reducers
            .contains_key(&producer_id.trim().to_ascii_lowercase())
    }

    pub fn normalize(
        &self,
        producer_id: &str,
        succeeded: bool,
        raw: &Value,
        error_context: Option<&Value>,
    ) -> Envelope {
        let input = ReduceInput {
            succeeded,
            raw,
            error_context: error_context.filter(|v| !v.is_null()),
        };
        let reducer = self
            .reducers
            .get(&producer_id.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(generic);
        reducer(&input)
    }
}

/// Fallback for producers without a registered reducer.
///
/// Trusts an explicit boolean `ok`, then a free-text `result`, and
/// otherwise wraps the payload as opaque data under the caller's flag.
pub fn generic(input: &ReduceInput<'_>) -> Envelope {
    if let Some(ok) = input.bool_field("ok") {
        let code = input
            .str_field("code")
            .map(upper_snake)
            .unwrap_or_else(|| default_code(ok).to_string());
        let mut data = input.rest(&["ok", "code", "message", "warnings", "errors", "data"]);
        match (data.as_mut(), input.field("data")) {
            (Some(rest), Some(Value::Object(nested))) => {
                rest.extend(nested.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            (Some(rest), Some(other)) => {
                rest.insert("data".to_string(), other.clone());
            }
            _ => {}
        }
        let mut errors = coerce_list_opt(input.field("errors"));
        if !ok {
            errors.extend(input.context_errors());
        }
        return Envelope::new(ok, code)
            .message(
                input
                    .str_field("message")
                    .map(str::to_string)
                    .or_else(|| if ok { None } else { input.context_message() }),
            )
            .data(data)
            .warnings(coerce_list_opt(input.field("warnings")))
            .errors(errors);
    }

    if let Some(result) = input.str_field("result") {
        let code = upper_snake(result);
        let ok = looks_successful(&code);
        let mut errors = coerce_list_opt(input.field("errors"));
        if !ok {
            errors.extend(input.context_errors());
        }
        return Envelope::new(ok, code)
            .message(Some(result.to_string()))
            .data(input.rest(&["result", "warnings", "errors"]))
            .warnings(coerce_list_opt(input.field("warnings")))
            .errors(errors);
    }

    let data = match input.raw {
        Value::Null => None,
        Value::Object(map) => Some(map.clone()),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            Some(map)
        }
    };
    let errors = if input.succeeded {
        Vec::new()
    } else {
        input.context_errors()
    };
    Envelope::new(input.succeeded, default_code(input.succeeded))
        .message(if input.succeeded {
            None
        } else {
            input.context_message()
        })
        .data(data)
        .errors(errors)
}

fn default_code(ok: bool) -> &'static str {
    if ok { "OK" } else { "ERROR" }
}

/// `"Failed: timeout"` → `"FAILED_TIMEOUT"`. Empty input becomes `UNKNOWN`.
pub fn upper_snake(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MAX_CODE_LEN));
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_uppercase());
        } else {
            pending_sep = true;
        }
        if out.len() >= MAX_CODE_LEN {
            break;
        }
    }
    out.truncate(MAX_CODE_LEN);
    if out.is_empty() {
        "UNKNOWN".to_string()
    } else {
        out
    }
}

/// Success guess from an upper-snake code, token by token so that
/// `BROKEN` is not mistaken for `OK`.
pub fn looks_successful(code: &str) -> bool {
    code.split('_')
        .any(|token| token == "OK" || token.starts_with("SUCCEED") || token.starts_with("SUCCESS"))
}

/// Absent → `[]`, array → itself, anything else → `[it]`.
pub fn coerce_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Value::String(s) if s.trim().is_empty() => Vec::new(),
        other => vec![other.clone()],
    }
}

pub fn coerce_list_opt(value: Option<&Value>) -> Vec<Value> {
    value.map(coerce_list).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_snake_collapses_punctuation() {
        assert_eq!(upper_snake("Failed: timeout"), "FAILED_TIMEOUT");
        assert_eq!(upper_snake("  already--done!! "), "ALREADY_DONE");
        assert_eq!(upper_snake("???"), "UNKNOWN");
    }

    #[test]
    fn upper_snake_caps_length() {
        let long = "word ".repeat(40);
        assert!(upper_snake(&long).len() <= MAX_CODE_LEN);
    }

    #[test]
    fn success_guess_is_token_based() {
        assert!(looks_successful("SUCCEEDED"));
        assert!(looks_successful("UPLOAD_SUCCESSFUL"));
        assert!(looks_successful("ALL_OK"));
        assert!(!looks_successful("BROKEN_PIPE"));
        assert!(!looks_successful("FAILED_TIMEOUT"));
    }

    #[test]
    fn coerce_list_handles_every_shape() {
        assert!(coerce_list(&Value::Null).is_empty());
        assert_eq!(coerce_list(&serde_json::json!("boom")).len(), 1);
        assert_eq!(coerce_list(&serde_json::json!(["a", null, "b"])).len(), 2);
        assert_eq!(coerce_list(&serde_json::json!({"m": 1})).len(), 1);
    }
}
