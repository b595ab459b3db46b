use crate::auth::identity::{AgentIdentity, Permission};
use crate::error::ShoalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One named operation of the public contract: a declared JSON parameter
/// schema, a permission requirement, and a handler that receives the
/// authenticated caller plus validated-enough arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Whether dispatch must resolve a token before calling. Tools that
    /// take the credential as an argument (authenticate, refresh, revoke)
    /// opt out.
    fn requires_token(&self) -> bool {
        true
    }

    /// Permission bit checked against the caller, when one is required.
    fn required_permission(&self) -> Option<Permission> {
        Some(Permission::Read)
    }

    /// Permission decision; the default checks [`Self::required_permission`].
    fn authorize(&self, caller: &AgentIdentity) -> bool {
        match self.required_permission() {
            None => true,
            Some(permission) => caller.has(permission),
        }
    }

    /// Run the tool. `caller` is `Some` whenever [`Self::requires_token`]
    /// is true. The returned object is merged into the success envelope.
    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Merge a tool's payload into `{success: true, ...}`.
pub fn ok_envelope(payload: Value) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    match payload {
        Value::Object(fields) => {
            for (key, value) in fields {
                body.insert(key, value);
            }
        }
        Value::Null => {}
        other => {
            body.insert("result".to_string(), other);
        }
    }
    Value::Object(body)
}

// ── Argument extraction ──────────────────────────────────────────────────────
//
// Tools validate their own inputs with these helpers; schema declarations
// in `parameters()` are for discovery, not enforcement.

pub(crate) fn caller_or_err(caller: Option<&AgentIdentity>) -> Result<&AgentIdentity, ShoalError> {
    caller.ok_or(ShoalError::AuthRequired)
}

pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ShoalError> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ShoalError::Validation(format!("'{key}' must be a string"))),
        None => Err(ShoalError::Validation(format!("'{key}' is required"))),
    }
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ShoalError::Validation(format!("'{key}' must be a string"))),
    }
}

/// Integer argument, accepting a number or a numeric string.
pub(crate) fn opt_i64(args: &Value, key: &str) -> Result<Option<i64>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ShoalError::Validation(format!("'{key}' must be an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ShoalError::Validation(format!("'{key}' must be an integer"))),
        Some(_) => Err(ShoalError::Validation(format!("'{key}' must be an integer"))),
    }
}

pub(crate) fn opt_f64(args: &Value, key: &str) -> Result<Option<f64>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| ShoalError::Validation(format!("'{key}' must be a number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ShoalError::Validation(format!("'{key}' must be a number"))),
        Some(_) => Err(ShoalError::Validation(format!("'{key}' must be a number"))),
    }
}

pub(crate) fn opt_bool(args: &Value, key: &str) -> Result<Option<bool>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ShoalError::Validation(format!("'{key}' must be a boolean"))),
        },
        Some(_) => Err(ShoalError::Validation(format!("'{key}' must be a boolean"))),
    }
}

pub(crate) fn opt_object(args: &Value, key: &str) -> Result<Option<Value>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Object(_)) => Ok(Some(v.clone())),
        Some(_) => Err(ShoalError::Validation(format!(
            "'{key}' must be a JSON object"
        ))),
    }
}

pub(crate) fn require_value(args: &Value, key: &str) -> Result<Value, ShoalError> {
    args.get(key)
        .cloned()
        .ok_or_else(|| ShoalError::Validation(format!("'{key}' is required")))
}

pub(crate) fn str_array(args: &Value, key: &str) -> Result<Vec<String>, ShoalError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(ShoalError::Validation(format!(
                    "'{key}' must be an array of strings"
                ))),
            })
            .collect(),
        Some(_) => Err(ShoalError::Validation(format!(
            "'{key}' must be an array of strings"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_envelope_merges_objects() {
        let env = ok_envelope(json!({"session_id": "s", "n": 2}));
        assert_eq!(env["success"], true);
        assert_eq!(env["session_id"], "s");
        assert_eq!(env["n"], 2);
    }

    #[test]
    fn ok_envelope_wraps_scalars() {
        let env = ok_envelope(json!(42));
        assert_eq!(env["success"], true);
        assert_eq!(env["result"], 42);
    }

    #[test]
    fn integers_coerce_from_strings() {
        let args = json!({"expires_in": "300", "n": 7, "bad": "soon"});
        assert_eq!(opt_i64(&args, "expires_in").unwrap(), Some(300));
        assert_eq!(opt_i64(&args, "n").unwrap(), Some(7));
        assert_eq!(opt_i64(&args, "absent").unwrap(), None);
        assert!(opt_i64(&args, "bad").is_err());
    }

    #[test]
    fn booleans_coerce_from_strings() {
        let args = json!({"a": true, "b": "false", "c": "1", "d": "maybe"});
        assert_eq!(opt_bool(&args, "a").unwrap(), Some(true));
        assert_eq!(opt_bool(&args, "b").unwrap(), Some(false));
        assert_eq!(opt_bool(&args, "c").unwrap(), Some(true));
        assert!(opt_bool(&args, "d").is_err());
    }

    #[test]
    fn required_string_errors_name_the_field() {
        let args = json!({"present": "x", "wrong": 1});
        assert_eq!(require_str(&args, "present").unwrap(), "x");
        let err = require_str(&args, "missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(require_str(&args, "wrong").is_err());
    }

    #[test]
    fn object_args_must_be_objects() {
        let args = json!({"meta": {"k": 1}, "list": [1]});
        assert!(opt_object(&args, "meta").unwrap().is_some());
        assert!(opt_object(&args, "absent").unwrap().is_none());
        assert!(opt_object(&args, "list").is_err());
    }

    #[test]
    fn string_arrays_reject_mixed_content() {
        let args = json!({"perms": ["read", "write"], "mixed": ["read", 1]});
        assert_eq!(str_array(&args, "perms").unwrap(), vec!["read", "write"]);
        assert!(str_array(&args, "mixed").is_err());
        assert!(str_array(&args, "absent").unwrap().is_empty());
    }
}
