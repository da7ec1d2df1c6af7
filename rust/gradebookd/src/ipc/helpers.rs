use crate::error::StoreError;
use crate::ipc::error::err;
use crate::store::{Collection, Row};
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn no_workspace() -> Self {
        Self {
            code: "no_workspace",
            message: "select a workspace first".to_string(),
            details: None,
        }
    }

    /// `write` picks the code for driver-level failures.
    pub fn from_store(e: StoreError, write: bool) -> Self {
        let code = match &e {
            StoreError::InvalidField(_) | StoreError::MissingKey(_) | StoreError::NotAnObject => {
                "bad_params"
            }
            StoreError::NoMatch { .. } => "not_found",
            StoreError::DuplicateKey { .. } => "duplicate_key",
            StoreError::Sqlite(_) | StoreError::Json(_) if write => "db_update_failed",
            StoreError::Sqlite(_) | StoreError::Json(_) => "db_query_failed",
        };
        Self {
            code,
            message: e.to_string(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_optional_u64_range(
    params: &Value,
    key: &str,
    min: u64,
    max: u64,
) -> Result<Option<u64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_u64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key)))?;
            if !(min..=max).contains(&n) {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be in {}..={}",
                    key, min, max
                )));
            }
            Ok(Some(n))
        }
    }
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

pub fn get_required_index(params: &Value, key: &str) -> Result<usize, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key)))
}

pub fn get_collection(params: &Value) -> Result<Collection, HandlerErr> {
    let raw = get_required_str(params, "collection")?;
    Collection::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("unknown collection: {}", raw),
        details: Some(json!({
            "allowed": Collection::ALL.iter().map(|c| c.table()).collect::<Vec<_>>()
        })),
    })
}

pub fn as_row(v: &Value, key: &str) -> Result<Row, HandlerErr> {
    v.as_object()
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an object", key)))
}
