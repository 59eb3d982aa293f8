//! Stratum v1 message definitions
//!
//! Newline-delimited JSON-RPC: requests carry `{id, method, params}`,
//! responses `{id, result, error}` with `error = [code, message, null]`,
//! and server pushes use `id: null`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes understood by Stratum v1 miners
pub mod codes {
    pub const OTHER: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;
}

/// Stratum protocol methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    /// Client subscribes to mining notifications
    Subscribe,
    /// Client authorizes with credentials
    Authorize,
    /// Client submits a share
    Submit,
    /// Client asks for extranonce change notifications
    ExtranonceSubscribe,
    /// Client proposes a starting difficulty
    SuggestDifficulty,
    /// Server notifies client of new work
    Notify,
    /// Server sets share difficulty
    SetDifficulty,
    /// Server sets share target
    SetTarget,
    /// Unknown method
    Unknown(String),
}

impl StratumMethod {
    /// Parse method from string
    pub fn parse_method(s: &str) -> Self {
        match s {
            "mining.subscribe" => Self::Subscribe,
            "mining.authorize" => Self::Authorize,
            "mining.submit" => Self::Submit,
            "mining.extranonce.subscribe" => Self::ExtranonceSubscribe,
            "mining.suggest_difficulty" => Self::SuggestDifficulty,
            "mining.notify" => Self::Notify,
            "mining.set_difficulty" => Self::SetDifficulty,
            "mining.set_target" => Self::SetTarget,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "mining.subscribe",
            Self::Authorize => "mining.authorize",
            Self::Submit => "mining.submit",
            Self::ExtranonceSubscribe => "mining.extranonce.subscribe",
            Self::SuggestDifficulty => "mining.suggest_difficulty",
            Self::Notify => "mining.notify",
            Self::SetDifficulty => "mining.set_difficulty",
            Self::SetTarget => "mining.set_target",
            Self::Unknown(s) => s,
        }
    }
}

/// Stratum request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Request ID
    #[serde(default)]
    pub id: Value,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl StratumRequest {
    /// Create a new request
    pub fn new(id: impl Into<Value>, method: &str, params: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// Parse one line received from a miner
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        if !value.is_object() {
            return Err(Error::protocol("request is not a JSON object"));
        }
        if value.get("method").and_then(Value::as_str).is_none() {
            return Err(Error::protocol("request has no method"));
        }
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Get the method as enum
    pub fn method_enum(&self) -> StratumMethod {
        StratumMethod::parse_method(&self.method)
    }

    /// String parameter at `index`
    pub fn str_param(&self, index: usize) -> Result<&str> {
        self.params
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol(format!("missing string parameter {}", index)))
    }
}

/// Stratum response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumResponse {
    /// Request ID this responds to
    pub id: Value,
    /// Result if successful
    pub result: Option<Value>,
    /// Error if failed
    pub error: Option<Value>,
}

impl StratumResponse {
    /// Create a successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(Value::Array(vec![
                Value::Number(code.into()),
                Value::String(message.to_string()),
                Value::Null,
            ])),
        }
    }

    /// Error code, if this is an error response
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref()?.get(0)?.as_i64()
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Stratum notification (no ID)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumNotification {
    /// Always null for notifications
    pub id: Value,
    /// Method name
    pub method: String,
    /// Method parameters
    pub params: Value,
}

impl StratumNotification {
    /// Create a new notification
    pub fn new(method: StratumMethod, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.as_str().to_string(),
            params,
        }
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
