//! Request/response envelope for client-daemon communication.
//!
//! JSON over a local stream socket with newline framing: each message is one
//! JSON object on one line, and a connection carries a single exchange.
//!
//! Request:  {"command": "get", "params": {"key": "work/api-key"}}
//! Response: {"ok": true, "data": {"value": "xxx"}}
//! Error:    {"ok": false, "data": {}, "error": "Locked", "message": "stash is locked"}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StashError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Response {
    pub fn success() -> Self {
        Self {
            ok: true,
            data: empty_object(),
            error: None,
            message: None,
        }
    }

    pub fn success_with(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            message: None,
        }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: empty_object(),
            error: Some(code.into()),
            message: Some(message.into()),
        }
    }

    pub fn from_error(err: &StashError) -> Self {
        Self::fail(err.code(), err.to_string())
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, StashError> {
    encode(req)
}

pub fn decode_request(line: &str) -> Result<Request, StashError> {
    serde_json::from_str(line).map_err(|err| StashError::BadRequest(format!("invalid request: {err}")))
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, StashError> {
    encode(resp)
}

pub fn decode_response(line: &str) -> Result<Response, StashError> {
    serde_json::from_str(line)
        .map_err(|err| StashError::Internal(format!("invalid response from daemon: {err}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StashError> {
    let mut buf =
        serde_json::to_vec(value).map_err(|err| StashError::Internal(err.to_string()))?;
    buf.push(b'\n');
    Ok(buf)
}
