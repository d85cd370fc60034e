//! Wire message types
//!
//! Every frame is a JSON envelope holding a `requests` and/or `responses`
//! array. Payload pieces the broker never interprets (list entries, invoke
//! rows, values) stay as `serde_json::Value` and pass through untouched.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Top-level frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<Request>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<Response>,
}

impl Envelope {
    /// Envelope carrying only requests
    pub fn requests(requests: Vec<Request>) -> Self {
        Self {
            requests,
            responses: Vec::new(),
        }
    }

    /// Envelope carrying only responses
    pub fn responses(responses: Vec<Response>) -> Self {
        Self {
            requests: Vec::new(),
            responses,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Request methods understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    List,
    Set,
    Remove,
    Invoke,
    Subscribe,
    Unsubscribe,
    Close,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::List => "list",
            Method::Set => "set",
            Method::Remove => "remove",
            Method::Invoke => "invoke",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Close => "close",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "list" => Ok(Method::List),
            "set" => Ok(Method::Set),
            "remove" => Ok(Method::Remove),
            "invoke" => Ok(Method::Invoke),
            "subscribe" => Ok(Method::Subscribe),
            "unsubscribe" => Ok(Method::Unsubscribe),
            "close" => Ok(Method::Close),
            other => Err(Error::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a subscribe request's `paths` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePath {
    pub path: String,
    pub sid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
}

/// A method call
///
/// `method` is kept as the raw string so an unknown method fails only the
/// request carrying it, not the whole envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub rid: u32,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<SubscribePath>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit: Option<String>,
}

impl Request {
    fn new(rid: u32, method: Method) -> Self {
        Self {
            rid,
            method: method.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn list(rid: u32, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(rid, Method::List)
        }
    }

    pub fn close(rid: u32) -> Self {
        Self::new(rid, Method::Close)
    }

    pub fn subscribe(rid: u32, path: impl Into<String>, sid: u32) -> Self {
        Self {
            paths: Some(vec![SubscribePath {
                path: path.into(),
                sid,
                qos: None,
            }]),
            ..Self::new(rid, Method::Subscribe)
        }
    }

    pub fn unsubscribe(rid: u32, sids: Vec<u32>) -> Self {
        Self {
            sids: Some(sids),
            ..Self::new(rid, Method::Unsubscribe)
        }
    }

    /// Copy of this request re-addressed for the upstream responder
    pub fn forward(&self, rid: u32, path: impl Into<String>) -> Self {
        Self {
            rid,
            path: Some(path.into()),
            ..self.clone()
        }
    }

    /// Parse the method name
    pub fn method(&self) -> Result<Method> {
        self.method.parse()
    }
}

/// Stream status carried on responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Initialize,
    Open,
    Closed,
}

/// Error attached to a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A (partial) result for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub rid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Open response carrying `updates`
    pub fn open(rid: u32, updates: Vec<Value>) -> Self {
        Self {
            rid,
            stream: Some(StreamStatus::Open),
            updates: Some(updates),
            ..Self::default()
        }
    }

    /// Bare closed response
    pub fn closed(rid: u32) -> Self {
        Self {
            rid,
            stream: Some(StreamStatus::Closed),
            ..Self::default()
        }
    }

    /// Value-channel response carrying `updates`
    pub fn values(updates: Vec<Value>) -> Self {
        Self {
            rid: super::constants::VALUE_UPDATE_RID,
            updates: Some(updates),
            ..Self::default()
        }
    }

    /// Copy of this response addressed to `rid`
    pub fn with_rid(&self, rid: u32) -> Self {
        Self {
            rid,
            ..self.clone()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream == Some(StreamStatus::Closed)
    }
}

/// One update on the value channel
///
/// Keeps the raw entry so fields the broker does not know about (`count`,
/// `sum`, ...) are forwarded as-is; only the sid is rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    sid: u32,
    raw: Value,
}

impl ValueUpdate {
    /// Parse `[sid, value, ts]` or `{"sid": .., "value": .., "ts": ..}`
    pub fn from_value(raw: &Value) -> Option<Self> {
        let sid = match raw {
            Value::Array(items) => items.first()?.as_u64()?,
            Value::Object(map) => map.get("sid")?.as_u64()?,
            _ => return None,
        };
        let sid = u32::try_from(sid).ok()?;
        Some(Self {
            sid,
            raw: raw.clone(),
        })
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.raw {
            Value::Array(items) => items.get(1),
            Value::Object(map) => map.get("value"),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match &self.raw {
            Value::Array(items) => items.get(2).and_then(Value::as_str),
            Value::Object(map) => map.get("ts").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Fresh copy of the entry with its sid replaced
    pub fn with_sid(&self, sid: u32) -> Value {
        let mut raw = self.raw.clone();
        match &mut raw {
            Value::Array(items) => items[0] = Value::from(sid),
            Value::Object(map) => {
                map.insert("sid".to_string(), Value::from(sid));
            }
            _ => {}
        }
        raw
    }
}

/// Current time in the protocol's timestamp format
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}
