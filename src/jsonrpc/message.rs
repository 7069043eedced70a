//! JSON-RPC 2.0 message model.
//!
//! A request without an `id` member is a notification. An `id` of `null` is
//! kept as `Some(Value::Null)` so it still gets a reply.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use super::error::{ErrorObject, RpcError};

/// Protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Deserialize a member that is present, even when it is `null`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Method parameters: positional or named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    /// `params` was an array.
    Positional(Vec<Value>),
    /// `params` was an object.
    Named(Map<String, Value>),
}

impl Default for Params {
    fn default() -> Self { Self::Positional(Vec::new()) }
}

impl Params {
    /// Argument at `position`, or named `name`, depending on the shape.
    ///
    /// ```
    /// use hostwire::jsonrpc::Params;
    /// use serde_json::json;
    ///
    /// let positional: Params = serde_json::from_value(json!(["hi"])).unwrap();
    /// let named: Params = serde_json::from_value(json!({"text": "hi"})).unwrap();
    /// assert_eq!(positional.arg(0, "text"), Some(&json!("hi")));
    /// assert_eq!(named.arg(0, "text"), Some(&json!("hi")));
    /// ```
    #[must_use]
    pub fn arg(&self, position: usize, name: &str) -> Option<&Value> {
        match self {
            Self::Positional(values) => values.get(position),
            Self::Named(map) => map.get(name),
        }
    }

    /// Deserialize the whole parameter set into `T`.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidParams`] when the shape does not match.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let value = match self {
            Self::Positional(values) => Value::Array(values),
            Self::Named(map) => Value::Object(map),
        };
        serde_json::from_value(value).map_err(|err| RpcError::InvalidParams(err.to_string()))
    }

    /// Whether no arguments were supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(values) => values.is_empty(),
            Self::Named(map) => map.is_empty(),
        }
    }
}

/// A request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version (must be "2.0").
    pub jsonrpc: String,
    /// Method name, `Class.method`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Request identifier; `None` for notifications.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    /// Request expecting a response with identifier `id`.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Params>, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Request that must never be answered.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Whether this is a notification.
    #[must_use]
    pub fn is_notification(&self) -> bool { self.id.is_none() }

    /// Validate a decoded JSON value as a request.
    ///
    /// On failure the error is paired with the request's id when one could
    /// be read, so the error response can still be correlated.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidRequest`] for anything that is not a JSON-RPC 2.0
    /// request object.
    pub fn from_value(value: Value) -> Result<Self, (Value, RpcError)> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if !value.is_object() {
            return Err((id, RpcError::InvalidRequest("request must be an object".into())));
        }
        let request: Self = serde_json::from_value(value)
            .map_err(|err| (id.clone(), RpcError::InvalidRequest(err.to_string())))?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err((
                id,
                RpcError::InvalidRequest(format!(
                    "unsupported version {:?}, expected {JSONRPC_VERSION}",
                    request.jsonrpc
                )),
            ));
        }
        Ok(request)
    }
}

/// A response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version (must be "2.0").
    pub jsonrpc: String,
    /// Result value on success; may be `null`.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Identifier of the request answered; `null` when it was unreadable.
    pub id: Value,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Error response.
    #[must_use]
    pub fn error(id: Value, error: &RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error.to_object()),
            id,
        }
    }

    /// Response carrying `outcome`.
    #[must_use]
    pub fn from_outcome(id: Value, outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(err) => Self::error(id, &err),
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// # Errors
    ///
    /// The server's error, as [`RpcError::Application`].
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.into()),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Classified contents of an inbound client-side payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Replies to earlier calls.
    Responses(Vec<Response>),
    /// Server-initiated events (notifications).
    Events(Vec<Request>),
}

fn is_response(object: &Value) -> bool { object.get("result").is_some() || object.get("error").is_some() }

/// Parse a payload received by a client.
///
/// Each object is a response when it has a `result` or `error` member,
/// otherwise an event. A batch mixing both is rejected whole.
///
/// # Errors
///
/// [`RpcError::ParseError`] for malformed JSON, [`RpcError::InvalidRequest`]
/// for mixed batches or objects of neither shape.
pub fn classify(payload: &[u8]) -> Result<Inbound, RpcError> {
    let value: Value = serde_json::from_slice(payload)?;
    let objects = match value {
        Value::Array(objects) => objects,
        object => vec![object],
    };
    let Some(first) = objects.first() else {
        return Err(RpcError::InvalidRequest("empty batch".into()));
    };
    let responses = is_response(first);
    if objects.iter().any(|object| is_response(object) != responses) {
        return Err(RpcError::InvalidRequest(
            "batch mixes responses and events".into(),
        ));
    }
    let invalid = |err: serde_json::Error| RpcError::InvalidRequest(err.to_string());
    if responses {
        objects
            .into_iter()
            .map(|object| serde_json::from_value(object).map_err(invalid))
            .collect::<Result<_, _>>()
            .map(Inbound::Responses)
    } else {
        objects
            .into_iter()
            .map(|object| serde_json::from_value(object).map_err(invalid))
            .collect::<Result<_, _>>()
            .map(Inbound::Events)
    }
}

/// Encode requests: a single object for one request, an array otherwise.
///
/// # Errors
///
/// Serialization failures, which only occur for non-string map keys.
pub fn encode_requests(requests: &[Request]) -> Result<Bytes, RpcError> {
    let encoded = match requests {
        [single] => serde_json::to_vec(single)?,
        many => serde_json::to_vec(many)?,
    };
    Ok(Bytes::from(encoded))
}

/// Encode responses with the same single-or-array rule as
/// [`encode_requests`].
///
/// # Errors
///
/// Serialization failures.
pub fn encode_responses(responses: &[Response], batch: bool) -> Result<Bytes, RpcError> {
    let encoded = match responses {
        [single] if !batch => serde_json::to_vec(single)?,
        many => serde_json::to_vec(many)?,
    };
    Ok(Bytes::from(encoded))
}
