//! Classification of decoded payloads into requests, notifications and responses.
//!
//! A request also fits the notification shape (ignoring `id`) and the response
//! shape (ignoring `method`), so the order in which the shapes are tried is
//! significant: request first, notification second, response last.

use serde_json::{Map, Value};

use crate::jsonrpc::error::ConnectionError;
use crate::jsonrpc::types::{Message, Notification, Request, RequestId, Response, ResponseError};

type Object = Map<String, Value>;

pub fn parse_request(json: &Object) -> Result<Option<Request>, ConnectionError> {
    if json.contains_key("method") && json.contains_key("id") {
        let request: Request = serde_json::from_value(Value::Object(json.clone()))
            .map_err(|e| ConnectionError::InvalidMessage(format!("malformed request: {e}")))?;
        return Ok(Some(request));
    }
    Ok(None)
}

pub fn parse_notification(json: &Object) -> Result<Option<Notification>, ConnectionError> {
    if json.contains_key("method") {
        let notification: Notification = serde_json::from_value(Value::Object(json.clone()))
            .map_err(|e| {
                ConnectionError::InvalidMessage(format!("malformed notification: {e}"))
            })?;
        return Ok(Some(notification));
    }
    Ok(None)
}

pub fn parse_response(json: &Object) -> Result<Option<Response>, ConnectionError> {
    let Some(id) = json.get("id") else {
        return Ok(None);
    };
    let outcome = match (json.get("result"), json.get("error")) {
        (Some(result), None) => Ok(result.clone()),
        (None, Some(error)) => Err(decode_field::<ResponseError>(error, "error")?),
        (Some(_), Some(_)) => {
            return Err(ConnectionError::InvalidMessage(
                "response carries both result and error".to_string(),
            ))
        }
        (None, None) => return Ok(None),
    };
    let jsonrpc = json
        .get("jsonrpc")
        .ok_or_else(|| ConnectionError::InvalidMessage("missing field `jsonrpc`".to_string()))
        .and_then(|v| decode_field::<String>(v, "jsonrpc"))?;
    Ok(Some(Response {
        jsonrpc,
        id: decode_field::<RequestId>(id, "id")?,
        outcome,
    }))
}

fn decode_field<T: serde::de::DeserializeOwned>(
    value: &Value,
    field: &str,
) -> Result<T, ConnectionError> {
    T::deserialize(value)
        .map_err(|e| ConnectionError::InvalidMessage(format!("malformed response {field}: {e}")))
}

/// Parse a full JSON payload (bytes) into a [`Message`].
pub fn parse_message_from_slice(s: &[u8]) -> Result<Message, ConnectionError> {
    let json: Value = serde_json::from_slice(s)
        .map_err(|e| ConnectionError::InvalidMessage(format!("invalid JSON: {e}")))?;
    let Value::Object(object) = json else {
        return Err(invalid_request(s));
    };
    if let Some(request) = parse_request(&object)? {
        return Ok(Message::Request(request));
    }
    if let Some(notification) = parse_notification(&object)? {
        return Ok(Message::Notification(notification));
    }
    if let Some(response) = parse_response(&object)? {
        return Ok(Message::Response(response));
    }
    Err(invalid_request(s))
}

fn invalid_request(s: &[u8]) -> ConnectionError {
    ConnectionError::InvalidMessage(format!("invalid request: {}", String::from_utf8_lossy(s)))
}
