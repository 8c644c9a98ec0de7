//! Hand-rolled JSON-RPC 2.0 envelope types and frame classification (§4.4,
//! §9 "dynamic typing on JSON shapes → tagged variants").
//!
//! We deliberately do not depend on a JSON-RPC/MCP SDK crate here: the wire
//! format is simple enough that tagged variants plus `serde_json::Value` for
//! `params`/`result` give us full control over the "unknown frame is never
//! silently dropped" invariant the recorder depends on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC `id`, normalized to its string form for use as half of the
/// `(rpc_id, session_id)` composite key. The wire value may be a string or a
/// number; we preserve which it was so responses can be re-encoded
/// correctly, but comparisons and storage always use `as_str()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcId {
	String(String),
	Number(i64),
}

impl RpcId {
	pub fn as_str(&self) -> String {
		match self {
			RpcId::String(s) => s.clone(),
			RpcId::Number(n) => n.to_string(),
		}
	}
}

impl Serialize for RpcId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		match self {
			RpcId::String(s) => serializer.serialize_str(s),
			RpcId::Number(n) => serializer.serialize_i64(*n),
		}
	}
}

impl<'de> Deserialize<'de> for RpcId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let v = Value::deserialize(deserializer)?;
		match v {
			Value::String(s) => Ok(RpcId::String(s)),
			Value::Number(n) => Ok(RpcId::Number(n.as_i64().unwrap_or_default())),
			other => Err(serde::de::Error::custom(format!("invalid json-rpc id: {other}"))),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct JsonRpcRequest {
	pub id: RpcId,
	pub method: String,
	pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct JsonRpcResponse {
	pub id: RpcId,
	pub result: Option<Value>,
	pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
	pub fn is_success(&self) -> bool {
		self.error.is_none()
	}
}

#[derive(Debug, Clone)]
pub struct JsonRpcNotification {
	pub method: String,
	pub params: Option<Value>,
}

/// A classified wire frame. `Unknown` carries the raw value verbatim so the
/// recorder can still write a `transport_event` row for it instead of
/// dropping it.
#[derive(Debug, Clone)]
pub enum Frame {
	Request(JsonRpcRequest),
	Response(JsonRpcResponse),
	Notification(JsonRpcNotification),
	Unknown(Value),
}

/// Parses one line/message of the wire protocol and classifies it per §4.4
/// step 1: presence of `method`, `id`, and `result`/`error` determines the
/// variant.
pub fn classify(raw: &str) -> Frame {
	let Ok(value) = serde_json::from_str::<Value>(raw) else {
		return Frame::Unknown(Value::String(raw.to_string()));
	};
	classify_value(value)
}

pub fn classify_value(value: Value) -> Frame {
	let Some(obj) = value.as_object() else {
		return Frame::Unknown(value);
	};

	let id = obj.get("id").cloned();
	let method = obj.get("method").and_then(Value::as_str).map(str::to_string);
	let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");

	match (id, method, has_result_or_error) {
		(Some(id), Some(method), _) => {
			let Ok(id) = serde_json::from_value::<RpcId>(id) else {
				return Frame::Unknown(value);
			};
			Frame::Request(JsonRpcRequest {
				id,
				method,
				params: obj.get("params").cloned(),
			})
		},
		(Some(id), None, true) => {
			let Ok(id) = serde_json::from_value::<RpcId>(id) else {
				return Frame::Unknown(value);
			};
			let error = obj
				.get("error")
				.and_then(|e| serde_json::from_value::<JsonRpcError>(e.clone()).ok());
			Frame::Response(JsonRpcResponse {
				id,
				result: obj.get("result").cloned(),
				error,
			})
		},
		(None, Some(method), _) => Frame::Notification(JsonRpcNotification {
			method,
			params: obj.get("params").cloned(),
		}),
		_ => Frame::Unknown(value),
	}
}

/// Encodes a request as a JSON-RPC 2.0 wire object, ready to be
/// newline-terminated by the transport.
pub fn encode_request(id: &RpcId, method: &str, params: Option<Value>) -> String {
	serde_json::json!({
		"jsonrpc": "2.0",
		"id": id,
		"method": method,
		"params": params,
	})
	.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_request() {
		let frame = classify(r#"{"jsonrpc":"2.0","id":"1","method":"tools/list"}"#);
		assert!(matches!(frame, Frame::Request(r) if r.method == "tools/list"));
	}

	#[test]
	fn classifies_response_with_numeric_id() {
		let frame = classify(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#);
		match frame {
			Frame::Response(r) => {
				assert_eq!(r.id.as_str(), "1");
				assert!(r.is_success());
			},
			other => panic!("expected response, got {other:?}"),
		}
	}

	#[test]
	fn classifies_error_response() {
		let frame = classify(r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"not found"}}"#);
		match frame {
			Frame::Response(r) => {
				assert!(!r.is_success());
				assert_eq!(r.error.unwrap().code, -32601);
			},
			other => panic!("expected response, got {other:?}"),
		}
	}

	#[test]
	fn classifies_notification() {
		let frame = classify(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#);
		assert!(matches!(frame, Frame::Notification(n) if n.method == "notifications/message"));
	}

	#[test]
	fn unparseable_input_becomes_unknown_not_dropped() {
		let frame = classify("not json at all");
		assert!(matches!(frame, Frame::Unknown(_)));
	}

	#[test]
	fn malformed_object_becomes_unknown() {
		// Array at top level: no method/id/result shape to classify.
		let frame = classify("[1,2,3]");
		assert!(matches!(frame, Frame::Unknown(_)));
	}
}
