//! Stateless one-shot tool adapter (§4.5): `listTools`/`getTool`/`callTool`
//! each open a fresh session, initialize, issue one request, record
//! everything, and close — no state survives between calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::recorder::SessionRecorder;
use crate::store::{Direction, ExitReason, Stores};
use crate::transport::McpTransport;
use crate::transport::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};

#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("schema validation failed: {0}")]
    Schema(String),
}

/// `sessionId` is always populated, even on failure, so a caller can point a
/// user at the recorded trace regardless of outcome (§4.5 contract).
#[derive(Debug, Clone)]
pub struct ToolAdapterResult {
    pub session_id: String,
    pub outcome: Result<Value, AdapterError>,
}

pub struct ToolAdapter {
    stores: Stores,
    recorder: Arc<SessionRecorder>,
}

impl ToolAdapter {
    pub fn new(stores: Stores, recorder: Arc<SessionRecorder>) -> Self {
        Self { stores, recorder }
    }

    pub async fn list_tools(&self, target_id: &str, transport: &dyn McpTransport, timeout: Duration) -> ToolAdapterResult {
        self.one_shot(target_id, transport, timeout, "tools/list", None).await
    }

    pub async fn get_tool(&self, target_id: &str, transport: &dyn McpTransport, timeout: Duration, name: &str) -> ToolAdapterResult {
        self.one_shot(target_id, transport, timeout, "tools/get", Some(serde_json::json!({"name": name}))).await
    }

    /// Validates `arguments` against `input_schema.required` (and each
    /// declared property's `type` tag) before invoking the backend, per the
    /// adapter's optional client-side validation contract.
    pub async fn call_tool(
        &self,
        target_id: &str,
        transport: &dyn McpTransport,
        timeout: Duration,
        name: &str,
        arguments: Value,
        input_schema: Option<&Value>,
    ) -> ToolAdapterResult {
        if let Some(schema) = input_schema {
            if let Err(message) = validate_arguments(schema, &arguments) {
                let session = match self.stores.create_session(target_id) {
                    Ok(s) => s,
                    Err(e) => {
                        return ToolAdapterResult { session_id: String::new(), outcome: Err(AdapterError::Transport(e.to_string())) };
                    },
                };
                let _ = self.stores.end_session(&session.session_id, ExitReason::Error);
                return ToolAdapterResult { session_id: session.session_id, outcome: Err(AdapterError::Schema(message)) };
            }
        }
        self.one_shot(
            target_id,
            transport,
            timeout,
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    async fn one_shot(
        &self,
        target_id: &str,
        transport: &dyn McpTransport,
        timeout: Duration,
        method: &str,
        params: Option<Value>,
    ) -> ToolAdapterResult {
        let session = match self.stores.create_session(target_id) {
            Ok(s) => s,
            Err(e) => return ToolAdapterResult { session_id: String::new(), outcome: Err(AdapterError::Transport(e.to_string())) },
        };
        let session_id = session.session_id;

        if let Err(e) = transport.call("initialize", None, timeout).await {
            self.recorder.record_transport_event(&session_id, Direction::ServerToClient, &format!("initialize failed: {e}"));
            let _ = self.stores.end_session(&session_id, ExitReason::Error);
            return ToolAdapterResult { session_id, outcome: Err(AdapterError::Transport(e.to_string())) };
        }

        let request_id = RpcId::Number(1);
        self.recorder.record(
            &session_id,
            Direction::ClientToServer,
            &crate::transport::Frame::Request(JsonRpcRequest { id: request_id.clone(), method: method.to_string(), params: params.clone() }),
            None,
        );

        match transport.call(method, params, timeout).await {
            Ok(value) => {
                self.recorder.record(
                    &session_id,
                    Direction::ServerToClient,
                    &crate::transport::Frame::Response(JsonRpcResponse { id: request_id, result: Some(value.clone()), error: None }),
                    None,
                );
                let _ = self.stores.end_session(&session_id, ExitReason::Normal);
                ToolAdapterResult { session_id, outcome: Ok(value) }
            },
            Err(e) => {
                self.recorder.record(
                    &session_id,
                    Direction::ServerToClient,
                    &crate::transport::Frame::Response(JsonRpcResponse {
                        id: request_id,
                        result: None,
                        error: Some(JsonRpcError { code: -32000, message: e.to_string(), data: None }),
                    }),
                    None,
                );
                let _ = self.stores.end_session(&session_id, ExitReason::Error);
                ToolAdapterResult { session_id, outcome: Err(AdapterError::Transport(e.to_string())) }
            },
        }
    }
}

fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for req in required {
            if let Some(name) = req.as_str()
                && arguments.get(name).is_none()
            {
                return Err(format!("missing required argument: {name}"));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in props {
            let Some(value) = arguments.get(key) else { continue };
            if let Some(expected) = prop_schema.get("type").and_then(Value::as_str)
                && !type_matches(expected, value)
            {
                return Err(format!("argument `{key}` has the wrong type, expected `{expected}`"));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
