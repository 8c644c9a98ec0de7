//! Transport layer: stdio subprocess connections, HTTP/SSE connections, and
//! the shared JSON-RPC envelope types they both speak.

pub mod http;
pub mod jsonrpc;
pub mod sse;
pub mod ssrf;
pub mod stdio;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub use jsonrpc::{Frame, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId};

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("failed to spawn connector process: {0}")]
	Spawn(#[source] std::io::Error),
	#[error("connector process exited during startup")]
	EarlyExit,
	#[error("protocol framing error: {0}")]
	Protocol(String),
	#[error("transport closed")]
	Closed,
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	#[error("http error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("connection refused or unreachable: {0}")]
	Unreachable(String),
	#[error("SSRF guard: {0}")]
	Ssrf(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One request/response exchange over any transport, used by the queue
/// manager's `exec_fn` and by the tool adapter.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
	async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value>;

	async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

	async fn close(&self);
}
