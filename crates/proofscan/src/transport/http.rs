//! Plain HTTP JSON-RPC transport (§4.3, `rpc-http` connector type):
//! `POST <baseUrl>` with a JSON-RPC 2.0 envelope, no streaming.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use super::jsonrpc::RpcId;
use super::{McpTransport, Result, TransportError};

pub struct HttpTransport {
	client: Client,
	base_url: String,
	next_id: AtomicI64,
}

impl HttpTransport {
	pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
		let client = Client::builder()
			.connect_timeout(connect_timeout)
			.build()
			.map_err(TransportError::Http)?;
		Ok(Self {
			client,
			base_url: base_url.into(),
			next_id: AtomicI64::new(1),
		})
	}
}

#[async_trait::async_trait]
impl McpTransport for HttpTransport {
	async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
		let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
		let body = serde_json::json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let response = self
			.client
			.post(&self.base_url)
			.header("content-type", "application/json")
			.header("accept", "application/json")
			.timeout(timeout)
			.json(&body)
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() {
					TransportError::Timeout(timeout)
				} else if e.is_connect() {
					TransportError::Unreachable(e.to_string())
				} else {
					TransportError::Http(e)
				}
			})?;

		let envelope: Value = response.json().await.map_err(TransportError::Http)?;
		if let Some(error) = envelope.get("error") {
			let message = error
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or("upstream error")
				.to_string();
			return Err(TransportError::Protocol(message));
		}
		Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
	}

	async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
		let body = serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params});
		self.client
			.post(&self.base_url)
			.header("content-type", "application/json")
			.json(&body)
			.send()
			.await
			.map_err(TransportError::Http)?;
		Ok(())
	}

	async fn close(&self) {}
}
