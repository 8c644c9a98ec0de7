//! HTTP/SSE transport (§4.3, §6 "SSE (A2A streaming)"): a tolerant SSE
//! parser feeding a classifier for the four A2A event shapes, an A2A client
//! that drives `reqwest::bytes_stream()` through the SSRF guard, and
//! [`SseTransport`], the `rpc-sse` connector's [`McpTransport`] impl, which
//! reuses the same line-buffering to correlate a streamed JSON-RPC response
//! by `id` instead of classifying A2A shapes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::jsonrpc::{self, Frame, RpcId};
use super::ssrf::check_url_safe;
use super::{McpTransport, Result, TransportError};

/// Status values an A2A task can report. Unknown strings still deserialize
/// (`Other`) rather than failing the whole event, per the "never silently
/// drop a frame" posture carried over from the JSON-RPC classifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
	Pending,
	Working,
	InputRequired,
	Completed,
	Failed,
	Canceled,
	Rejected,
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactChunk {
	pub name: String,
	pub description: Option<String>,
	pub parts: Vec<Value>,
	pub index: Option<u64>,
	pub append: Option<bool>,
	pub last_chunk: Option<bool>,
}

/// One classified SSE event body. `ParseError` and `Unknown` are distinct
/// from a transport-level failure: the stream keeps running. `Serialize` is
/// derived so the gateway's A2A endpoint can hand the classified event
/// sequence back to its caller as a JSON array instead of a single opaque
/// upstream body.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum A2aEvent {
	Status { task_id: String, status: TaskStatus, r#final: bool, message: Option<Value>, context_id: Option<String> },
	Artifact { task_id: String, artifact: ArtifactChunk, context_id: Option<String> },
	Message { role: String, parts: Vec<Value>, metadata: Option<Value>, context_id: Option<String>, reference_task_ids: Vec<String> },
	Task { id: String, status: TaskStatus, messages: Vec<Value>, artifacts: Vec<Value> },
	ParseError(String),
	Done,
}

/// Classifies one parsed JSON event body by field presence, mirroring
/// `jsonrpc::classify_value`'s tagged-variant-over-untagged-enum approach:
/// the four A2A shapes share enough optional fields that `#[serde(untagged)]`
/// would pick the wrong arm silently.
pub fn classify_a2a_payload(value: &Value) -> A2aEvent {
	let Some(obj) = value.as_object() else {
		return A2aEvent::ParseError(format!("A2A event body is not an object: {value}"));
	};

	if let (Some(task_id), Some(status)) = (obj.get("taskId").and_then(Value::as_str), obj.get("status")) {
		if obj.contains_key("artifact") {
			// A status-bearing object can't also carry an artifact in this schema;
			// fall through to the artifact arm below instead of double-matching.
		} else {
			let status = serde_json::from_value(status.clone()).unwrap_or(TaskStatus::Other);
			return A2aEvent::Status {
				task_id: task_id.to_string(),
				status,
				r#final: obj.get("final").and_then(Value::as_bool).unwrap_or(false),
				message: obj.get("message").cloned(),
				context_id: obj.get("contextId").and_then(Value::as_str).map(str::to_string),
			};
		}
	}

	if let Some(task_id) = obj.get("taskId").and_then(Value::as_str) {
		if let Some(artifact) = obj.get("artifact") {
			return match serde_json::from_value::<ArtifactChunk>(artifact.clone()) {
				Ok(artifact) => {
					A2aEvent::Artifact { task_id: task_id.to_string(), artifact, context_id: obj.get("contextId").and_then(Value::as_str).map(str::to_string) }
				},
				Err(e) => A2aEvent::ParseError(format!("malformed artifact: {e}")),
			};
		}
	}

	if let (Some(id), Some(status)) = (obj.get("id").and_then(Value::as_str), obj.get("status")) {
		if obj.contains_key("messages") || obj.contains_key("artifacts") {
			let status = serde_json::from_value(status.clone()).unwrap_or(TaskStatus::Other);
			return A2aEvent::Task {
				id: id.to_string(),
				status,
				messages: obj.get("messages").and_then(Value::as_array).cloned().unwrap_or_default(),
				artifacts: obj.get("artifacts").and_then(Value::as_array).cloned().unwrap_or_default(),
			};
		}
	}

	if let Some(role) = obj.get("role").and_then(Value::as_str) {
		return A2aEvent::Message {
			role: role.to_string(),
			parts: obj.get("parts").and_then(Value::as_array).cloned().unwrap_or_default(),
			metadata: obj.get("metadata").cloned(),
			context_id: obj.get("contextId").and_then(Value::as_str).map(str::to_string),
			reference_task_ids: obj
				.get("referenceTaskIds")
				.and_then(Value::as_array)
				.map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
				.unwrap_or_default(),
		};
	}

	A2aEvent::ParseError(format!("unrecognized A2A event shape: {value}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
	BetweenEvents,
	ReadingData,
}

/// Buffers raw SSE bytes one chunk at a time and yields the completed
/// `data:` payload of every blank-line-terminated event, tolerating chunk
/// boundaries anywhere in the stream (including mid-line and mid-UTF-8, via
/// an internal byte buffer flushed only at line boundaries). This is the
/// transport-framing half of SSE; what a payload *means* (an A2A event shape
/// for [`SseParser`], a JSON-RPC envelope for [`stream_json_rpc_call`]) is
/// left to the caller, the same "classify separately from frame" split
/// `jsonrpc::classify` uses for stdio.
struct RawSseLines {
	state: ParserState,
	line_buf: Vec<u8>,
	data_buf: String,
}

impl RawSseLines {
	fn new() -> Self {
		Self { state: ParserState::BetweenEvents, line_buf: Vec::new(), data_buf: String::new() }
	}

	fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
		let mut out = Vec::new();
		for &byte in chunk {
			if byte == b'\n' {
				let line = std::mem::take(&mut self.line_buf);
				self.process_line(&line, &mut out);
			} else {
				self.line_buf.push(byte);
			}
		}
		out
	}

	fn process_line(&mut self, raw_line: &[u8], out: &mut Vec<String>) {
		let line = String::from_utf8_lossy(raw_line);
		let line = line.strip_suffix('\r').unwrap_or(&line);

		if line.is_empty() {
			if self.state == ParserState::ReadingData && !self.data_buf.is_empty() {
				out.push(std::mem::take(&mut self.data_buf));
			}
			self.state = ParserState::BetweenEvents;
			return;
		}

		if let Some(data) = line.strip_prefix("data:") {
			let data = data.strip_prefix(' ').unwrap_or(data);
			if !self.data_buf.is_empty() {
				self.data_buf.push('\n');
			}
			self.data_buf.push_str(data);
			self.state = ParserState::ReadingData;
			return;
		}

		// `event:`, `id:`, `retry:`, and `:`-comment lines are recognized but
		// carry no information this client needs; everything else not matching
		// `field: value` is tolerated too.
	}
}

/// Feeds raw SSE bytes and classifies each dispatched payload as an
/// [`A2aEvent`].
pub struct SseParser {
	raw: RawSseLines,
	done: bool,
}

impl Default for SseParser {
	fn default() -> Self {
		Self::new()
	}
}

impl SseParser {
	pub fn new() -> Self {
		Self { raw: RawSseLines::new(), done: false }
	}

	/// Feeds one chunk of bytes and returns every event dispatched as a
	/// result of it (zero, one, or several if the chunk contains multiple
	/// blank-line-terminated events).
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<A2aEvent> {
		let mut out = Vec::new();
		for data in self.raw.feed(chunk) {
			self.dispatch(data, &mut out);
		}
		out
	}

	fn dispatch(&mut self, data: String, out: &mut Vec<A2aEvent>) {
		if data == "[DONE]" {
			self.done = true;
			out.push(A2aEvent::Done);
			return;
		}
		match serde_json::from_str::<Value>(&data) {
			Ok(value) => {
				let event = classify_a2a_payload(&value);
				if let A2aEvent::Status { r#final: true, .. } = &event {
					self.done = true;
				}
				out.push(event);
			},
			Err(e) => out.push(A2aEvent::ParseError(e.to_string())),
		}
	}

	pub fn is_done(&self) -> bool {
		self.done
	}
}

/// Streams one A2A `message/stream` call and classifies each event, honoring
/// an idle deadline between events in addition to the caller's overall
/// `timeout`. Stops as soon as `A2aEvent::Done` or a final status is seen,
/// even if the underlying connection has more bytes buffered.
pub async fn stream_message(
	client: &Client,
	url: &str,
	body: &Value,
	idle_timeout: Duration,
	overall_timeout: Duration,
) -> Result<Vec<A2aEvent>> {
	let parsed = Url::parse(url).map_err(|e| TransportError::Protocol(e.to_string()))?;
	check_url_safe(&parsed).await?;

	let response = client
		.post(parsed.clone())
		.header("content-type", "application/json")
		.header("accept", "text/event-stream")
		.timeout(overall_timeout)
		.json(body)
		.send()
		.await
		.map_err(|e| if e.is_timeout() { TransportError::Timeout(overall_timeout) } else { TransportError::Http(e) })?;

	let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
	if !content_type.starts_with("text/event-stream") {
		return Err(TransportError::Protocol(format!("expected text/event-stream, got {content_type}")));
	}

	let mut parser = SseParser::new();
	let mut events = Vec::new();
	let mut stream = response.bytes_stream();

	loop {
		let next = tokio::time::timeout(idle_timeout, stream.next()).await;
		let chunk: Option<std::result::Result<Bytes, reqwest::Error>> = match next {
			Ok(chunk) => chunk,
			Err(_) => return Err(TransportError::Timeout(idle_timeout)),
		};
		let Some(chunk) = chunk else { break };
		let chunk = chunk.map_err(TransportError::Http)?;
		events.extend(parser.feed(&chunk));
		if parser.is_done() {
			break;
		}
	}

	Ok(events)
}

/// Opens an SSE stream for one JSON-RPC call and returns the result of the
/// response envelope whose `id` matches the request, the same correlation
/// rule the stdio transport's pending-map applies. Other events on the
/// stream (progress notifications, responses to other in-flight ids) are
/// tolerated and skipped rather than treated as protocol errors; the stream
/// stops as soon as the matching response is seen or `[DONE]`/the connection
/// closes without one.
async fn stream_json_rpc_response(client: &Client, url: &str, id: &RpcId, method: &str, params: Option<Value>, idle_timeout: Duration, overall_timeout: Duration) -> Result<Value> {
	let parsed = Url::parse(url).map_err(|e| TransportError::Protocol(e.to_string()))?;
	check_url_safe(&parsed).await?;

	let body = serde_json::json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
	let response = client
		.post(parsed)
		.header("content-type", "application/json")
		.header("accept", "text/event-stream")
		.timeout(overall_timeout)
		.json(&body)
		.send()
		.await
		.map_err(|e| if e.is_timeout() { TransportError::Timeout(overall_timeout) } else { TransportError::Http(e) })?;

	let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
	if !content_type.starts_with("text/event-stream") {
		return Err(TransportError::Protocol(format!("expected text/event-stream, got {content_type}")));
	}

	let mut raw = RawSseLines::new();
	let mut stream = response.bytes_stream();
	loop {
		let next = tokio::time::timeout(idle_timeout, stream.next()).await;
		let chunk: Option<std::result::Result<Bytes, reqwest::Error>> = match next {
			Ok(chunk) => chunk,
			Err(_) => return Err(TransportError::Timeout(idle_timeout)),
		};
		let Some(chunk) = chunk else { break };
		let chunk = chunk.map_err(TransportError::Http)?;
		for data in raw.feed(&chunk) {
			if data == "[DONE]" {
				return Err(TransportError::Protocol(format!("stream ended without a response for id {}", id.as_str())));
			}
			let value = match serde_json::from_str::<Value>(&data) {
				Ok(v) => v,
				Err(_) => continue,
			};
			if let Frame::Response(resp) = jsonrpc::classify_value(value)
				&& resp.id == *id
			{
				return match resp.error {
					Some(e) => Err(TransportError::Protocol(e.message)),
					None => Ok(resp.result.unwrap_or(Value::Null)),
				};
			}
		}
	}

	Err(TransportError::Protocol(format!("stream closed without a response for id {}", id.as_str())))
}

/// The `rpc-sse` connector's [`McpTransport`]: every call opens its own SSE
/// stream and correlates the response by id, rather than holding one
/// long-lived connection the way the stdio transport does — `rpc-sse`
/// backends are HTTP endpoints, so there is no persistent process to
/// multiplex against between calls.
pub struct SseTransport {
	client: Client,
	base_url: String,
	next_id: AtomicI64,
	idle_timeout: Duration,
}

impl SseTransport {
	pub fn new(base_url: impl Into<String>, idle_timeout: Duration) -> Self {
		Self { client: Client::new(), base_url: base_url.into(), next_id: AtomicI64::new(1), idle_timeout }
	}
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
	async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
		let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
		stream_json_rpc_response(&self.client, &self.base_url, &id, method, params, self.idle_timeout.min(timeout), timeout).await
	}

	async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
		let parsed = Url::parse(&self.base_url).map_err(|e| TransportError::Protocol(e.to_string()))?;
		check_url_safe(&parsed).await?;
		let body = serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params});
		self.client.post(parsed).header("content-type", "application/json").json(&body).send().await.map_err(TransportError::Http)?;
		Ok(())
	}

	async fn close(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_status_event() {
		let mut parser = SseParser::new();
		let chunk = b"data: {\"taskId\":\"t1\",\"status\":\"working\"}\n\n";
		let events = parser.feed(chunk);
		assert_eq!(events.len(), 1);
		assert!(matches!(&events[0], A2aEvent::Status { task_id, status: TaskStatus::Working, .. } if task_id == "t1"));
	}

	#[test]
	fn tolerates_non_data_fields_and_comments() {
		let mut parser = SseParser::new();
		let chunk = b": keep-alive\nevent: task-update\nid: 42\ndata: {\"taskId\":\"t1\",\"status\":\"completed\",\"final\":true}\n\n";
		let events = parser.feed(chunk);
		assert_eq!(events.len(), 1);
		assert!(matches!(&events[0], A2aEvent::Status { r#final: true, .. }));
		assert!(parser.is_done());
	}

	#[test]
	fn buffer_carries_across_feed_calls() {
		let mut parser = SseParser::new();
		let first = parser.feed(b"data: {\"taskId\":\"t1\",");
		assert!(first.is_empty());
		let second = parser.feed(b"\"status\":\"pending\"}\n\n");
		assert_eq!(second.len(), 1);
		assert!(matches!(&second[0], A2aEvent::Status { status: TaskStatus::Pending, .. }));
	}

	#[test]
	fn multiline_data_joins_with_newline() {
		let mut parser = SseParser::new();
		let chunk = b"data: {\"role\":\"user\",\n data: \"parts\":[]}\n\n";
		// Two data: lines in the same event concatenate with \n before parsing;
		// this particular split is not valid JSON once joined, so we expect a
		// parse error rather than a silently dropped event.
		let events = parser.feed(chunk);
		assert_eq!(events.len(), 1);
		assert!(matches!(&events[0], A2aEvent::ParseError(_)));
	}

	#[test]
	fn done_sentinel_terminates_cleanly() {
		let mut parser = SseParser::new();
		let events = parser.feed(b"data: [DONE]\n\n");
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], A2aEvent::Done));
		assert!(parser.is_done());
	}

	#[test]
	fn malformed_json_emits_parse_error_and_keeps_going() {
		let mut parser = SseParser::new();
		let events = parser.feed(b"data: not json\n\ndata: {\"taskId\":\"t1\",\"status\":\"working\"}\n\n");
		assert_eq!(events.len(), 2);
		assert!(matches!(&events[0], A2aEvent::ParseError(_)));
		assert!(matches!(&events[1], A2aEvent::Status { .. }));
	}

	#[test]
	fn classifies_artifact_event() {
		let value = serde_json::json!({
			"taskId": "t1",
			"artifact": {"name": "result.txt", "parts": [], "append": true, "index": 2},
		});
		let event = classify_a2a_payload(&value);
		assert!(matches!(event, A2aEvent::Artifact { artifact, .. } if artifact.name == "result.txt" && artifact.append == Some(true)));
	}

	#[test]
	fn classifies_standalone_message_event() {
		let value = serde_json::json!({"role": "agent", "parts": [{"text": "hi"}]});
		let event = classify_a2a_payload(&value);
		assert!(matches!(event, A2aEvent::Message { role, .. } if role == "agent"));
	}

	#[test]
	fn classifies_complete_task_event() {
		let value = serde_json::json!({
			"id": "t1", "status": "completed", "messages": [], "artifacts": [],
		});
		let event = classify_a2a_payload(&value);
		assert!(matches!(event, A2aEvent::Task { status: TaskStatus::Completed, .. }));
	}

	#[test]
	fn unrecognized_shape_becomes_parse_error_not_dropped() {
		let value = serde_json::json!({"unexpected": "shape"});
		let event = classify_a2a_payload(&value);
		assert!(matches!(event, A2aEvent::ParseError(_)));
	}

	#[tokio::test]
	async fn stream_message_collects_events_until_done() {
		use wiremock::matchers::{method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		let sse_body = "data: {\"taskId\":\"t1\",\"status\":\"working\"}\n\ndata: [DONE]\n\n";
		Mock::given(method("POST"))
			.and(path("/message/stream"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"))
			.mount(&server)
			.await;

		let client = Client::new();
		let url = format!("{}/message/stream", server.uri());
		let events = stream_message(&client, &url, &serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
		assert_eq!(events.len(), 2);
		assert!(matches!(&events[0], A2aEvent::Status { status: TaskStatus::Working, .. }));
		assert!(matches!(events[1], A2aEvent::Done));
	}

	#[tokio::test]
	async fn sse_transport_call_correlates_response_by_id() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		let sse_body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n\n";
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"))
			.mount(&server)
			.await;

		let transport = SseTransport::new(server.uri(), Duration::from_secs(1));
		let result = transport.call("tools/list", None, Duration::from_secs(1)).await.unwrap();
		assert_eq!(result, serde_json::json!({"tools": []}));
	}

	#[tokio::test]
	async fn sse_transport_call_surfaces_upstream_error() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		let sse_body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32601,\"message\":\"method not found\"}}\n\n";
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"))
			.mount(&server)
			.await;

		let transport = SseTransport::new(server.uri(), Duration::from_secs(1));
		let err = transport.call("bogus", None, Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, TransportError::Protocol(msg) if msg == "method not found"));
	}

	#[tokio::test]
	async fn sse_transport_rejects_a_plain_json_response() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}})))
			.mount(&server)
			.await;

		let transport = SseTransport::new(server.uri(), Duration::from_secs(1));
		let err = transport.call("tools/list", None, Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, TransportError::Protocol(msg) if msg.contains("text/event-stream")));
	}
}
