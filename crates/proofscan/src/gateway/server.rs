//! The gateway's HTTP surface (§4.8): `POST /mcp/v1/message` and
//! `POST /a2a/v1/message` behind a seven-step pipeline — request id, auth,
//! body & validation, admission, queue, response, audit.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::gateway::auth::{AuthOutcome, authenticate};
use crate::gateway::ratelimit::RateLimiter;
use crate::queue::{EnqueueError, QueueError, QueueManager};
use crate::store::Stores;
use crate::store::gateway_audit::{Decision, GatewayEventKind, NewGatewayEvent};
use crate::transport::{McpTransport, TransportError};

/// Distinct key namespace so an agent id can never collide with a connector
/// id inside the shared [`QueueManager`].
fn agent_queue_key(agent_id: &str) -> String {
	format!("agent:{agent_id}")
}

pub struct GatewayState {
	config: Arc<Config>,
	stores: Stores,
	queue_manager: Arc<QueueManager>,
	connectors: DashMap<String, Arc<dyn McpTransport>>,
	agent_client: reqwest::Client,
	rate_limiter: RateLimiter,
}

impl GatewayState {
	/// Spawns a transport for every enabled connector and registers a queue
	/// for every enabled connector and agent target. A connector that fails
	/// to start is simply absent from `connectors`, so requests against it
	/// fall through to the admission check's not-found/forbidden handling.
	pub async fn start(config: Arc<Config>, stores: Stores, queue_manager: Arc<QueueManager>) -> Arc<Self> {
		let connectors = DashMap::new();
		for connector in config.connectors.iter().filter(|c| c.enabled) {
			match crate::proxy::spawn_transport(connector).await {
				Ok(transport) => {
					queue_manager.register(&connector.id, connector.max_inflight, connector.max_queue_depth);
					connectors.insert(connector.id.clone(), transport);
				},
				Err(e) => {
					tracing::warn!(connector = %connector.id, error = %e, "gateway: failed to start connector, requests against it will be rejected");
				},
			}
		}
		for agent in config.agents.iter().filter(|a| a.enabled) {
			queue_manager.register(&agent_queue_key(&agent.id), 4, 32);
		}

		let rate_limiter = RateLimiter::new(config.gateway.rate_limit_per_minute);
		Arc::new(Self { config, stores, queue_manager, connectors, agent_client: reqwest::Client::new(), rate_limiter })
	}

	pub fn router(self: Arc<Self>) -> Router {
		let body_cap = self.config.gateway.body_cap_bytes;
		Router::new()
			.route("/mcp/v1/message", post(handle_mcp_message))
			.route("/a2a/v1/message", post(handle_a2a_message))
			.with_state(self)
			.layer(CorsLayer::permissive())
			.layer(DefaultBodyLimit::max(body_cap))
	}

	/// Closes every live connector transport, used on graceful shutdown.
	pub async fn shutdown(&self) {
		for entry in self.connectors.iter() {
			entry.value().close().await;
		}
	}
}

#[derive(Debug, Clone, Copy)]
enum ApiErrorCode {
	BadRequest,
	Unauthorized,
	Forbidden,
	NotFound,
	QueueFull,
	UpstreamTimeout,
	Internal,
}

impl ApiErrorCode {
	fn as_str(self) -> &'static str {
		match self {
			ApiErrorCode::BadRequest => "BAD_REQUEST",
			ApiErrorCode::Unauthorized => "UNAUTHORIZED",
			ApiErrorCode::Forbidden => "FORBIDDEN",
			ApiErrorCode::NotFound => "NOT_FOUND",
			ApiErrorCode::QueueFull => "QUEUE_FULL",
			ApiErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
			ApiErrorCode::Internal => "INTERNAL",
		}
	}

	fn status(self) -> StatusCode {
		match self {
			ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
			ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
			ApiErrorCode::Forbidden => StatusCode::FORBIDDEN,
			ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
			ApiErrorCode::QueueFull => StatusCode::TOO_MANY_REQUESTS,
			ApiErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			ApiErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
	code: &'static str,
	message: String,
	request_id: String,
}

fn error_response(request_id: &str, code: ApiErrorCode, message: impl Into<String>, retry_after_secs: Option<u64>) -> Response {
	let mut headers = HeaderMap::new();
	if let Ok(value) = HeaderValue::from_str(request_id) {
		headers.insert("x-request-id", value);
	}
	if let Some(secs) = retry_after_secs {
		headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
	}
	let body = ErrorBody { error: ErrorDetail { code: code.as_str(), message: message.into(), request_id: request_id.to_string() } };
	(code.status(), headers, axum::Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct McpMessageBody {
	connector: String,
	method: String,
	#[serde(default)]
	params: Option<Value>,
	#[serde(default)]
	id: Option<Value>,
}

async fn handle_mcp_message(State(state): State<Arc<GatewayState>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
	let request_id = proofscan_core::ids::new_id();
	let trace_id = headers.get("traceparent").and_then(|v| v.to_str().ok()).map(str::to_string);
	let start = Instant::now();

	let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());

	let parsed: McpMessageBody = match serde_json::from_slice(&body) {
		Ok(b) => b,
		Err(e) => return reject_before_queue(&state, &request_id, &trace_id, None, None, ApiErrorCode::BadRequest, e.to_string(), None),
	};
	if parsed.method.trim().is_empty() {
		return reject_before_queue(
			&state,
			&request_id,
			&trace_id,
			Some(&parsed.connector),
			Some(&parsed.method),
			ApiErrorCode::BadRequest,
			"`method` must be a non-empty string".to_string(),
			None,
		);
	}

	let required_permission = format!("mcp:call:{}", parsed.connector);
	match authenticate(&state.config.gateway, auth_header, &required_permission) {
		AuthOutcome::Allowed { token_name } => {
			if !state.rate_limiter.check(token_name.as_deref().unwrap_or("anonymous")) {
				return reject_before_queue(
					&state,
					&request_id,
					&trace_id,
					Some(&parsed.connector),
					Some(&parsed.method),
					ApiErrorCode::QueueFull,
					"rate limit exceeded".to_string(),
					Some(60),
				);
			}

			let Some(connector) = state.config.connector(&parsed.connector) else {
				return deny_admission(&state, &request_id, &trace_id, &parsed.connector, Some(&parsed.method), GatewayEventKind::GatewayMcpResponse);
			};
			if !connector.enabled || !state.connectors.contains_key(&parsed.connector) {
				return deny_admission(&state, &request_id, &trace_id, &parsed.connector, Some(&parsed.method), GatewayEventKind::GatewayMcpResponse);
			}

			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					client_id: token_name.clone(),
					target_id: Some(parsed.connector.clone()),
					method: Some(parsed.method.clone()),
					..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayMcpRequest).decision(Decision::Allow)
				})
				.ok();

			let transport = state.connectors.get(&parsed.connector).unwrap().clone();
			let method = parsed.method.clone();
			let params = parsed.params.clone();
			let timeout = connector.timeout;
			let outcome = state
				.queue_manager
				.enqueue(&parsed.connector, timeout, move |_cancel| {
					let transport = transport.clone();
					let method = method.clone();
					let params = params.clone();
					async move { transport.call(&method, params, timeout).await }
				})
				.await;

			finish_mcp_request(&state, &request_id, &trace_id, token_name, &parsed, start, outcome)
		},
		AuthOutcome::Denied(reason) => {
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					target_id: Some(parsed.connector.clone()),
					method: Some(parsed.method.clone()),
					deny_reason: Some(reason.as_str().to_string()),
					status_code: Some(if matches!(reason, crate::gateway::auth::DenyReason::InsufficientPermission) { 403 } else { 401 }),
					..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayAuthFailure).decision(Decision::Deny)
				})
				.ok();
			let code = if matches!(reason, crate::gateway::auth::DenyReason::InsufficientPermission) {
				ApiErrorCode::Forbidden
			} else {
				ApiErrorCode::Unauthorized
			};
			error_response(&request_id, code, format!("authentication denied: {}", reason.as_str()), None)
		},
	}
}

fn reject_before_queue(
	state: &GatewayState,
	request_id: &str,
	trace_id: &Option<String>,
	connector: Option<&str>,
	method: Option<&str>,
	code: ApiErrorCode,
	message: String,
	retry_after_secs: Option<u64>,
) -> Response {
	state
		.stores
		.record_gateway_event(NewGatewayEvent {
			trace_id: trace_id.clone(),
			target_id: connector.map(str::to_string),
			method: method.map(str::to_string),
			status_code: Some(code.status().as_u16() as i64),
			error: Some(message.clone()),
			..NewGatewayEvent::new(request_id, GatewayEventKind::GatewayError).decision(Decision::Deny)
		})
		.ok();
	error_response(request_id, code, message, retry_after_secs)
}

fn deny_admission(
	state: &GatewayState,
	request_id: &str,
	trace_id: &Option<String>,
	target_id: &str,
	method: Option<&str>,
	response_kind: GatewayEventKind,
) -> Response {
	let code = if state.config.gateway.hide_not_found { ApiErrorCode::Forbidden } else { ApiErrorCode::NotFound };
	state
		.stores
		.record_gateway_event(NewGatewayEvent {
			trace_id: trace_id.clone(),
			target_id: Some(target_id.to_string()),
			method: method.map(str::to_string),
			status_code: Some(code.status().as_u16() as i64),
			error: Some(format!("unknown or disabled target `{target_id}`")),
			..NewGatewayEvent::new(request_id, response_kind).decision(Decision::Deny)
		})
		.ok();
	error_response(request_id, code, format!("unknown or disabled target `{target_id}`"), None)
}

fn finish_mcp_request(
	state: &GatewayState,
	request_id: &str,
	trace_id: &Option<String>,
	client_id: Option<String>,
	parsed: &McpMessageBody,
	start: Instant,
	outcome: Result<crate::queue::EnqueueOutcome<Value>, EnqueueError<TransportError>>,
) -> Response {
	let latency_ms = start.elapsed().as_millis() as i64;
	match outcome {
		Ok(result) => {
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					client_id,
					target_id: Some(parsed.connector.clone()),
					method: Some(parsed.method.clone()),
					status_code: Some(200),
					latency_ms: Some(latency_ms),
					upstream_latency_ms: Some(result.upstream_latency_ms as i64),
					..NewGatewayEvent::new(request_id, GatewayEventKind::GatewayMcpResponse).decision(Decision::Allow)
				})
				.ok();
			let mut headers = HeaderMap::new();
			if let Ok(v) = HeaderValue::from_str(request_id) {
				headers.insert("x-request-id", v);
			}
			headers.insert("x-queue-wait-ms", HeaderValue::from(result.queue_wait_ms));
			let body = serde_json::json!({"jsonrpc": "2.0", "id": parsed.id, "result": result.result});
			(StatusCode::OK, headers, axum::Json(body)).into_response()
		},
		Err(e) => {
			let (code, retry_after) = match &e {
				EnqueueError::Queue(QueueError::QueueFull) => (ApiErrorCode::QueueFull, Some(1)),
				EnqueueError::Queue(QueueError::QueueTimeout) => (ApiErrorCode::UpstreamTimeout, None),
				EnqueueError::Queue(QueueError::ShuttingDown) => (ApiErrorCode::Internal, None),
				EnqueueError::Upstream(_) => (ApiErrorCode::Internal, None),
			};
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					target_id: Some(parsed.connector.clone()),
					method: Some(parsed.method.clone()),
					status_code: Some(code.status().as_u16() as i64),
					latency_ms: Some(latency_ms),
					error: Some(e.to_string()),
					..NewGatewayEvent::new(request_id, GatewayEventKind::GatewayMcpResponse).decision(Decision::Deny)
				})
				.ok();
			error_response(request_id, code, e.to_string(), retry_after)
		},
	}
}

#[derive(Debug, Deserialize)]
struct A2aMessageBody {
	agent: String,
	#[serde(flatten)]
	payload: Value,
}

async fn handle_a2a_message(State(state): State<Arc<GatewayState>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
	let request_id = proofscan_core::ids::new_id();
	let trace_id = headers.get("traceparent").and_then(|v| v.to_str().ok()).map(str::to_string);
	let start = Instant::now();
	let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());

	let parsed: A2aMessageBody = match serde_json::from_slice(&body) {
		Ok(b) => b,
		Err(e) => return reject_before_queue(&state, &request_id, &trace_id, None, None, ApiErrorCode::BadRequest, e.to_string(), None),
	};

	let required_permission = format!("a2a:call:{}", parsed.agent);
	let token_name = match authenticate(&state.config.gateway, auth_header, &required_permission) {
		AuthOutcome::Allowed { token_name } => token_name,
		AuthOutcome::Denied(reason) => {
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					target_id: Some(parsed.agent.clone()),
					deny_reason: Some(reason.as_str().to_string()),
					..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayAuthFailure).decision(Decision::Deny)
				})
				.ok();
			let code = if matches!(reason, crate::gateway::auth::DenyReason::InsufficientPermission) {
				ApiErrorCode::Forbidden
			} else {
				ApiErrorCode::Unauthorized
			};
			return error_response(&request_id, code, format!("authentication denied: {}", reason.as_str()), None);
		},
	};

	if !state.rate_limiter.check(token_name.as_deref().unwrap_or("anonymous")) {
		return reject_before_queue(&state, &request_id, &trace_id, Some(&parsed.agent), None, ApiErrorCode::QueueFull, "rate limit exceeded".to_string(), Some(60));
	}

	let Some(agent) = state.config.agent(&parsed.agent).filter(|a| a.enabled) else {
		return deny_admission(&state, &request_id, &trace_id, &parsed.agent, None, GatewayEventKind::GatewayA2aResponse);
	};

	state
		.stores
		.record_gateway_event(NewGatewayEvent {
			trace_id: trace_id.clone(),
			client_id: token_name.clone(),
			target_id: Some(parsed.agent.clone()),
			..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayA2aRequest).decision(Decision::Allow)
		})
		.ok();

	let url = agent.url.clone();
	let payload = parsed.payload.clone();
	let client = state.agent_client.clone();
	let timeout = state.config.gateway.default_timeout;
	let outcome = state
		.queue_manager
		.enqueue(&agent_queue_key(&parsed.agent), timeout, move |_cancel| {
			let client = client.clone();
			let url = url.clone();
			let payload = payload.clone();
			async move { forward_a2a(&client, &url, payload, timeout).await }
		})
		.await;

	let latency_ms = start.elapsed().as_millis() as i64;
	match outcome {
		Ok(result) => {
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					target_id: Some(parsed.agent.clone()),
					status_code: Some(200),
					latency_ms: Some(latency_ms),
					upstream_latency_ms: Some(result.upstream_latency_ms as i64),
					..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayA2aResponse).decision(Decision::Allow)
				})
				.ok();
			let mut headers = HeaderMap::new();
			if let Ok(v) = HeaderValue::from_str(&request_id) {
				headers.insert("x-request-id", v);
			}
			headers.insert("x-queue-wait-ms", HeaderValue::from(result.queue_wait_ms));
			(StatusCode::OK, headers, axum::Json(result.result)).into_response()
		},
		Err(e) => {
			let (code, retry_after) = match &e {
				EnqueueError::Queue(QueueError::QueueFull) => (ApiErrorCode::QueueFull, Some(1)),
				EnqueueError::Queue(QueueError::QueueTimeout) => (ApiErrorCode::UpstreamTimeout, None),
				EnqueueError::Queue(QueueError::ShuttingDown) => (ApiErrorCode::Internal, None),
				EnqueueError::Upstream(_) => (ApiErrorCode::Internal, None),
			};
			state
				.stores
				.record_gateway_event(NewGatewayEvent {
					trace_id: trace_id.clone(),
					target_id: Some(parsed.agent.clone()),
					status_code: Some(code.status().as_u16() as i64),
					latency_ms: Some(latency_ms),
					error: Some(e.to_string()),
					..NewGatewayEvent::new(&request_id, GatewayEventKind::GatewayA2aResponse).decision(Decision::Deny)
				})
				.ok();
			error_response(&request_id, code, e.to_string(), retry_after)
		},
	}
}

/// Drives one A2A `message/stream` call (§6 "SSE (A2A streaming)") and
/// folds the classified event sequence into a single JSON body: the
/// gateway's HTTP surface is request/response, so the streamed events are
/// collected rather than forwarded as a second SSE stream to the gateway's
/// own caller.
async fn forward_a2a(client: &reqwest::Client, url: &str, payload: Value, timeout: std::time::Duration) -> Result<Value, TransportError> {
	let stream_url = format!("{}/message/stream", url.trim_end_matches('/'));
	let idle_timeout = timeout.min(std::time::Duration::from_secs(30));
	let events = crate::transport::sse::stream_message(client, &stream_url, &payload, idle_timeout, timeout).await?;
	Ok(serde_json::json!({ "events": events }))
}
