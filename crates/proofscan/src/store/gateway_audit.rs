//! The gateway's independent audit stream (§3 `GatewayEvent`). Lives in the
//! same `events.db` file as sessions/rpc_calls/events but is a separate
//! table with no foreign keys into them — the gateway owns these rows
//! exclusively.

use rusqlite::params;

use super::{Result, Stores};
use proofscan_core::ids::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
	GatewayAuthSuccess,
	GatewayAuthFailure,
	GatewayMcpRequest,
	GatewayMcpResponse,
	GatewayA2aRequest,
	GatewayA2aResponse,
	GatewayError,
}

impl GatewayEventKind {
	fn as_str(self) -> &'static str {
		use GatewayEventKind::*;
		match self {
			GatewayAuthSuccess => "gateway_auth_success",
			GatewayAuthFailure => "gateway_auth_failure",
			GatewayMcpRequest => "gateway_mcp_request",
			GatewayMcpResponse => "gateway_mcp_response",
			GatewayA2aRequest => "gateway_a2a_request",
			GatewayA2aResponse => "gateway_a2a_response",
			GatewayError => "gateway_error",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
	Allow,
	Deny,
}

impl Decision {
	fn as_str(self) -> &'static str {
		match self {
			Decision::Allow => "allow",
			Decision::Deny => "deny",
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct NewGatewayEvent {
	pub request_id: String,
	pub trace_id: Option<String>,
	pub client_id: Option<String>,
	pub target_id: Option<String>,
	pub method: Option<String>,
	pub event_kind: Option<&'static str>,
	pub decision: Option<&'static str>,
	pub deny_reason: Option<String>,
	pub status_code: Option<i64>,
	pub latency_ms: Option<i64>,
	pub upstream_latency_ms: Option<i64>,
	pub error: Option<String>,
	pub metadata_json: Option<String>,
}

impl NewGatewayEvent {
	pub fn new(request_id: impl Into<String>, kind: GatewayEventKind) -> Self {
		Self {
			request_id: request_id.into(),
			event_kind: Some(kind.as_str()),
			..Default::default()
		}
	}

	pub fn decision(mut self, d: Decision) -> Self {
		self.decision = Some(d.as_str());
		self
	}
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayEvent {
	pub request_id: String,
	pub trace_id: Option<String>,
	pub client_id: Option<String>,
	pub target_id: Option<String>,
	pub method: Option<String>,
	pub event_kind: String,
	pub decision: Option<String>,
	pub deny_reason: Option<String>,
	pub status_code: Option<i64>,
	pub latency_ms: Option<i64>,
	pub upstream_latency_ms: Option<i64>,
	pub error: Option<String>,
	pub metadata_json: Option<String>,
	pub ts: i64,
}

impl Stores {
	pub fn record_gateway_event(&self, ev: NewGatewayEvent) -> Result<()> {
		let conn = self.events.lock();
		conn.execute(
			"INSERT INTO gateway_events
			 (request_id, trace_id, client_id, target_id, method, event_kind, decision, deny_reason,
			  status_code, latency_ms, upstream_latency_ms, error, metadata_json, ts)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
			params![
				ev.request_id,
				ev.trace_id,
				ev.client_id,
				ev.target_id,
				ev.method,
				ev.event_kind,
				ev.decision,
				ev.deny_reason,
				ev.status_code,
				ev.latency_ms,
				ev.upstream_latency_ms,
				ev.error,
				ev.metadata_json,
				now_ms(),
			],
		)?;
		Ok(())
	}

	/// All gateway events sharing a `request_id`, in insertion order — used to
	/// verify the "request precedes response" invariant and to satisfy the
	/// `X-Request-Id` ↔ audit-pair testable property.
	pub fn gateway_events_for_request(&self, request_id: &str) -> Result<Vec<GatewayEvent>> {
		let conn = self.events.lock();
		let mut stmt = conn.prepare(
			"SELECT request_id, trace_id, client_id, target_id, method, event_kind, decision,
			        deny_reason, status_code, latency_ms, upstream_latency_ms, error, metadata_json, ts
			 FROM gateway_events WHERE request_id = ?1 ORDER BY id ASC",
		)?;
		let rows = stmt
			.query_map(params![request_id], |row| {
				Ok(GatewayEvent {
					request_id: row.get(0)?,
					trace_id: row.get(1)?,
					client_id: row.get(2)?,
					target_id: row.get(3)?,
					method: row.get(4)?,
					event_kind: row.get(5)?,
					decision: row.get(6)?,
					deny_reason: row.get(7)?,
					status_code: row.get(8)?,
					latency_ms: row.get(9)?,
					upstream_latency_ms: row.get(10)?,
					error: row.get(11)?,
					metadata_json: row.get(12)?,
					ts: row.get(13)?,
				})
			})?
			.collect::<std::result::Result<Vec<_>, _>>()?;
		Ok(rows)
	}

	pub fn gateway_events_in_window(&self, since_ms: i64, until_ms: i64) -> Result<Vec<GatewayEvent>> {
		let conn = self.events.lock();
		let mut stmt = conn.prepare(
			"SELECT request_id, trace_id, client_id, target_id, method, event_kind, decision,
			        deny_reason, status_code, latency_ms, upstream_latency_ms, error, metadata_json, ts
			 FROM gateway_events WHERE ts >= ?1 AND ts < ?2 ORDER BY ts ASC",
		)?;
		let rows = stmt
			.query_map(params![since_ms, until_ms], |row| {
				Ok(GatewayEvent {
					request_id: row.get(0)?,
					trace_id: row.get(1)?,
					client_id: row.get(2)?,
					target_id: row.get(3)?,
					method: row.get(4)?,
					event_kind: row.get(5)?,
					decision: row.get(6)?,
					deny_reason: row.get(7)?,
					status_code: row.get(8)?,
					latency_ms: row.get(9)?,
					upstream_latency_ms: row.get(10)?,
					error: row.get(11)?,
					metadata_json: row.get(12)?,
					ts: row.get(13)?,
				})
			})?
			.collect::<std::result::Result<Vec<_>, _>>()?;
		Ok(rows)
	}
}
