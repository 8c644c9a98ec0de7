//! Session / RpcCall / Event persistence — the core of §4.1.
//!
//! All operations are exposed as methods on [`super::Stores`] so call sites
//! never see a bare `Connection`; the lock guarding the single writer
//! connection is acquired and released within each call.

use rusqlite::{OptionalExtension, params};

use super::{PersistenceError, Result, Stores};
use proofscan_core::ids::{new_id, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
	Normal,
	Error,
	Killed,
	Timeout,
}

impl ExitReason {
	fn as_str(self) -> &'static str {
		match self {
			ExitReason::Normal => "normal",
			ExitReason::Error => "error",
			ExitReason::Killed => "killed",
			ExitReason::Timeout => "timeout",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	ClientToServer,
	ServerToClient,
}

impl Direction {
	fn as_str(self) -> &'static str {
		match self {
			Direction::ClientToServer => "client_to_server",
			Direction::ServerToClient => "server_to_client",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Request,
	Response,
	Notification,
	TransportEvent,
}

impl EventKind {
	fn as_str(self) -> &'static str {
		match self {
			EventKind::Request => "request",
			EventKind::Response => "response",
			EventKind::Notification => "notification",
			EventKind::TransportEvent => "transport_event",
		}
	}
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Session {
	pub session_id: String,
	pub target_id: String,
	pub started_at: i64,
	pub ended_at: Option<i64>,
	pub exit_reason: Option<String>,
	pub protected: bool,
	pub secret_ref_count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcCall {
	pub rpc_id: String,
	pub session_id: String,
	pub method: String,
	pub request_ts: i64,
	pub response_ts: Option<i64>,
	pub success: Option<bool>,
	pub error_code: Option<i64>,
}

/// Input to [`Stores::save_event`]. Mirrors the raw frame shape described in
/// §4.4 of the recorder design.
pub struct NewEvent<'a> {
	pub session_id: &'a str,
	pub direction: Direction,
	pub kind: EventKind,
	pub rpc_id: Option<&'a str>,
	pub label: Option<&'a str>,
	pub payload_hash: Option<&'a str>,
	pub payload_size: Option<i64>,
	pub raw_json: Option<&'a str>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
	pub event_id: String,
	pub session_id: String,
	pub rpc_id: Option<String>,
	pub direction: String,
	pub kind: String,
	pub seq: i64,
	pub ts: i64,
	pub label: Option<String>,
	pub payload_hash: Option<String>,
	pub payload_size: Option<i64>,
	pub raw_json: Option<String>,
}

impl Stores {
	pub fn create_session(&self, target_id: &str) -> Result<Session> {
		let session_id = new_id();
		let started_at = now_ms();
		let conn = self.events.lock();
		conn.execute(
			"INSERT INTO sessions (session_id, target_id, started_at, protected, secret_ref_count) VALUES (?1, ?2, ?3, 0, 0)",
			params![session_id, target_id, started_at],
		)?;
		Ok(Session {
			session_id,
			target_id: target_id.to_string(),
			started_at,
			ended_at: None,
			exit_reason: None,
			protected: false,
			secret_ref_count: 0,
		})
	}

	/// Sets `ended_at` if null. Second and later calls are no-ops, per the
	/// idempotence invariant in §8.
	pub fn end_session(&self, session_id: &str, reason: ExitReason) -> Result<()> {
		let conn = self.events.lock();
		conn.execute(
			"UPDATE sessions SET ended_at = ?1, exit_reason = ?2 WHERE session_id = ?3 AND ended_at IS NULL",
			params![now_ms(), reason.as_str(), session_id],
		)?;
		Ok(())
	}

	/// Creates the rpc row if absent; returns the existing row on a duplicate
	/// `(rpc_id, session_id)` key rather than erroring.
	pub fn save_rpc_call(&self, session_id: &str, rpc_id: &str, method: &str) -> Result<RpcCall> {
		let conn = self.events.lock();
		let existing = conn
			.query_row(
				"SELECT rpc_id, session_id, method, request_ts, response_ts, success, error_code
				 FROM rpc_calls WHERE rpc_id = ?1 AND session_id = ?2",
				params![rpc_id, session_id],
				map_rpc_call,
			)
			.optional()?;
		if let Some(row) = existing {
			return Ok(row);
		}

		let request_ts = now_ms();
		conn.execute(
			"INSERT INTO rpc_calls (rpc_id, session_id, method, request_ts) VALUES (?1, ?2, ?3, ?4)",
			params![rpc_id, session_id, method, request_ts],
		)?;
		Ok(RpcCall {
			rpc_id: rpc_id.to_string(),
			session_id: session_id.to_string(),
			method: method.to_string(),
			request_ts,
			response_ts: None,
			success: None,
			error_code: None,
		})
	}

	/// Sets `response_ts`/`success`/`error_code`. A second completion for the
	/// same `(rpc_id, session_id)` is a no-op.
	pub fn complete_rpc_call(
		&self,
		session_id: &str,
		rpc_id: &str,
		success: bool,
		error_code: Option<i64>,
	) -> Result<()> {
		let conn = self.events.lock();
		conn.execute(
			"UPDATE rpc_calls SET response_ts = ?1, success = ?2, error_code = ?3
			 WHERE rpc_id = ?4 AND session_id = ?5 AND response_ts IS NULL",
			params![now_ms(), success as i64, error_code, rpc_id, session_id],
		)?;
		Ok(())
	}

	/// Appends an event row, assigning `seq` from a per-session counter
	/// (`max(seq) + 1`, computed inside the same critical section as the
	/// insert so concurrent writers for the same session can't collide).
	pub fn save_event(&self, ev: NewEvent<'_>) -> Result<Event> {
		let conn = self.events.lock();
		let seq: i64 = conn.query_row(
			"SELECT COALESCE(MAX(seq), -1) + 1 FROM events WHERE session_id = ?1",
			params![ev.session_id],
			|r| r.get(0),
		)?;
		let event_id = new_id();
		let ts = now_ms();
		conn.execute(
			"INSERT INTO events (event_id, session_id, rpc_id, direction, kind, seq, ts, label, payload_hash, payload_size, raw_json)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
			params![
				event_id,
				ev.session_id,
				ev.rpc_id,
				ev.direction.as_str(),
				ev.kind.as_str(),
				seq,
				ts,
				ev.label,
				ev.payload_hash,
				ev.payload_size,
				ev.raw_json,
			],
		)?;
		Ok(Event {
			event_id,
			session_id: ev.session_id.to_string(),
			rpc_id: ev.rpc_id.map(str::to_string),
			direction: ev.direction.as_str().to_string(),
			kind: ev.kind.as_str().to_string(),
			seq,
			ts,
			label: ev.label.map(str::to_string),
			payload_hash: ev.payload_hash.map(str::to_string),
			payload_size: ev.payload_size,
			raw_json: ev.raw_json.map(str::to_string),
		})
	}

	pub fn events_for_session(&self, session_id: &str) -> Result<Vec<Event>> {
		let conn = self.events.lock();
		let mut stmt = conn.prepare(
			"SELECT event_id, session_id, rpc_id, direction, kind, seq, ts, label, payload_hash, payload_size, raw_json
			 FROM events WHERE session_id = ?1 ORDER BY seq ASC",
		)?;
		let rows = stmt
			.query_map(params![session_id], map_event)?
			.collect::<std::result::Result<Vec<_>, _>>()?;
		Ok(rows)
	}

	pub fn rpc_call(&self, session_id: &str, rpc_id: &str) -> Result<Option<RpcCall>> {
		let conn = self.events.lock();
		conn.query_row(
			"SELECT rpc_id, session_id, method, request_ts, response_ts, success, error_code
			 FROM rpc_calls WHERE rpc_id = ?1 AND session_id = ?2",
			params![rpc_id, session_id],
			map_rpc_call,
		)
		.optional()
		.map_err(PersistenceError::from)
	}

	pub fn session(&self, session_id: &str) -> Result<Option<Session>> {
		let conn = self.events.lock();
		conn.query_row(
			"SELECT session_id, target_id, started_at, ended_at, exit_reason, protected, secret_ref_count
			 FROM sessions WHERE session_id = ?1",
			params![session_id],
			map_session,
		)
		.optional()
		.map_err(PersistenceError::from)
	}

	pub fn count_events_by_kind(&self, session_id: &str) -> Result<Vec<(String, i64)>> {
		let conn = self.events.lock();
		let mut stmt = conn.prepare(
			"SELECT kind, COUNT(*) FROM events WHERE session_id = ?1 GROUP BY kind",
		)?;
		let rows = stmt
			.query_map(params![session_id], |r| Ok((r.get(0)?, r.get(1)?)))?
			.collect::<std::result::Result<Vec<_>, _>>()?;
		Ok(rows)
	}
}

fn map_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
	Ok(Session {
		session_id: row.get(0)?,
		target_id: row.get(1)?,
		started_at: row.get(2)?,
		ended_at: row.get(3)?,
		exit_reason: row.get(4)?,
		protected: row.get::<_, i64>(5)? != 0,
		secret_ref_count: row.get(6)?,
	})
}

fn map_rpc_call(row: &rusqlite::Row) -> rusqlite::Result<RpcCall> {
	Ok(RpcCall {
		rpc_id: row.get(0)?,
		session_id: row.get(1)?,
		method: row.get(2)?,
		request_ts: row.get(3)?,
		response_ts: row.get(4)?,
		success: row.get::<_, Option<i64>>(5)?.map(|v| v != 0),
		error_code: row.get(6)?,
	})
}

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
	Ok(Event {
		event_id: row.get(0)?,
		session_id: row.get(1)?,
		rpc_id: row.get(2)?,
		direction: row.get(3)?,
		kind: row.get(4)?,
		seq: row.get(5)?,
		ts: row.get(6)?,
		label: row.get(7)?,
		payload_hash: row.get(8)?,
		payload_size: row.get(9)?,
		raw_json: row.get(10)?,
	})
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	fn stores() -> (tempfile::TempDir, Stores) {
		let dir = tempdir().unwrap();
		let stores = Stores::open(dir.path()).unwrap();
		(dir, stores)
	}

	#[test]
	fn end_session_is_idempotent() {
		let (_dir, stores) = stores();
		let session = stores.create_session("conn-a").unwrap();
		stores.end_session(&session.session_id, ExitReason::Normal).unwrap();
		let after_first = stores.session(&session.session_id).unwrap().unwrap();
		stores.end_session(&session.session_id, ExitReason::Error).unwrap();
		let after_second = stores.session(&session.session_id).unwrap().unwrap();
		assert_eq!(after_first.ended_at, after_second.ended_at);
		assert_eq!(after_second.exit_reason.as_deref(), Some("normal"));
	}

	#[test]
	fn complete_rpc_call_is_idempotent() {
		let (_dir, stores) = stores();
		let session = stores.create_session("conn-a").unwrap();
		stores.save_rpc_call(&session.session_id, "1", "tools/call").unwrap();
		stores.complete_rpc_call(&session.session_id, "1", true, None).unwrap();
		let after_first = stores.rpc_call(&session.session_id, "1").unwrap().unwrap();
		stores.complete_rpc_call(&session.session_id, "1", false, Some(-32000)).unwrap();
		let after_second = stores.rpc_call(&session.session_id, "1").unwrap().unwrap();
		assert_eq!(after_first.response_ts, after_second.response_ts);
		assert_eq!(after_second.success, Some(true));
	}

	#[test]
	fn duplicate_save_rpc_call_returns_existing_row() {
		let (_dir, stores) = stores();
		let session = stores.create_session("conn-a").unwrap();
		let first = stores.save_rpc_call(&session.session_id, "1", "tools/call").unwrap();
		let second = stores.save_rpc_call(&session.session_id, "1", "tools/list").unwrap();
		assert_eq!(first.method, second.method);
		assert_eq!(second.method, "tools/call");
	}

	#[test]
	fn event_seq_strictly_increases_per_session() {
		let (_dir, stores) = stores();
		let session = stores.create_session("conn-a").unwrap();
		let e1 = stores
			.save_event(NewEvent {
				session_id: &session.session_id,
				direction: Direction::ClientToServer,
				kind: EventKind::Request,
				rpc_id: Some("1"),
				label: None,
				payload_hash: None,
				payload_size: None,
				raw_json: None,
			})
			.unwrap();
		let e2 = stores
			.save_event(NewEvent {
				session_id: &session.session_id,
				direction: Direction::ServerToClient,
				kind: EventKind::Response,
				rpc_id: Some("1"),
				label: None,
				payload_hash: None,
				payload_size: None,
				raw_json: None,
			})
			.unwrap();
		assert_eq!(e1.seq, 0);
		assert_eq!(e2.seq, 1);
		assert!(e2.ts >= e1.ts);
	}

	#[test]
	fn rpc_id_collision_across_sessions_is_isolated() {
		let (_dir, stores) = stores();
		let session_a = stores.create_session("conn-a").unwrap();
		let session_b = stores.create_session("conn-b").unwrap();
		stores.save_rpc_call(&session_a.session_id, "1", "initialize").unwrap();
		stores.save_rpc_call(&session_b.session_id, "1", "tools/list").unwrap();

		let a = stores.rpc_call(&session_a.session_id, "1").unwrap().unwrap();
		let b = stores.rpc_call(&session_b.session_id, "1").unwrap().unwrap();
		assert_eq!(a.method, "initialize");
		assert_eq!(b.method, "tools/list");
	}
}
