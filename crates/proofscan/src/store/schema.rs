//! Schema versioning and idempotent migrations, applied at first open of
//! each database via `PRAGMA user_version`.

use rusqlite::Connection;

use super::Result;

const EVENTS_SCHEMA_VERSION: i64 = 1;
const AGENT_CACHE_SCHEMA_VERSION: i64 = 1;

pub fn migrate_events(conn: &Connection) -> Result<()> {
	let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
	if version >= EVENTS_SCHEMA_VERSION {
		return Ok(());
	}

	conn.execute_batch(
		r#"
		CREATE TABLE IF NOT EXISTS sessions (
			session_id        TEXT PRIMARY KEY,
			target_id         TEXT NOT NULL,
			started_at        INTEGER NOT NULL,
			ended_at          INTEGER,
			exit_reason       TEXT,
			protected         INTEGER NOT NULL DEFAULT 0,
			secret_ref_count  INTEGER NOT NULL DEFAULT 0
		);

		CREATE TABLE IF NOT EXISTS rpc_calls (
			rpc_id       TEXT NOT NULL,
			session_id   TEXT NOT NULL REFERENCES sessions(session_id),
			method       TEXT NOT NULL,
			request_ts   INTEGER NOT NULL,
			response_ts  INTEGER,
			success      INTEGER,
			error_code   INTEGER,
			PRIMARY KEY (rpc_id, session_id)
		);

		CREATE TABLE IF NOT EXISTS events (
			event_id     TEXT PRIMARY KEY,
			session_id   TEXT NOT NULL REFERENCES sessions(session_id),
			rpc_id       TEXT,
			direction    TEXT NOT NULL,
			kind         TEXT NOT NULL,
			seq          INTEGER NOT NULL,
			ts           INTEGER NOT NULL,
			label        TEXT,
			payload_hash TEXT,
			payload_size INTEGER,
			raw_json     TEXT,
			FOREIGN KEY (rpc_id, session_id) REFERENCES rpc_calls(rpc_id, session_id)
		);
		CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, seq);
		CREATE INDEX IF NOT EXISTS idx_events_rpc ON events(rpc_id, session_id);

		CREATE TABLE IF NOT EXISTS gateway_events (
			id                  INTEGER PRIMARY KEY AUTOINCREMENT,
			request_id          TEXT NOT NULL,
			trace_id            TEXT,
			client_id           TEXT,
			target_id           TEXT,
			method              TEXT,
			event_kind          TEXT NOT NULL,
			decision            TEXT,
			deny_reason         TEXT,
			status_code         INTEGER,
			latency_ms          INTEGER,
			upstream_latency_ms INTEGER,
			error               TEXT,
			metadata_json       TEXT,
			ts                  INTEGER NOT NULL
		);
		CREATE INDEX IF NOT EXISTS idx_gateway_events_request ON gateway_events(request_id);
		CREATE INDEX IF NOT EXISTS idx_gateway_events_ts ON gateway_events(ts);
		"#,
	)?;

	conn.pragma_update(None, "user_version", EVENTS_SCHEMA_VERSION)?;
	Ok(())
}

pub fn migrate_agent_cache(conn: &Connection) -> Result<()> {
	let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
	if version >= AGENT_CACHE_SCHEMA_VERSION {
		return Ok(());
	}

	conn.execute_batch(
		r#"
		CREATE TABLE IF NOT EXISTS agent_cards (
			target_id   TEXT PRIMARY KEY,
			card_json   TEXT NOT NULL,
			hash        TEXT NOT NULL,
			fetched_at  INTEGER NOT NULL,
			expires_at  INTEGER NOT NULL
		);
		"#,
	)?;

	conn.pragma_update(None, "user_version", AGENT_CACHE_SCHEMA_VERSION)?;
	Ok(())
}
