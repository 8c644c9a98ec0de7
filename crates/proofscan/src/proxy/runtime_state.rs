//! In-memory runtime state snapshot (§3 `RuntimeState`, §4.7): the shape the
//! proxy periodically serializes to `runtime_state.json` and that status
//! consumers read to judge liveness without talking to the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyRunState {
	Starting,
	Running,
	Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStateInfo {
	pub pid: u32,
	pub mode: String,
	pub state: ProxyRunState,
	pub started_at: i64,
	pub heartbeat: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRuntimeInfo {
	pub id: String,
	pub healthy: bool,
	pub tool_count: usize,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRuntimeInfo {
	pub name: String,
	pub last_seen: i64,
	pub sessions: u64,
	pub tool_calls: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingRuntimeInfo {
	pub level: String,
	pub buffered_lines: usize,
	pub max_lines: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
	pub proxy: ProxyStateInfo,
	pub connectors: Vec<ConnectorRuntimeInfo>,
	pub clients: HashMap<String, ClientRuntimeInfo>,
	pub logging: LoggingRuntimeInfo,
}

impl RuntimeState {
	/// A consumer's liveness check: the recorded pid must still be running
	/// (checked by the caller, since that's OS-specific) and the heartbeat
	/// must be fresher than `staleness_threshold_ms`.
	pub fn is_heartbeat_fresh(&self, now_ms: i64, staleness_threshold_ms: i64) -> bool {
		now_ms.saturating_sub(self.proxy.heartbeat) < staleness_threshold_ms
	}
}

/// Mutable, in-process accumulator that the proxy updates as it runs;
/// `snapshot()` produces the immutable [`RuntimeState`] that gets serialized.
pub struct RuntimeStateTracker {
	mode: String,
	started_at: i64,
	state: Mutex<ProxyRunState>,
	heartbeat: AtomicI64,
	connectors: Mutex<Vec<ConnectorRuntimeInfo>>,
	clients: Mutex<HashMap<String, ClientRuntimeInfo>>,
	logging: Mutex<LoggingRuntimeInfo>,
}

impl RuntimeStateTracker {
	pub fn new(mode: impl Into<String>, started_at: i64, max_log_lines: usize) -> Self {
		Self {
			mode: mode.into(),
			started_at,
			state: Mutex::new(ProxyRunState::Starting),
			heartbeat: AtomicI64::new(started_at),
			connectors: Mutex::new(Vec::new()),
			clients: Mutex::new(HashMap::new()),
			logging: Mutex::new(LoggingRuntimeInfo { level: "info".to_string(), buffered_lines: 0, max_lines: max_log_lines }),
		}
	}

	pub fn set_state(&self, state: ProxyRunState) {
		*self.state.lock() = state;
	}

	pub fn heartbeat(&self, now_ms: i64) {
		self.heartbeat.store(now_ms, Ordering::SeqCst);
	}

	pub fn set_connectors(&self, connectors: Vec<ConnectorRuntimeInfo>) {
		*self.connectors.lock() = connectors;
	}

	pub fn touch_client(&self, client_id: &str, now_ms: i64, new_session: bool, tool_call: bool) {
		let mut clients = self.clients.lock();
		let entry = clients.entry(client_id.to_string()).or_insert_with(|| ClientRuntimeInfo {
			name: client_id.to_string(),
			last_seen: now_ms,
			sessions: 0,
			tool_calls: 0,
		});
		entry.last_seen = now_ms;
		if new_session {
			entry.sessions += 1;
		}
		if tool_call {
			entry.tool_calls += 1;
		}
	}

	pub fn snapshot(&self, pid: u32) -> RuntimeState {
		RuntimeState {
			proxy: ProxyStateInfo {
				pid,
				mode: self.mode.clone(),
				state: *self.state.lock(),
				started_at: self.started_at,
				heartbeat: self.heartbeat.load(Ordering::SeqCst),
			},
			connectors: self.connectors.lock().clone(),
			clients: self.clients.lock().clone(),
			logging: self.logging.lock().clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_heartbeat_is_alive() {
		let tracker = RuntimeStateTracker::new("stdio", 0, 500);
		tracker.heartbeat(1_000);
		let snapshot = tracker.snapshot(123);
		assert!(snapshot.is_heartbeat_fresh(1_100, 5_000));
	}

	#[test]
	fn stale_heartbeat_is_not_alive() {
		let tracker = RuntimeStateTracker::new("stdio", 0, 500);
		tracker.heartbeat(1_000);
		let snapshot = tracker.snapshot(123);
		assert!(!snapshot.is_heartbeat_fresh(30_000, 5_000));
	}

	#[test]
	fn touch_client_accumulates_counts() {
		let tracker = RuntimeStateTracker::new("stdio", 0, 500);
		tracker.touch_client("ide-a", 10, true, false);
		tracker.touch_client("ide-a", 20, false, true);
		let snapshot = tracker.snapshot(1);
		let client = &snapshot.clients["ide-a"];
		assert_eq!(client.sessions, 1);
		assert_eq!(client.tool_calls, 1);
		assert_eq!(client.last_seen, 20);
	}
}
