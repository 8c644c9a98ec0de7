//! Stdio connector transport (§4.2): spawns a child process, frames
//! line-delimited JSON over its stdout/stdin, multiplexes requests by id,
//! and surfaces stderr as transport events.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::jsonrpc::{self, Frame, JsonRpcNotification, JsonRpcResponse, RpcId};
use super::{McpTransport, Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Starting,
	Ready,
	Closing,
	Closed,
	Failed,
}

#[derive(Debug, Clone)]
pub struct StdioConnectorSpec {
	pub command: String,
	pub args: Vec<String>,
	/// Already secret-resolved key/value pairs to add to the child's
	/// environment.
	pub env: Vec<(String, String)>,
	pub cwd: Option<std::path::PathBuf>,
	pub startup_grace: Duration,
	pub kill_grace: Duration,
}

/// A transport-level event (stderr line, lifecycle transition, framing
/// error) that the session recorder turns into a `transport_event` row.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	Stderr(String),
	StateChanged(ConnState),
	FramingError(String),
}

pub struct StdioTransport {
	state: parking_lot::Mutex<ConnState>,
	pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
	next_id: AtomicU64,
	writer_tx: mpsc::UnboundedSender<String>,
	notifications: broadcast::Sender<JsonRpcNotification>,
	events: broadcast::Sender<TransportEvent>,
	cancel: CancellationToken,
	child: tokio::sync::Mutex<Child>,
	kill_grace: Duration,
}

impl StdioTransport {
	pub async fn spawn(spec: StdioConnectorSpec) -> Result<Arc<Self>> {
		let mut cmd = Command::new(&spec.command);
		cmd.args(&spec.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		for (k, v) in &spec.env {
			cmd.env(k, v);
		}
		if let Some(cwd) = &spec.cwd {
			cmd.current_dir(cwd);
		}

		let mut child = cmd.spawn().map_err(TransportError::Spawn)?;
		let stdin = child.stdin.take().expect("piped stdin");
		let stdout = child.stdout.take().expect("piped stdout");
		let stderr = child.stderr.take().expect("piped stderr");

		let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
		let (notif_tx, _) = broadcast::channel(256);
		let (events_tx, _) = broadcast::channel(256);
		let cancel = CancellationToken::new();

		let transport = Arc::new(Self {
			state: parking_lot::Mutex::new(ConnState::Starting),
			pending: DashMap::new(),
			next_id: AtomicU64::new(1),
			writer_tx,
			notifications: notif_tx,
			events: events_tx,
			cancel: cancel.clone(),
			child: tokio::sync::Mutex::new(child),
			kill_grace: spec.kill_grace,
		});

		spawn_writer_task(stdin, writer_rx);
		spawn_reader_task(transport.clone(), stdout);
		spawn_stderr_task(transport.clone(), stderr);

		let ready = transport.clone();
		tokio::spawn(async move {
			tokio::time::sleep(spec.startup_grace).await;
			let mut state = ready.state.lock();
			if *state == ConnState::Starting {
				*state = ConnState::Ready;
				let _ = ready.events.send(TransportEvent::StateChanged(ConnState::Ready));
			}
		});

		Ok(transport)
	}

	pub fn state(&self) -> ConnState {
		*self.state.lock()
	}

	fn mark_ready_on_first_frame(&self) {
		let mut state = self.state.lock();
		if *state == ConnState::Starting {
			*state = ConnState::Ready;
			let _ = self.events.send(TransportEvent::StateChanged(ConnState::Ready));
		}
	}

	fn fail(&self, reason: &str) {
		let mut state = self.state.lock();
		if !matches!(*state, ConnState::Closed | ConnState::Failed) {
			*state = ConnState::Failed;
			let _ = self.events.send(TransportEvent::StateChanged(ConnState::Failed));
			warn!(reason, "stdio connector transport failed");
		}
		drop(state);
		self.fail_all_pending();
	}

	fn fail_all_pending(&self) {
		// Dropping each sender (via `clear`) makes every waiting `oneshot::Receiver`
		// observe a closed channel, which `call()` maps to `TransportError::Closed`.
		self.pending.clear();
	}

	pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcNotification> {
		self.notifications.subscribe()
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
		self.events.subscribe()
	}

	fn on_frame(&self, frame: Frame) {
		self.mark_ready_on_first_frame();
		match frame {
			Frame::Response(resp) => {
				if let Some((_, tx)) = self.pending.remove(&resp.id.as_str()) {
					let _ = tx.send(resp);
				} else {
					debug!(id = %resp.id.as_str(), "response for unknown or already-completed rpc id");
				}
			},
			Frame::Notification(n) => {
				let _ = self.notifications.send(n);
			},
			Frame::Request(_) => {
				// Backends do not send requests to us over this transport in
				// ProofScan's topology; treat as an unexpected frame.
				let _ = self.events.send(TransportEvent::FramingError(
					"unexpected request frame from backend".to_string(),
				));
			},
			Frame::Unknown(raw) => {
				let _ = self
					.events
					.send(TransportEvent::FramingError(format!("unparseable frame: {raw}")));
			},
		}
	}

	pub async fn close(&self) {
		{
			let mut state = self.state.lock();
			if matches!(*state, ConnState::Closing | ConnState::Closed) {
				return;
			}
			*state = ConnState::Closing;
			let _ = self.events.send(TransportEvent::StateChanged(ConnState::Closing));
		}
		self.cancel.cancel();
		self.fail_all_pending();

		let mut child = self.child.lock().await;
		#[cfg(unix)]
		{
			use nix_sigterm::send_sigterm;
			send_sigterm(&child);
		}
		let waited = tokio::time::timeout(self.kill_grace, child.wait()).await;
		if waited.is_err() {
			let _ = child.start_kill();
			let _ = child.wait().await;
		}
		let mut state = self.state.lock();
		*state = ConnState::Closed;
		let _ = self.events.send(TransportEvent::StateChanged(ConnState::Closed));
	}
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
	async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
		if self.state() == ConnState::Failed || self.state() == ConnState::Closed {
			return Err(TransportError::Closed);
		}
		let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) as i64);
		let (tx, rx) = oneshot::channel();
		self.pending.insert(id.as_str(), tx);

		let line = jsonrpc::encode_request(&id, method, params);
		if self.writer_tx.send(line).is_err() {
			self.pending.remove(&id.as_str());
			return Err(TransportError::Closed);
		}

		let response = tokio::select! {
			r = rx => r.map_err(|_| TransportError::Closed)?,
			_ = tokio::time::sleep(timeout) => {
				self.pending.remove(&id.as_str());
				return Err(TransportError::Timeout(timeout));
			}
			_ = self.cancel.cancelled() => {
				self.pending.remove(&id.as_str());
				return Err(TransportError::Closed);
			}
		};

		match response.error {
			Some(e) => Err(TransportError::Protocol(e.message)),
			None => Ok(response.result.unwrap_or(Value::Null)),
		}
	}

	async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
		let line = serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
		self.writer_tx.send(line).map_err(|_| TransportError::Closed)
	}

	async fn close(&self) {
		StdioTransport::close(self).await
	}
}

fn spawn_writer_task(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
	tokio::spawn(async move {
		while let Some(mut line) = rx.recv().await {
			line.push('\n');
			if stdin.write_all(line.as_bytes()).await.is_err() {
				break;
			}
		}
	});
}

fn spawn_reader_task(transport: Arc<StdioTransport>, stdout: tokio::process::ChildStdout) {
	tokio::spawn(async move {
		let mut lines = BufReader::new(stdout).lines();
		let reason = loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					if line.trim().is_empty() {
						continue;
					}
					transport.on_frame(jsonrpc::classify(&line));
				},
				Ok(None) => break "connector process closed stdout",
				Err(e) => {
					let _ = transport.events.send(TransportEvent::FramingError(e.to_string()));
					break "connector process stdout read error";
				},
			}
		};
		// A deliberate `close()` already moved the state to Closing/Closed and
		// failed every pending waiter; skip clobbering that with Failed.
		// Otherwise the backend went away on its own and any still-pending
		// call must not wait out its own timeout to find out.
		if !matches!(transport.state(), ConnState::Closing | ConnState::Closed) {
			transport.fail(reason);
		}
	});
}

fn spawn_stderr_task(transport: Arc<StdioTransport>, stderr: tokio::process::ChildStderr) {
	tokio::spawn(async move {
		let mut lines = BufReader::new(stderr).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			let _ = transport.events.send(TransportEvent::Stderr(line));
		}
	});
}

#[cfg(unix)]
mod nix_sigterm {
	use tokio::process::Child;

	pub fn send_sigterm(child: &Child) {
		if let Some(pid) = child.id() {
			unsafe {
				libc::kill(pid as i32, libc::SIGTERM);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn request_response_roundtrip_over_cat_like_echo_script() {
		// `sh -c` echoing a canned response simulates a backend that answers
		// exactly one request; good enough to exercise the framing and
		// pending-map plumbing without a real MCP server.
		let spec = StdioConnectorSpec {
			command: "sh".to_string(),
			args: vec![
				"-c".to_string(),
				r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#.to_string(),
			],
			env: vec![],
			cwd: None,
			startup_grace: Duration::from_millis(50),
			kill_grace: Duration::from_millis(500),
		};
		let transport = StdioTransport::spawn(spec).await.unwrap();
		let result = transport.call("ping", None, Duration::from_secs(2)).await.unwrap();
		assert_eq!(result, serde_json::json!({"ok": true}));
		transport.close().await;
	}

	#[tokio::test]
	async fn spawn_failure_surfaces_as_transport_error() {
		let spec = StdioConnectorSpec {
			command: "/does/not/exist/binary".to_string(),
			args: vec![],
			env: vec![],
			cwd: None,
			startup_grace: Duration::from_millis(10),
			kill_grace: Duration::from_millis(10),
		};
		let result = StdioTransport::spawn(spec).await;
		assert!(matches!(result, Err(TransportError::Spawn(_))));
	}

	#[tokio::test]
	async fn call_times_out_when_backend_never_responds() {
		let spec = StdioConnectorSpec {
			command: "sh".to_string(),
			args: vec!["-c".to_string(), "sleep 5".to_string()],
			env: vec![],
			cwd: None,
			startup_grace: Duration::from_millis(10),
			kill_grace: Duration::from_millis(200),
		};
		let transport = StdioTransport::spawn(spec).await.unwrap();
		let result = transport.call("ping", None, Duration::from_millis(100)).await;
		assert!(matches!(result, Err(TransportError::Timeout(_))));
		transport.close().await;
	}
}
