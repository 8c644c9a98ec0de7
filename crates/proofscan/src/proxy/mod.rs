//! MCP aggregating proxy (§4.7): exposes N backend connectors as one MCP
//! endpoint behind tool-name namespacing, a per-connector queue, a hot
//! reload path, and a local IPC socket.

pub mod ipc;
pub mod runtime_state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConnectorConfig, TransportSpec};
use crate::queue::{EnqueueError, QueueManager};
use crate::recorder::SessionRecorder;
use crate::store::{Direction, ExitReason, Stores};
use crate::transport::stdio::{StdioConnectorSpec, StdioTransport};
use crate::transport::{McpTransport, TransportError};
use runtime_state::{ConnectorRuntimeInfo, ProxyRunState, RuntimeStateTracker};

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("unknown connector or tool prefix in `{0}`")]
	UnknownTarget(String),
	#[error("connector `{0}` declares duplicate tool name `{1}`")]
	DuplicateToolName(String, String),
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),
	#[error("request was rejected by the connector queue: {0}")]
	Queue(#[from] EnqueueError<TransportError>),
	#[error("missing required `name` parameter for `{0}`")]
	MissingName(String),
}

/// One live backend: its spawned transport, its own queue, and a
/// lazily-populated, cached `initialize` result.
pub struct ConnectorEntry {
	pub config: ConnectorConfig,
	pub transport: Arc<dyn McpTransport>,
	pub queue: Arc<crate::queue::ConnectorQueue>,
	initialize_result: OnceCell<Result<Value, String>>,
	cached_tool_names: Mutex<Vec<String>>,
}

impl ConnectorEntry {
	/// Runs `initialize` against the backend at most once; later callers
	/// observe the cached outcome, per the "initialized lazily on first use,
	/// cached" rule.
	async fn ensure_initialized(&self) -> Result<Value, String> {
		self.initialize_result
			.get_or_init(|| async {
				self.transport
					.call("initialize", None, self.config.timeout)
					.await
					.map_err(|e| e.to_string())
			})
			.await
			.clone()
	}
}

pub struct ConnectorTable {
	pub entries: Vec<Arc<ConnectorEntry>>,
}

impl ConnectorTable {
	pub fn empty() -> Self {
		Self { entries: Vec::new() }
	}

	fn find(&self, id: &str) -> Option<&Arc<ConnectorEntry>> {
		self.entries.iter().find(|e| e.config.id == id)
	}

	/// Splits a namespaced tool/resource/prompt name into `(connector,
	/// unprefixed name)` using the configured separator.
	fn split_prefixed<'a>(&self, name: &'a str, separator: &str) -> Option<(&Arc<ConnectorEntry>, &'a str)> {
		self.entries.iter().find_map(|e| {
			let prefix = format!("{}{}", e.config.id, separator);
			name.strip_prefix(prefix.as_str()).map(|rest| (e, rest))
		})
	}
}

/// Spawns a transport for one connector config. `rpc-http` and `rpc-sse` are
/// distinct wire transports (§3 "Connector / Target"): an `rpc-sse`
/// connector's tool calls are answered over an SSE stream and correlated by
/// `id`, the same streaming surface `transport::sse` gives the A2A client,
/// so it is routed through [`crate::transport::sse::SseTransport`] rather
/// than collapsed into the plain-HTTP transport.
pub(crate) async fn spawn_transport(connector: &ConnectorConfig) -> Result<Arc<dyn McpTransport>, ProxyError> {
	match &connector.transport {
		TransportSpec::Stdio { command, args, env, cwd } => {
			let spec = StdioConnectorSpec {
				command: command.clone(),
				args: args.clone(),
				env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
				cwd: cwd.clone(),
				startup_grace: Duration::from_millis(200),
				kill_grace: Duration::from_secs(5),
			};
			Ok(StdioTransport::spawn(spec).await?)
		},
		TransportSpec::RpcHttp { url } => Ok(Arc::new(crate::transport::http::HttpTransport::new(url.clone(), Duration::from_secs(10))?)),
		TransportSpec::RpcSse { url } => Ok(Arc::new(crate::transport::sse::SseTransport::new(url.clone(), Duration::from_secs(10)))),
	}
}

async fn build_table(config: &Config, queue_manager: &QueueManager) -> ConnectorTable {
	let mut entries = Vec::new();
	for connector in &config.connectors {
		if !connector.enabled {
			continue;
		}
		match spawn_transport(connector).await {
			Ok(transport) => {
				let queue = queue_manager.register(&connector.id, connector.max_inflight, connector.max_queue_depth);
				entries.push(Arc::new(ConnectorEntry {
					config: connector.clone(),
					transport,
					queue,
					initialize_result: OnceCell::new(),
					cached_tool_names: Mutex::new(Vec::new()),
				}));
			},
			Err(e) => {
				tracing::warn!(connector = %connector.id, error = %e, "proxy: failed to start connector, it will be absent from the aggregate");
			},
		}
	}
	ConnectorTable { entries }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReloadReport {
	pub reloaded_connectors: Vec<String>,
	pub failed_connectors: Vec<(String, String)>,
}

pub struct ProxyServer {
	stores: Stores,
	recorder: Arc<SessionRecorder>,
	queue_manager: Arc<QueueManager>,
	config: Mutex<Arc<Config>>,
	table: ArcSwap<ConnectorTable>,
	reload_lock: tokio::sync::Mutex<()>,
	pub runtime: RuntimeStateTracker,
	runtime_state_path: PathBuf,
	namespace_separator: String,
	proxy_session_id: Mutex<Option<String>>,
	cancel: CancellationToken,
}

impl ProxyServer {
	pub async fn start(
		config: Arc<Config>,
		stores: Stores,
		recorder: Arc<SessionRecorder>,
		queue_manager: Arc<QueueManager>,
	) -> Arc<Self> {
		let table = build_table(&config, &queue_manager).await;
		let namespace_separator = config.proxy.namespace_separator.clone();
		let runtime_state_path = config.proxy.runtime_state_path.clone();
		let now = proofscan_core::ids::now_ms();
		let runtime = RuntimeStateTracker::new("stdio", now, 2_000);
		runtime.set_connectors(table.entries.iter().map(|e| ConnectorRuntimeInfo {
			id: e.config.id.clone(),
			healthy: true,
			tool_count: 0,
			error: None,
		}).collect());
		runtime.set_state(ProxyRunState::Running);

		let proxy_session = stores.create_session("proxy").ok().map(|s| s.session_id);

		let server = Arc::new(Self {
			stores,
			recorder,
			queue_manager,
			config: Mutex::new(config),
			table: ArcSwap::from_pointee(table),
			reload_lock: tokio::sync::Mutex::new(()),
			runtime,
			runtime_state_path,
			namespace_separator,
			proxy_session_id: Mutex::new(proxy_session),
			cancel: CancellationToken::new(),
		});
		server.clone().spawn_heartbeat_task();
		server
	}

	fn spawn_heartbeat_task(self: Arc<Self>) {
		let interval = self.config.lock().proxy.heartbeat_interval;
		let cancel = self.cancel.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(interval) => {},
					_ = cancel.cancelled() => return,
				}
				self.runtime.heartbeat(proofscan_core::ids::now_ms());
				let snapshot = self.runtime.snapshot(std::process::id());
				if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
					if let Err(e) = crate::store::snapshot::atomic_write(&self.runtime_state_path, &bytes) {
						tracing::warn!(error = %e, "proxy: failed to publish runtime state");
					}
				}
			}
		});
	}

	/// Dispatches one external request. `client_id` identifies the calling
	/// client for the per-client runtime-state counters.
	pub async fn dispatch(&self, client_id: &str, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
		self.runtime.touch_client(client_id, proofscan_core::ids::now_ms(), false, method == "tools/call");

		let session_id = self.proxy_session_id.lock().clone();
		if let Some(session_id) = &session_id {
			self.recorder.record(
				session_id,
				Direction::ClientToServer,
				&crate::transport::Frame::Request(crate::transport::jsonrpc::JsonRpcRequest {
					id: crate::transport::jsonrpc::RpcId::String(proofscan_core::ids::new_id()),
					method: method.to_string(),
					params: params.clone(),
				}),
				None,
			);
		}

		let result = match method {
			"initialize" => Ok(self.aggregated_capabilities()),
			"tools/list" => self.fan_out_list("tools/list", "tools").await,
			"resources/list" => self.fan_out_list("resources/list", "resources").await,
			"prompts/list" => self.fan_out_list("prompts/list", "prompts").await,
			"tools/call" | "resources/read" | "prompts/get" => self.route_named_call(method, params).await,
			other => Err(ProxyError::UnknownTarget(other.to_string())),
		};
		result
	}

	fn aggregated_capabilities(&self) -> Value {
		serde_json::json!({
			"protocolVersion": "2024-11-05",
			"capabilities": {"tools": {"listChanged": true}, "resources": {"listChanged": true}, "prompts": {"listChanged": true}},
			"serverInfo": {"name": "proofscan-proxy", "version": env!("CARGO_PKG_VERSION")},
		})
	}

	async fn fan_out_list(&self, method: &str, items_key: &str) -> Result<Value, ProxyError> {
		let table = self.table.load_full();
		let mut aggregated = Vec::new();
		for entry in &table.entries {
			if let Err(e) = entry.ensure_initialized().await {
				tracing::warn!(connector = %entry.config.id, error = %e, "proxy: backend failed to initialize, contributing nothing to {method}");
				continue;
			}
			match entry.transport.call(method, None, entry.config.timeout).await {
				Ok(value) => {
					let items = value.get(items_key).and_then(Value::as_array).cloned().unwrap_or_default();
					if let Err(e) = self.check_no_duplicate_names(&entry.config.id, &items) {
						tracing::warn!(connector = %entry.config.id, error = %e, "proxy: dropping connector's listing, fatal naming collision");
						continue;
					}
					let mut names = Vec::with_capacity(items.len());
					for item in items {
						if let Value::Object(mut obj) = item {
							if let Some(Value::String(name)) = obj.get("name").cloned() {
								names.push(name.clone());
								obj.insert("name".to_string(), Value::String(format!("{}{}{}", entry.config.id, self.namespace_separator, name)));
							}
							aggregated.push(Value::Object(obj));
						}
					}
					*entry.cached_tool_names.lock() = names;
				},
				Err(e) => {
					tracing::warn!(connector = %entry.config.id, error = %e, "proxy: backend failed to answer {method}");
				},
			}
		}
		Ok(serde_json::json!({ items_key: aggregated }))
	}

	fn check_no_duplicate_names(&self, connector_id: &str, items: &[Value]) -> Result<(), ProxyError> {
		let mut seen = std::collections::HashSet::new();
		for item in items {
			if let Some(name) = item.get("name").and_then(Value::as_str)
				&& !seen.insert(name.to_string())
			{
				return Err(ProxyError::DuplicateToolName(connector_id.to_string(), name.to_string()));
			}
		}
		Ok(())
	}

	async fn route_named_call(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
		let params = params.unwrap_or(Value::Null);
		let name = params
			.get("name")
			.or_else(|| params.get("uri"))
			.and_then(Value::as_str)
			.ok_or_else(|| ProxyError::MissingName(method.to_string()))?
			.to_string();

		let table = self.table.load_full();
		let Some((entry, unprefixed)) = table.split_prefixed(&name, &self.namespace_separator) else {
			return Err(ProxyError::UnknownTarget(name));
		};

		entry.ensure_initialized().await.map_err(TransportError::Protocol)?;

		let mut rewritten = Map::new();
		if let Value::Object(obj) = &params {
			rewritten = obj.clone();
		}
		let key = if params.get("name").is_some() { "name" } else { "uri" };
		rewritten.insert(key.to_string(), Value::String(unprefixed.to_string()));

		let transport = entry.transport.clone();
		let method = method.to_string();
		let timeout = entry.config.timeout;
		let outcome = entry
			.queue
			.enqueue(timeout, move |_cancel| {
				let transport = transport.clone();
				let method = method.clone();
				async move { transport.call(&method, Some(Value::Object(rewritten)), timeout).await }
			})
			.await?;
		Ok(outcome.result)
	}

	/// Hot reload, per the seven-step ordering: snapshot, load, diff, close
	/// removed/changed, spawn added/changed, atomic swap, publish state.
	pub async fn reload(&self, new_config: Arc<Config>) -> ReloadReport {
		let _guard = self.reload_lock.lock().await;
		let old_config = self.config.lock().clone();
		let old_table = self.table.load_full();

		let mut report = ReloadReport::default();
		let new_ids: std::collections::HashSet<_> = new_config.connectors.iter().filter(|c| c.enabled).map(|c| c.id.clone()).collect();

		for old_entry in &old_table.entries {
			let changed_or_removed = new_config
				.connector(&old_entry.config.id)
				.map(|c| !c.enabled || connector_transport_changed(c, &old_entry.config))
				.unwrap_or(true);
			if changed_or_removed {
				self.queue_manager.drain(&old_entry.config.id);
				old_entry.transport.close().await;
			}
		}

		let mut new_entries = Vec::new();
		for old_entry in &old_table.entries {
			let keep = new_ids.contains(&old_entry.config.id)
				&& new_config.connector(&old_entry.config.id).map(|c| !connector_transport_changed(c, &old_entry.config)).unwrap_or(false);
			if keep {
				new_entries.push(old_entry.clone());
			}
		}

		for connector in new_config.connectors.iter().filter(|c| c.enabled) {
			if new_entries.iter().any(|e| e.config.id == connector.id) {
				continue;
			}
			match spawn_transport(connector).await {
				Ok(transport) => {
					let queue = self.queue_manager.register(&connector.id, connector.max_inflight, connector.max_queue_depth);
					let entry = Arc::new(ConnectorEntry {
						config: connector.clone(),
						transport,
						queue,
						initialize_result: OnceCell::new(),
						cached_tool_names: Mutex::new(Vec::new()),
					});
					if let Err(e) = entry.ensure_initialized().await {
						report.failed_connectors.push((connector.id.clone(), e));
						continue;
					}
					report.reloaded_connectors.push(connector.id.clone());
					new_entries.push(entry);
				},
				Err(e) => report.failed_connectors.push((connector.id.clone(), e.to_string())),
			}
		}

		self.runtime.set_connectors(new_entries.iter().map(|e| ConnectorRuntimeInfo {
			id: e.config.id.clone(),
			healthy: true,
			tool_count: e.cached_tool_names.lock().len(),
			error: None,
		}).collect());
		for (id, error) in &report.failed_connectors {
			let mut connectors = self.runtime.snapshot(0).connectors;
			connectors.push(ConnectorRuntimeInfo { id: id.clone(), healthy: false, tool_count: 0, error: Some(error.clone()) });
			self.runtime.set_connectors(connectors);
		}

		self.table.store(Arc::new(ConnectorTable { entries: new_entries }));
		*self.config.lock() = new_config;
		let _ = old_config;

		let snapshot = self.runtime.snapshot(std::process::id());
		if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
			let _ = crate::store::snapshot::atomic_write(&self.runtime_state_path, &bytes);
		}

		report
	}

	pub fn status(&self) -> Value {
		serde_json::to_value(self.runtime.snapshot(std::process::id())).unwrap_or(Value::Null)
	}

	/// Drains every connector queue, closes every transport, and ends the
	/// proxy's own session — the shutdown half of the IPC `stop` command.
	pub async fn shutdown(&self) {
		self.runtime.set_state(ProxyRunState::Stopping);
		self.cancel.cancel();
		self.queue_manager.shutdown_all();
		for entry in &self.table.load_full().entries {
			entry.transport.close().await;
		}
		if let Some(session_id) = self.proxy_session_id.lock().clone() {
			let _ = self.stores.end_session(&session_id, ExitReason::Normal);
		}
	}
}

fn connector_transport_changed(a: &ConnectorConfig, b: &ConnectorConfig) -> bool {
	format!("{:?}", a.transport) != format!("{:?}", b.transport)
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use async_trait::async_trait;
	use tempfile::tempdir;

	use super::*;
	use crate::config::{AgentTargetConfig, AuthMode, GatewayConfig, PayloadRetention, RecorderConfig};
	use crate::transport::Result as TransportResult;

	/// A fake backend whose `tools/list` answer and id are fixed at
	/// construction, used to drive the proxy's namespacing and dispatch
	/// logic without spawning a real subprocess.
	struct FakeBackend {
		server_name: &'static str,
		tools: Vec<&'static str>,
	}

	#[async_trait]
	impl McpTransport for FakeBackend {
		async fn call(&self, method: &str, params: Option<Value>, _timeout: Duration) -> TransportResult<Value> {
			match method {
				"initialize" => Ok(serde_json::json!({"serverInfo": {"name": self.server_name}})),
				"tools/list" => {
					let tools: Vec<Value> = self.tools.iter().map(|t| serde_json::json!({"name": t})).collect();
					Ok(serde_json::json!({"tools": tools}))
				},
				"tools/call" => Ok(serde_json::json!({"serverInfo": {"name": self.server_name}, "params": params})),
				other => Err(TransportError::Protocol(format!("unhandled method {other}"))),
			}
		}
		async fn notify(&self, _method: &str, _params: Option<Value>) -> TransportResult<()> {
			Ok(())
		}
		async fn close(&self) {}
	}

	fn connector_config(id: &str) -> ConnectorConfig {
		ConnectorConfig {
			id: id.to_string(),
			transport: TransportSpec::Stdio { command: "unused".to_string(), args: vec![], env: BTreeMap::new(), cwd: None },
			enabled: true,
			max_inflight: 4,
			max_queue_depth: 8,
			timeout: Duration::from_secs(5),
		}
	}

	fn empty_config(dir: &std::path::Path) -> Config {
		Config {
			config_dir: dir.to_path_buf(),
			connectors: Vec::new(),
			agents: Vec::<AgentTargetConfig>::new(),
			gateway: GatewayConfig {
				bind_addr: "127.0.0.1:0".to_string(),
				auth_mode: AuthMode::None,
				tokens: Vec::new(),
				body_cap_bytes: 1024 * 1024,
				hide_not_found: false,
				default_timeout: Duration::from_secs(5),
				rate_limit_per_minute: None,
			},
			proxy: crate::config::ProxyConfig {
				namespace_separator: "__".to_string(),
				ipc_socket_path: dir.join("proxy.sock"),
				runtime_state_path: dir.join("runtime_state.json"),
				heartbeat_interval: Duration::from_secs(5),
				staleness_threshold: Duration::from_secs(20),
			},
			recorder: RecorderConfig { max_event_payload_bytes: 64 * 1024, default_retention: PayloadRetention::Full },
			logging: Default::default(),
		}
	}

	/// Builds a `ProxyServer` wired directly to `backends` (bypassing
	/// `spawn_transport`, which only knows how to start real subprocesses
	/// and HTTP clients) so dispatch logic can be exercised against fakes.
	fn server_with_backends(dir: &std::path::Path, backends: Vec<(&str, FakeBackend)>) -> (Arc<ProxyServer>, Arc<QueueManager>) {
		let stores = Stores::open(dir).unwrap();
		let recorder = Arc::new(SessionRecorder::new(
			stores.clone(),
			RecorderConfig { max_event_payload_bytes: 64 * 1024, default_retention: PayloadRetention::Full },
		));
		let queue_manager = Arc::new(QueueManager::new());
		let mut entries = Vec::new();
		for (id, backend) in backends {
			let queue = queue_manager.register(id, 4, 8);
			entries.push(Arc::new(ConnectorEntry {
				config: connector_config(id),
				transport: Arc::new(backend),
				queue,
				initialize_result: OnceCell::new(),
				cached_tool_names: Mutex::new(Vec::new()),
			}));
		}
		let config = Arc::new(empty_config(dir));
		let runtime = RuntimeStateTracker::new("stdio", 0, 200);
		runtime.set_state(ProxyRunState::Running);
		let server = Arc::new(ProxyServer {
			stores,
			recorder,
			queue_manager: queue_manager.clone(),
			config: Mutex::new(config),
			table: ArcSwap::from_pointee(ConnectorTable { entries }),
			reload_lock: tokio::sync::Mutex::new(()),
			runtime,
			runtime_state_path: dir.join("runtime_state.json"),
			namespace_separator: "__".to_string(),
			proxy_session_id: Mutex::new(None),
			cancel: CancellationToken::new(),
		});
		(server, queue_manager)
	}

	#[tokio::test]
	async fn tools_list_is_namespaced_by_connector_id() {
		let dir = tempdir().unwrap();
		let (server, _queues) = server_with_backends(
			dir.path(),
			vec![("alpha", FakeBackend { server_name: "alpha-srv", tools: vec!["read_file"] })],
		);
		let result = server.dispatch("client-a", "tools/list", None).await.unwrap();
		let tools = result.get("tools").and_then(Value::as_array).unwrap();
		assert_eq!(tools.len(), 1);
		assert_eq!(tools[0].get("name").and_then(Value::as_str), Some("alpha__read_file"));
	}

	#[tokio::test]
	async fn two_connectors_with_colliding_rpc_ids_stay_isolated() {
		// Two independent sessions whose own rpc_id both equal "1" must not
		// be confused with each other: each connector answers with its own
		// serverInfo.name, keyed by its own namespace prefix (§8 scenario 5).
		let dir = tempdir().unwrap();
		let (server, _queues) = server_with_backends(
			dir.path(),
			vec![
				("a", FakeBackend { server_name: "server-a", tools: vec!["run"] }),
				("b", FakeBackend { server_name: "server-b", tools: vec!["run"] }),
			],
		);
		let call_a = server
			.dispatch("client-a", "tools/call", Some(serde_json::json!({"name": "a__run"})))
			.await
			.unwrap();
		let call_b = server
			.dispatch("client-a", "tools/call", Some(serde_json::json!({"name": "b__run"})))
			.await
			.unwrap();
		assert_eq!(call_a.get("serverInfo").and_then(|v| v.get("name")).and_then(Value::as_str), Some("server-a"));
		assert_eq!(call_b.get("serverInfo").and_then(|v| v.get("name")).and_then(Value::as_str), Some("server-b"));
	}

	#[tokio::test]
	async fn tools_call_strips_the_prefix_before_routing() {
		let dir = tempdir().unwrap();
		let (server, _queues) =
			server_with_backends(dir.path(), vec![("files", FakeBackend { server_name: "files-srv", tools: vec!["read"] })]);
		let result = server
			.dispatch("client-a", "tools/call", Some(serde_json::json!({"name": "files__read", "arguments": {"path": "a.txt"}})))
			.await
			.unwrap();
		let params = result.get("params").unwrap();
		assert_eq!(params.get("name").and_then(Value::as_str), Some("read"));
	}

	#[tokio::test]
	async fn unknown_prefix_is_rejected() {
		let dir = tempdir().unwrap();
		let (server, _queues) =
			server_with_backends(dir.path(), vec![("files", FakeBackend { server_name: "files-srv", tools: vec!["read"] })]);
		let result = server.dispatch("client-a", "tools/call", Some(serde_json::json!({"name": "nope__read"}))).await;
		assert!(matches!(result, Err(ProxyError::UnknownTarget(_))));
	}

	#[tokio::test]
	async fn initialize_returns_aggregated_capabilities_without_touching_backends() {
		let dir = tempdir().unwrap();
		let (server, _queues) =
			server_with_backends(dir.path(), vec![("files", FakeBackend { server_name: "files-srv", tools: vec!["read"] })]);
		let result = server.dispatch("client-a", "initialize", None).await.unwrap();
		assert_eq!(result.get("serverInfo").and_then(|v| v.get("name")).and_then(Value::as_str), Some("proofscan-proxy"));
	}

	#[test]
	fn duplicate_tool_names_within_one_connector_are_rejected() {
		let dir = tempdir().unwrap();
		let (server, _queues) =
			server_with_backends(dir.path(), vec![("files", FakeBackend { server_name: "files-srv", tools: vec!["read"] })]);
		let items = vec![serde_json::json!({"name": "read"}), serde_json::json!({"name": "read"})];
		let err = server.check_no_duplicate_names("files", &items).unwrap_err();
		assert!(matches!(err, ProxyError::DuplicateToolName(connector, tool) if connector == "files" && tool == "read"));
	}

	#[tokio::test]
	async fn hot_reload_adds_and_removes_connectors_without_disturbing_untouched_ones() {
		let dir = tempdir().unwrap();
		let (server, queues) = server_with_backends(
			dir.path(),
			vec![
				("x", FakeBackend { server_name: "x-srv", tools: vec!["run"] }),
				("y", FakeBackend { server_name: "y-srv", tools: vec!["run"] }),
			],
		);
		assert!(queues.get("x").is_some());
		assert!(queues.get("y").is_some());

		// Removing "x" and leaving "y" untouched should drain x's queue and
		// leave y's alone; "z" can't actually be spawned here (its command
		// is fake), so it lands in `failed_connectors` rather than
		// `reloaded_connectors` — which is exactly the per-connector-failure
		// contract the reload report exists to surface.
		let mut new_config = empty_config(dir.path());
		new_config.connectors = vec![
			{
				let mut c = connector_config("y");
				c.timeout = Duration::from_secs(5);
				c
			},
            connector_config("z"),
		];
		let report = server.reload(Arc::new(new_config)).await;

		assert!(queues.get("x").is_none(), "x's queue must be drained on removal");
		assert!(queues.get("y").is_some(), "y must be left running");
		assert!(report.failed_connectors.iter().any(|(id, _)| id == "z"));

		let listing = server.dispatch("client-a", "tools/list", None).await.unwrap();
		let names: Vec<&str> =
			listing.get("tools").and_then(Value::as_array).unwrap().iter().filter_map(|t| t.get("name").and_then(Value::as_str)).collect();
		assert!(names.iter().any(|n| n.starts_with("y__")));
		assert!(!names.iter().any(|n| n.starts_with("x__")));
	}
}
