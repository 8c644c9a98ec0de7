//! Configuration loading (§4.9, §3 "Configuration model"): a `RawConfig`
//! deserialized straight from TOML, normalized into the `Config` every other
//! component actually operates on, cached behind a TTL with single-flight
//! coalescing so a cold cache under concurrent load only hits disk once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::store::SecretResolver;
use crate::store::snapshot::SnapshotStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
    #[error("duplicate connector id: {0}")]
    DuplicateConnectorId(String),
    #[error("duplicate agent target id: {0}")]
    DuplicateAgentId(String),
    #[error("invalid url for {0}: {1}")]
    InvalidUrl(String, String),
    #[error("invalid timeout for {0}: must be greater than zero")]
    InvalidTimeout(String),
    #[error(transparent)]
    Secret(#[from] crate::store::SecretError),
}

// --- on-disk shape -----------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub connectors: Vec<RawConnector>,
    #[serde(default)]
    pub agents: Vec<RawAgentTarget>,
    #[serde(default)]
    pub gateway: RawGatewayConfig,
    #[serde(default)]
    pub proxy: RawProxyConfig,
    #[serde(default)]
    pub recorder: RawRecorderConfig,
    #[serde(default)]
    pub logging: proofscan_core::telemetry::LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    RpcHttp {
        url: String,
    },
    RpcSse {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConnector {
    pub id: String,
    #[serde(flatten)]
    pub transport: RawTransport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_inflight: Option<usize>,
    pub max_queue_depth: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAgentTarget {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub schema_version: Option<String>,
    pub ttl_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBearerToken {
    /// `sha256:<hex>` or `<name>:sha256:<hex>`, per §6 "Bearer token format".
    pub token: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGatewayConfig {
    pub bind_addr: Option<String>,
    /// `"none"` or `"bearer"`; defaults to `"none"` when unset.
    pub auth_mode: Option<String>,
    #[serde(default)]
    pub tokens: Vec<RawBearerToken>,
    pub body_cap_bytes: Option<usize>,
    pub hide_not_found: Option<bool>,
    pub default_timeout_ms: Option<u64>,
    /// Requests allowed per client per rolling minute; `None` disables the limiter.
    pub rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProxyConfig {
    pub namespace_separator: Option<String>,
    pub ipc_socket_path: Option<PathBuf>,
    pub runtime_state_path: Option<PathBuf>,
    pub heartbeat_interval_ms: Option<u64>,
    pub staleness_threshold_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecorderConfig {
    pub max_event_payload_bytes: Option<usize>,
    /// `"full"` or `"hash_only"`.
    pub default_retention: Option<String>,
}

fn default_true() -> bool {
    true
}

// --- normalized shape ----------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    RpcHttp {
        url: String,
    },
    RpcSse {
        url: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub transport: TransportSpec,
    pub enabled: bool,
    pub max_inflight: usize,
    pub max_queue_depth: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentTargetConfig {
    pub id: String,
    pub url: String,
    pub schema_version: String,
    pub ttl: Duration,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BearerTokenConfig {
    pub name: String,
    pub hash_hex: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthMode {
    None,
    Bearer,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub auth_mode: AuthMode,
    pub tokens: Vec<BearerTokenConfig>,
    pub body_cap_bytes: usize,
    pub hide_not_found: bool,
    pub default_timeout: Duration,
    pub rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub namespace_separator: String,
    pub ipc_socket_path: PathBuf,
    pub runtime_state_path: PathBuf,
    pub heartbeat_interval: Duration,
    pub staleness_threshold: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PayloadRetention {
    Full,
    HashOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderConfig {
    pub max_event_payload_bytes: usize,
    pub default_retention: PayloadRetention,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub config_dir: PathBuf,
    pub connectors: Vec<ConnectorConfig>,
    pub agents: Vec<AgentTargetConfig>,
    pub gateway: GatewayConfig,
    pub proxy: ProxyConfig,
    pub recorder: RecorderConfig,
    pub logging: proofscan_core::telemetry::LoggingConfig,
}

impl Config {
    pub fn connector(&self, id: &str) -> Option<&ConnectorConfig> {
        self.connectors.iter().find(|c| c.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentTargetConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}

/// Parses a `sha256:<hex>` or `<name>:sha256:<hex>` token, assigning
/// `token-<index>` to name-less entries (§6).
fn parse_bearer_token(index: usize, raw: &RawBearerToken) -> Result<BearerTokenConfig, ConfigError> {
    let (name, hash_hex) = if let Some(rest) = raw.token.strip_prefix("sha256:") {
        (format!("token-{index}"), rest.to_string())
    } else if let Some((name, rest)) = raw.token.split_once(":sha256:") {
        (name.to_string(), rest.to_string())
    } else {
        return Err(ConfigError::InvalidUrl(
            "gateway.tokens".to_string(),
            format!("token {index} is not in `sha256:<hex>` or `<name>:sha256:<hex>` form"),
        ));
    };
    Ok(BearerTokenConfig { name, hash_hex: hash_hex.to_lowercase(), permissions: raw.permissions.clone() })
}

fn normalize_transport(connector_id: &str, raw: RawTransport, secrets: &SecretResolver) -> Result<TransportSpec, ConfigError> {
    Ok(match raw {
        RawTransport::Stdio { command, args, env, cwd } => {
            let command = secrets.resolve(&command).map_err(ConfigError::Secret)?;
            let mut resolved_env = BTreeMap::new();
            for (k, v) in env {
                resolved_env.insert(k, secrets.resolve(&v).map_err(ConfigError::Secret)?);
            }
            TransportSpec::Stdio { command, args, env: resolved_env, cwd }
        },
        RawTransport::RpcHttp { url } => {
            validate_url(connector_id, &url)?;
            TransportSpec::RpcHttp { url }
        },
        RawTransport::RpcSse { url } => {
            validate_url(connector_id, &url)?;
            TransportSpec::RpcSse { url }
        },
    })
}

fn validate_url(owner: &str, url: &str) -> Result<(), ConfigError> {
    url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl(owner.to_string(), e.to_string()))?;
    Ok(())
}

/// Turns a user-supplied `RawConfig` into the normalized `Config`, resolving
/// secrets, applying defaults, and validating the invariants called out in
/// §3 (duplicate ids, invalid URLs, non-positive timeouts).
pub fn normalize(raw: RawConfig, config_dir: &Path, secrets: &SecretResolver) -> Result<Config, ConfigError> {
    let mut seen_connectors = std::collections::HashSet::new();
    let mut connectors = Vec::with_capacity(raw.connectors.len());
    for c in raw.connectors {
        if !seen_connectors.insert(c.id.clone()) {
            return Err(ConfigError::DuplicateConnectorId(c.id));
        }
        let timeout_ms = c.timeout_ms.unwrap_or(30_000);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(c.id));
        }
        connectors.push(ConnectorConfig {
            transport: normalize_transport(&c.id, c.transport, secrets)?,
            id: c.id,
            enabled: c.enabled,
            max_inflight: c.max_inflight.unwrap_or(1),
            max_queue_depth: c.max_queue_depth.unwrap_or(32),
            timeout: Duration::from_millis(timeout_ms),
        });
    }

    let mut seen_agents = std::collections::HashSet::new();
    let mut agents = Vec::with_capacity(raw.agents.len());
    for a in raw.agents {
        if !seen_agents.insert(a.id.clone()) {
            return Err(ConfigError::DuplicateAgentId(a.id));
        }
        validate_url(&a.id, &a.url)?;
        agents.push(AgentTargetConfig {
            id: a.id,
            url: a.url,
            schema_version: a.schema_version.unwrap_or_else(|| "0.2".to_string()),
            ttl: Duration::from_secs(a.ttl_seconds.unwrap_or(300)),
            enabled: a.enabled,
        });
    }

    let tokens = raw
        .gateway
        .tokens
        .iter()
        .enumerate()
        .map(|(i, t)| parse_bearer_token(i, t))
        .collect::<Result<Vec<_>, _>>()?;
    let auth_mode = match raw.gateway.auth_mode.as_deref() {
        Some("bearer") => AuthMode::Bearer,
        _ => AuthMode::None,
    };
    let gateway = GatewayConfig {
        bind_addr: raw.gateway.bind_addr.unwrap_or_else(|| "127.0.0.1:8787".to_string()),
        auth_mode,
        tokens,
        body_cap_bytes: raw.gateway.body_cap_bytes.unwrap_or(1024 * 1024),
        hide_not_found: raw.gateway.hide_not_found.unwrap_or(false),
        default_timeout: Duration::from_millis(raw.gateway.default_timeout_ms.unwrap_or(30_000)),
        rate_limit_per_minute: raw.gateway.rate_limit_per_minute,
    };

    let proxy = ProxyConfig {
        namespace_separator: raw.proxy.namespace_separator.unwrap_or_else(|| "__".to_string()),
        ipc_socket_path: raw.proxy.ipc_socket_path.unwrap_or_else(|| config_dir.join("proxy.sock")),
        runtime_state_path: raw.proxy.runtime_state_path.unwrap_or_else(|| config_dir.join("runtime_state.json")),
        heartbeat_interval: Duration::from_millis(raw.proxy.heartbeat_interval_ms.unwrap_or(5_000)),
        staleness_threshold: Duration::from_millis(raw.proxy.staleness_threshold_ms.unwrap_or(20_000)),
    };

    let recorder = RecorderConfig {
        max_event_payload_bytes: raw.recorder.max_event_payload_bytes.unwrap_or(256 * 1024),
        default_retention: match raw.recorder.default_retention.as_deref() {
            Some("hash_only") => PayloadRetention::HashOnly,
            _ => PayloadRetention::Full,
        },
    };

    Ok(Config { config_dir: config_dir.to_path_buf(), connectors, agents, gateway, proxy, recorder, logging: raw.logging })
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), sort_value(v))).collect();
            Value::Object(sorted.into_iter().collect())
        },
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Returns `(pretty display copy, canonical key-sorted bytes)` for hashing
/// and snapshotting, per the config manager's §4.9 design note: the display
/// copy favors readability, the canonical copy favors a stable hash.
pub fn render(config: &Config) -> (String, Vec<u8>) {
    let display = serde_json::to_string_pretty(config).unwrap_or_default();
    let value = serde_json::to_value(config).unwrap_or(Value::Null);
    let canonical = serde_json::to_vec(&sort_value(&value)).unwrap_or_default();
    (display, canonical)
}

// --- cached, coalescing loader --------------------------------------------

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Config>, Arc<ConfigError>>>>;

/// Loads `config.toml` from `config_dir` with a TTL cache and single-flight
/// coalescing: concurrent cold-cache callers all await the same in-flight
/// load instead of each hitting disk (§4.9).
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
    ttl: Duration,
    secrets: SecretResolver,
    cache: RwLock<Option<(Instant, Arc<Config>)>>,
    inflight: Mutex<Option<SharedLoad>>,
    snapshots: SnapshotStore,
}

impl ConfigManager {
    pub fn new(config_dir: impl Into<PathBuf>, secrets: SecretResolver) -> Self {
        let config_dir = config_dir.into();
        let config_path = config_dir.join("config.toml");
        let snapshots = SnapshotStore::new(config_dir.join("snapshots"));
        Self {
            config_path,
            config_dir,
            ttl: Duration::from_secs(5),
            secrets,
            cache: RwLock::new(None),
            inflight: Mutex::new(None),
            snapshots,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn load(&self) -> Result<Arc<Config>, Arc<ConfigError>> {
        if let Some((fetched_at, config)) = &*self.cache.read().await {
            if fetched_at.elapsed() < self.ttl {
                return Ok(config.clone());
            }
        }

        let shared: SharedLoad = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.as_ref() {
                existing.clone()
            } else {
                let path = self.config_path.clone();
                let config_dir = self.config_dir.clone();
                let secrets = self.secrets.clone();
                let snapshots_dir = self.config_dir.join("snapshots");
                let fut: BoxFuture<'static, Result<Arc<Config>, Arc<ConfigError>>> = async move {
                    load_from_disk(&path, &config_dir, &secrets, &snapshots_dir).await.map(Arc::new).map_err(Arc::new)
                }
                .boxed();
                let shared = fut.shared();
                *inflight = Some(shared.clone());
                shared
            }
        };

        let result = shared.await;
        {
            let mut inflight = self.inflight.lock().await;
            *inflight = None;
        }
        if let Ok(config) = &result {
            *self.cache.write().await = Some((Instant::now(), config.clone()));
        }
        result
    }

    /// Discards the cached value; the next `load()` hits disk.
    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }
}

async fn load_from_disk(
    path: &Path,
    config_dir: &Path,
    secrets: &SecretResolver,
    snapshots_dir: &Path,
) -> Result<Config, ConfigError> {
    let raw_text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
    let raw: RawConfig = toml::from_str(&raw_text).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })?;
    let config = normalize(raw, config_dir, secrets)?;

    let (display, canonical) = render(&config);
    let store = SnapshotStore::new(snapshots_dir);
    if let Err(e) = store.save(&display, &canonical, proofscan_core::ids::now_ms()) {
        tracing::warn!(error = %e, "failed to persist config snapshot");
    }
    Ok(config)
}
