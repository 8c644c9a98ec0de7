//! Logging setup. A single place that wires `tracing-subscriber` so every
//! binary in the workspace configures logs the same way: an `env-filter`
//! driven by `RUST_LOG` (falling back to a configured default), optional
//! structured JSON output for machine consumption, and optional non-blocking
//! file output via `tracing-appender`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Logging configuration as loaded from `config.toml`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
	/// `env-filter` syntax, e.g. `"proofscan=debug,info"`. Falls back to
	/// `RUST_LOG` if set, then to `"info"`.
	pub filter: Option<String>,
	/// Emit one JSON object per line instead of the human-readable format.
	#[serde(default)]
	pub json: bool,
	/// Optional file to additionally write logs to (directory must exist).
	pub file: Option<std::path::PathBuf>,
}

/// Guard returned by [`init`]. Dropping it flushes the non-blocking file
/// writer; callers must keep it alive for the lifetime of the process.
pub struct TelemetryGuard {
	_file_guard: Option<WorkerGuard>,
}

pub fn init(cfg: &LoggingConfig) -> TelemetryGuard {
	let filter = cfg
		.filter
		.clone()
		.map(EnvFilter::new)
		.unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

	let (file_writer, guard) = match &cfg.file {
		Some(path) => {
			let (writer, guard) = tracing_appender::non_blocking(file_appender(path));
			(Some(writer), Some(guard))
		},
		None => (None, None),
	};

	// Four fixed combinations (stdout plain/json x file present/absent) rather
	// than boxed dyn layers, which keeps the subscriber type concrete.
	match (cfg.json, file_writer) {
		(false, None) => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer())
				.init();
		},
		(true, None) => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().json())
				.init();
		},
		(false, Some(w)) => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer())
				.with(tracing_subscriber::fmt::layer().with_writer(w).with_ansi(false).json())
				.init();
		},
		(true, Some(w)) => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().json())
				.with(tracing_subscriber::fmt::layer().with_writer(w).with_ansi(false).json())
				.init();
		},
	}

	TelemetryGuard { _file_guard: guard }
}

fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	let file_name = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| "proofscan.log".to_string());
	tracing_appender::rolling::never(dir, file_name)
}
