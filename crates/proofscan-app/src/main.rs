//! ProofScan command-line entry point. This binary is deliberately thin: it
//! resolves the config directory, wires up the persistence, recorder, queue
//! manager, proxy, and gateway from `proofscan`, and dispatches to them.
//! Argument parsing depth and the interactive REPL are out of scope (see
//! `SPEC_FULL.md` §1); this is the minimal glue a real dispatcher would call
//! into.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proofscan::config::ConfigManager;
use proofscan::proxy::{ProxyServer, ipc};
use proofscan::queue::QueueManager;
use proofscan::recorder::SessionRecorder;
use proofscan::store::Stores;
use proofscan_core::telemetry::{self, LoggingConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "proofscan", version, about = "MCP/A2A observability gateway")]
struct Cli {
	/// Per-installation config directory. Defaults to the OS-appropriate
	/// data directory for "proofscan".
	#[arg(long, global = true)]
	config_dir: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the MCP aggregating proxy in the foreground.
	Proxy,
	/// Run the HTTP gateway in the foreground.
	Gateway,
	/// Send a command to a running proxy over its local IPC socket.
	Ipc {
		#[command(subcommand)]
		cmd: IpcCmd,
	},
}

#[derive(Subcommand)]
enum IpcCmd {
	Status,
	Reload,
	Stop,
}

fn default_config_dir() -> Result<PathBuf> {
	let dirs = directories::ProjectDirs::from("", "", "proofscan").context("could not determine a home directory for the default config path")?;
	Ok(dirs.data_dir().to_path_buf())
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let config_dir = match &cli.config_dir {
		Some(dir) => dir.clone(),
		None => default_config_dir()?,
	};

	let _telemetry_guard = telemetry::init(&LoggingConfig::default());

	match cli.command {
		Command::Proxy => run_proxy(config_dir).await,
		Command::Gateway => run_gateway(config_dir).await,
		Command::Ipc { cmd } => run_ipc(config_dir, cmd).await,
	}
}

async fn load_config(config_dir: &std::path::Path) -> Result<(Arc<ConfigManager>, Arc<proofscan::config::Config>)> {
	let secrets = proofscan::store::SecretResolver::load(&config_dir.join("secrets.toml")).unwrap_or_default();
	let manager = Arc::new(ConfigManager::new(config_dir, secrets));
	let config = manager.load().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
	Ok((manager, config))
}

async fn run_proxy(config_dir: PathBuf) -> Result<()> {
	std::fs::create_dir_all(&config_dir)?;
	let (config_manager, config) = load_config(&config_dir).await?;
	let stores = Stores::open(&config_dir)?;
	let recorder = Arc::new(SessionRecorder::new(stores.clone(), config.recorder.clone()));
	let queue_manager = Arc::new(QueueManager::new());
	let server = ProxyServer::start(config.clone(), stores, recorder, queue_manager).await;

	let cancel = CancellationToken::new();
	let ipc_cancel = cancel.clone();
	let ipc_socket = config.proxy.ipc_socket_path.clone();
	let ipc_server = server.clone();
	let ipc_task = tokio::spawn(async move {
		if let Err(e) = ipc::serve(&ipc_socket, ipc_server, config_manager, ipc_cancel).await {
			tracing::error!(error = %e, "proxy ipc socket exited");
		}
	});

	tokio::signal::ctrl_c().await?;
	tracing::info!("proxy: received shutdown signal");
	cancel.cancel();
	server.shutdown().await;
	let _ = ipc_task.await;
	Ok(())
}

async fn run_gateway(config_dir: PathBuf) -> Result<()> {
	std::fs::create_dir_all(&config_dir)?;
	let (_config_manager, config) = load_config(&config_dir).await?;
	let stores = Stores::open(&config_dir)?;
	let queue_manager = Arc::new(QueueManager::new());
	let state = proofscan::gateway::GatewayState::start(config.clone(), stores, queue_manager).await;

	let bind_addr: std::net::SocketAddr = config.gateway.bind_addr.parse().context("invalid gateway.bind_addr")?;
	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	tracing::info!(addr = %bind_addr, "gateway: listening");
	let router = state.clone().router();
	axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
	state.shutdown().await;
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

async fn run_ipc(config_dir: PathBuf, cmd: IpcCmd) -> Result<()> {
	let (_config_manager, config) = load_config(&config_dir).await?;
	let stream = UnixStream::connect(&config.proxy.ipc_socket_path)
		.await
		.with_context(|| format!("connecting to {}", config.proxy.ipc_socket_path.display()))?;
	let (read_half, mut write_half) = stream.into_split();
	let command = match cmd {
		IpcCmd::Status => r#"{"cmd":"status"}"#,
		IpcCmd::Reload => r#"{"cmd":"reload"}"#,
		IpcCmd::Stop => r#"{"cmd":"stop"}"#,
	};
	write_half.write_all(command.as_bytes()).await?;
	write_half.write_all(b"\n").await?;

	let mut lines = BufReader::new(read_half).lines();
	if let Some(line) = lines.next_line().await? {
		println!("{line}");
	}
	Ok(())
}
