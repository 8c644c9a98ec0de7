//! Local control socket (§4.7 "IPC commands"): a Unix domain socket at
//! `proxy.ipc_socket_path` accepting line-delimited JSON commands and
//! replying with a line-delimited JSON response.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::ProxyServer;
use crate::config::ConfigManager;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum IpcCommand {
	Status,
	Reload,
	Stop,
}

#[derive(Debug, Serialize)]
struct IpcResponse {
	success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

impl IpcResponse {
	fn ok(data: Value) -> Self {
		Self { success: true, data: Some(data), error: None }
	}

	fn err(message: impl Into<String>) -> Self {
		Self { success: false, data: None, error: Some(message.into()) }
	}
}

/// Binds `socket_path` (removing a stale socket file left by a crashed
/// process) and serves connections until `cancel` fires.
pub async fn serve(
	socket_path: &Path,
	server: Arc<ProxyServer>,
	config_manager: Arc<ConfigManager>,
	cancel: CancellationToken,
) -> std::io::Result<()> {
	if socket_path.exists() {
		let _ = std::fs::remove_file(socket_path);
	}
	if let Some(parent) = socket_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let listener = UnixListener::bind(socket_path)?;

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, _addr) = accepted?;
				let server = server.clone();
				let config_manager = config_manager.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_connection(stream, server, config_manager).await {
						tracing::debug!(error = %e, "proxy ipc: connection ended with an error");
					}
				});
			},
			_ = cancel.cancelled() => {
				let _ = std::fs::remove_file(socket_path);
				return Ok(());
			},
		}
	}
}

async fn handle_connection(stream: UnixStream, server: Arc<ProxyServer>, config_manager: Arc<ConfigManager>) -> std::io::Result<()> {
	let (read_half, mut write_half) = stream.into_split();
	let mut lines = BufReader::new(read_half).lines();

	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let response = match serde_json::from_str::<IpcCommand>(&line) {
			Ok(command) => dispatch(command, &server, &config_manager).await,
			Err(e) => IpcResponse::err(format!("malformed command: {e}")),
		};
		let mut encoded = serde_json::to_vec(&response).unwrap_or_default();
		encoded.push(b'\n');
		write_half.write_all(&encoded).await?;
	}
	Ok(())
}

async fn dispatch(command: IpcCommand, server: &Arc<ProxyServer>, config_manager: &Arc<ConfigManager>) -> IpcResponse {
	match command {
		IpcCommand::Status => IpcResponse::ok(server.status()),
		IpcCommand::Reload => {
			config_manager.invalidate_cache().await;
			match config_manager.load().await {
				Ok(new_config) => {
					let report = server.reload(new_config).await;
					match serde_json::to_value(&report) {
						Ok(data) => IpcResponse::ok(data),
						Err(e) => IpcResponse::err(e.to_string()),
					}
				},
				Err(e) => IpcResponse::err(e.to_string()),
			}
		},
		IpcCommand::Stop => {
			server.shutdown().await;
			IpcResponse::ok(serde_json::json!({"stopped": true}))
		},
	}
}
