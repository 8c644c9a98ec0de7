//! Persistence layer: two embedded SQLite databases (`events.db`,
//! `agent_cache.db`) plus a reserved, unmanaged `proofs.db` file, a snapshot
//! index, and a minimal secrets resolver.
//!
//! `events.db` is the only multi-writer resource in the process; every
//! table in it is guarded by one `parking_lot::Mutex<rusqlite::Connection>`
//! so our own prepared-statement reuse is serialized on top of SQLite's own
//! WAL-mode writer serialization.

pub mod agentcache;
pub mod events;
pub mod gateway_audit;
pub mod schema;
pub mod secrets;
pub mod snapshot;

pub use agentcache::AgentCardCacheEntry;
pub use events::{Direction, Event, EventKind, ExitReason, NewEvent, RpcCall, Session};
pub use gateway_audit::{Decision, GatewayEvent, GatewayEventKind, NewGatewayEvent};
pub use secrets::{SecretError, SecretResolver};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("sqlite error: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("no such row")]
	NotFound,
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Opens a SQLite connection in WAL mode with a busy timeout, matching the
/// "singleton connection per process" contract from the persistence design.
fn open_wal(path: &Path) -> Result<Connection> {
	let conn = Connection::open(path)?;
	conn.pragma_update(None, "journal_mode", "WAL")?;
	conn.busy_timeout(std::time::Duration::from_secs(5))?;
	conn.pragma_update(None, "foreign_keys", "ON")?;
	Ok(conn)
}

/// Bundles the handles every other component needs: the events database, the
/// agent-card cache database, and the on-disk locations of the snapshot
/// index and the (unmanaged) proof ledger file.
#[derive(Clone)]
pub struct Stores {
	pub events: Arc<Mutex<Connection>>,
	pub agent_cache: Arc<Mutex<Connection>>,
	pub config_dir: PathBuf,
	/// Reserved path for the proof-of-provenance ledger. ProofScan only
	/// ensures the file exists and does not collide with `events.db`; the
	/// POPL record format itself is out of scope.
	pub proofs_db_path: PathBuf,
}

impl Stores {
	pub fn open(config_dir: impl Into<PathBuf>) -> Result<Self> {
		let config_dir = config_dir.into();
		std::fs::create_dir_all(&config_dir)?;

		let events_path = config_dir.join("events.db");
		let agent_cache_path = config_dir.join("agent_cache.db");
		let proofs_db_path = config_dir.join("proofs.db");

		let events = open_wal(&events_path)?;
		schema::migrate_events(&events)?;

		let agent_cache = open_wal(&agent_cache_path)?;
		schema::migrate_agent_cache(&agent_cache)?;

		// Reserve the file without writing a schema into it: the ledger format
		// is out of scope, we just ensure the path is claimed.
		if !proofs_db_path.exists() {
			std::fs::File::create(&proofs_db_path)?;
		}

		Ok(Self {
			events: Arc::new(Mutex::new(events)),
			agent_cache: Arc::new(Mutex::new(agent_cache)),
			config_dir,
			proofs_db_path,
		})
	}

	pub fn snapshot_dir(&self) -> PathBuf {
		self.config_dir.join("snapshots")
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn open_creates_both_databases() {
		let dir = tempdir().unwrap();
		let stores = Stores::open(dir.path()).unwrap();
		assert!(dir.path().join("events.db").exists());
		assert!(dir.path().join("agent_cache.db").exists());
		assert!(dir.path().join("proofs.db").exists());
		drop(stores);
	}
}
