//! Config snapshot index (§4.9): immutable JSON snapshots of the canonical
//! config plus a newest-first index used to detect whether two snapshots are
//! equivalent without re-parsing their contents.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{PersistenceError, Result};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotIndexEntry {
	pub hash: String,
	pub ts_ms: i64,
	pub file: String,
}

pub struct SnapshotStore {
	dir: PathBuf,
}

impl SnapshotStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	fn index_path(&self) -> PathBuf {
		self.dir.join("index.json")
	}

	/// Hashes the canonical (key-sorted) JSON representation of `config_json`.
	/// Takes the already-serialized config so callers control which
	/// serializer produced it (the config manager re-serializes through an
	/// order-independent encoder specifically for hashing, see
	/// `config::canonical_hash`).
	pub fn canonical_hash(canonical_json: &[u8]) -> String {
		let mut hasher = Sha256::new();
		hasher.update(canonical_json);
		hex::encode(hasher.finalize())
	}

	/// Persists `config_json` as an immutable snapshot (skipping the write if
	/// a snapshot with the same hash already exists) and prepends an index
	/// entry. Returns the hash so callers can detect a no-op save.
	pub fn save(&self, config_json: &str, canonical_json: &[u8], ts_ms: i64) -> Result<String> {
		std::fs::create_dir_all(&self.dir)?;
		let hash = Self::canonical_hash(canonical_json);
		let file_name = format!("{hash}.json");
		let file_path = self.dir.join(&file_name);
		if !file_path.exists() {
			std::fs::write(&file_path, config_json)?;
		}

		let mut entries = self.load_index()?;
		entries.insert(
			0,
			SnapshotIndexEntry {
				hash: hash.clone(),
				ts_ms,
				file: file_name,
			},
		);
		self.write_index(&entries)?;
		Ok(hash)
	}

	pub fn load_index(&self) -> Result<Vec<SnapshotIndexEntry>> {
		let path = self.index_path();
		if !path.exists() {
			return Ok(Vec::new());
		}
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_json::from_str(&raw)?)
	}

	fn write_index(&self, entries: &[SnapshotIndexEntry]) -> Result<()> {
		let tmp = self.dir.join("index.json.tmp");
		std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
		std::fs::rename(tmp, self.index_path())?;
		Ok(())
	}

	pub fn latest(&self) -> Result<Option<SnapshotIndexEntry>> {
		Ok(self.load_index()?.into_iter().next())
	}

	pub fn read_snapshot(&self, entry: &SnapshotIndexEntry) -> Result<String> {
		std::fs::read_to_string(self.dir.join(&entry.file)).map_err(PersistenceError::from)
	}
}

/// Writes `contents` to `path` atomically via a temp file in the same
/// directory followed by a rename, matching the runtime-state / snapshot
/// write contract described throughout §4 and §6.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	std::fs::create_dir_all(dir)?;
	let tmp = dir.join(format!(
		".{}.tmp",
		path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")
	));
	std::fs::write(&tmp, contents)?;
	std::fs::rename(tmp, path)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn saving_identical_config_twice_reuses_hash_and_dedupes_content_file() {
		let dir = tempdir().unwrap();
		let store = SnapshotStore::new(dir.path());
		let canonical = br#"{"a":1}"#;
		let hash1 = store.save(r#"{ "a": 1 }"#, canonical, 1).unwrap();
		let hash2 = store.save(r#"{ "a": 1 }"#, canonical, 2).unwrap();
		assert_eq!(hash1, hash2);

		let index = store.load_index().unwrap();
		assert_eq!(index.len(), 2);
		assert_eq!(index[0].ts_ms, 2, "index is ordered newest-first");
		assert_eq!(index[1].ts_ms, 1);
	}

	#[test]
	fn atomic_write_replaces_existing_file() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("runtime_state.json");
		atomic_write(&path, b"one").unwrap();
		atomic_write(&path, b"two").unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
	}
}
