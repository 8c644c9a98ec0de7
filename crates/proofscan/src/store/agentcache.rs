//! Agent card cache persistence (§4.10, §3 `AgentCardCache`).

use rusqlite::{OptionalExtension, params};

use super::{Result, Stores};

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentCardCacheEntry {
	pub target_id: String,
	pub card_json: String,
	pub hash: String,
	pub fetched_at: i64,
	pub expires_at: i64,
}

impl AgentCardCacheEntry {
	pub fn is_stale(&self, now_ms: i64) -> bool {
		now_ms >= self.expires_at
	}
}

impl Stores {
	pub fn put_agent_card(
		&self,
		target_id: &str,
		card_json: &str,
		hash: &str,
		fetched_at: i64,
		expires_at: i64,
	) -> Result<()> {
		let conn = self.agent_cache.lock();
		conn.execute(
			"INSERT INTO agent_cards (target_id, card_json, hash, fetched_at, expires_at)
			 VALUES (?1, ?2, ?3, ?4, ?5)
			 ON CONFLICT(target_id) DO UPDATE SET
			   card_json = excluded.card_json,
			   hash = excluded.hash,
			   fetched_at = excluded.fetched_at,
			   expires_at = excluded.expires_at",
			params![target_id, card_json, hash, fetched_at, expires_at],
		)?;
		Ok(())
	}

	pub fn get_agent_card(&self, target_id: &str) -> Result<Option<AgentCardCacheEntry>> {
		let conn = self.agent_cache.lock();
		conn.query_row(
			"SELECT target_id, card_json, hash, fetched_at, expires_at FROM agent_cards WHERE target_id = ?1",
			params![target_id],
			|row| {
				Ok(AgentCardCacheEntry {
					target_id: row.get(0)?,
					card_json: row.get(1)?,
					hash: row.get(2)?,
					fetched_at: row.get(3)?,
					expires_at: row.get(4)?,
				})
			},
		)
		.optional()
		.map_err(Into::into)
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn roundtrips_and_flags_staleness() {
		let dir = tempdir().unwrap();
		let stores = Stores::open(dir.path()).unwrap();
		stores
			.put_agent_card("agent-a", r#"{"name":"a"}"#, "deadbeef", 1_000, 2_000)
			.unwrap();

		let entry = stores.get_agent_card("agent-a").unwrap().unwrap();
		assert!(!entry.is_stale(1_500));
		assert!(entry.is_stale(2_500));
	}
}
