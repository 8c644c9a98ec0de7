//! Agent card fetch and cache orchestration (§4.10): HTTP GET through the
//! SSRF guard, JSON-shape validation, and a single retry on a transient
//! server error before the fetch is recorded as failed.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::store::{AgentCardCacheEntry, PersistenceError, Stores};
use crate::transport::ssrf::check_url_safe;

#[derive(Debug, Error)]
pub enum AgentCardError {
	#[error("invalid agent card URL: {0}")]
	InvalidUrl(String),
	#[error("SSRF guard: {0}")]
	Ssrf(String),
	#[error("http error fetching agent card: {0}")]
	Http(#[from] reqwest::Error),
	#[error("agent card response was not a valid card: {0}")]
	Invalid(String),
	#[error("persistence error: {0}")]
	Persistence(#[from] PersistenceError),
}

/// The outcome of one [`AgentCardCache::fetch`] call, mirroring the design
/// note's `{ok, agentCard?, hash?, error?}` result shape rather than a plain
/// `Result` so callers can log a structured failure without matching on the
/// error type.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
	pub ok: bool,
	pub agent_card: Option<Value>,
	pub hash: Option<String>,
	pub error: Option<String>,
}

pub struct AgentCardCache {
	stores: Stores,
	client: Client,
	ttl: Duration,
}

impl AgentCardCache {
	pub fn new(stores: Stores, client: Client, ttl: Duration) -> Self {
		Self { stores, client, ttl }
	}

	/// Returns the cached card for `target_id`, if any, without refetching.
	/// Stale entries are returned with `is_stale` left for the caller to
	/// check — a stale read is never an error.
	pub fn get_cached(&self, target_id: &str) -> Result<Option<AgentCardCacheEntry>, AgentCardError> {
		self.stores.get_agent_card(target_id).map_err(AgentCardError::from)
	}

	/// Fetches `url`, validates the shape, and persists the result. Retries
	/// once on a transient 5xx before giving up, per the fetch-intelligently
	/// contract in §7.
	pub async fn fetch(&self, target_id: &str, url: &str) -> FetchOutcome {
		match self.fetch_with_retry(target_id, url).await {
			Ok((card, hash)) => FetchOutcome { ok: true, agent_card: Some(card), hash: Some(hash), error: None },
			Err(e) => FetchOutcome { ok: false, agent_card: None, hash: None, error: Some(e.to_string()) },
		}
	}

	async fn fetch_with_retry(&self, target_id: &str, url: &str) -> Result<(Value, String), AgentCardError> {
		match self.fetch_once(url).await {
			Ok(result) => self.store(target_id, result).await,
			Err(AgentCardError::Http(e)) if is_transient(&e) => {
				let result = self.fetch_once(url).await?;
				self.store(target_id, result).await
			},
			Err(e) => Err(e),
		}
	}

	async fn fetch_once(&self, url: &str) -> Result<Value, AgentCardError> {
		let parsed = Url::parse(url).map_err(|e| AgentCardError::InvalidUrl(e.to_string()))?;
		check_url_safe(&parsed).await.map_err(|e| AgentCardError::Ssrf(e.to_string()))?;

		let response = self.client.get(parsed).header("accept", "application/json").send().await?;
		let response = response.error_for_status()?;
		let card: Value = response.json().await?;
		validate_agent_card(&card)?;
		Ok(card)
	}

	async fn store(&self, target_id: &str, card: Value) -> Result<(Value, String), AgentCardError> {
		let serialized = serde_json::to_string(&card).map_err(|e| AgentCardError::Invalid(e.to_string()))?;
		let hash = hex::encode(Sha256::digest(serialized.as_bytes()));
		let fetched_at = proofscan_core::ids::now_ms();
		let expires_at = fetched_at + self.ttl.as_millis() as i64;
		self.stores.put_agent_card(target_id, &serialized, &hash, fetched_at, expires_at)?;
		Ok((card, hash))
	}
}

/// A transient server error is worth one retry; a client error or a
/// malformed-response error is not.
fn is_transient(err: &reqwest::Error) -> bool {
	err.status().map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS).unwrap_or(err.is_timeout() || err.is_connect())
}

/// An agent card must be a JSON object carrying at least `name`, `url`, and
/// `version`, per §4.10.
fn validate_agent_card(card: &Value) -> Result<(), AgentCardError> {
	let Some(obj) = card.as_object() else {
		return Err(AgentCardError::Invalid("agent card is not a JSON object".to_string()));
	};
	for field in ["name", "url", "version"] {
		if !obj.contains_key(field) {
			return Err(AgentCardError::Invalid(format!("agent card is missing required field `{field}`")));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn cache(ttl: Duration) -> (tempfile::TempDir, AgentCardCache) {
		let dir = tempdir().unwrap();
		let stores = Stores::open(dir.path()).unwrap();
		(dir, AgentCardCache::new(stores, Client::new(), ttl))
	}

	#[tokio::test]
	async fn fetch_validates_and_caches_a_well_formed_card() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/.well-known/agent.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"name": "demo-agent", "url": "https://demo.example/a2a", "version": "1.0",
			})))
			.mount(&server)
			.await;

		let (_dir, cache) = cache(Duration::from_secs(60));
		let url = format!("{}/.well-known/agent.json", server.uri());
		let outcome = cache.fetch("agent-a", &url).await;
		assert!(outcome.ok);
		assert!(outcome.hash.is_some());

		let cached = cache.get_cached("agent-a").unwrap().unwrap();
		assert!(!cached.is_stale(proofscan_core::ids::now_ms()));
	}

	#[tokio::test]
	async fn fetch_rejects_a_card_missing_required_fields() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/agent.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "demo-agent"})))
			.mount(&server)
			.await;

		let (_dir, cache) = cache(Duration::from_secs(60));
		let url = format!("{}/agent.json", server.uri());
		let outcome = cache.fetch("agent-a", &url).await;
		assert!(!outcome.ok);
		assert!(cache.get_cached("agent-a").unwrap().is_none());
	}

	#[tokio::test]
	async fn fetch_retries_once_on_server_error_then_succeeds() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/agent.json"))
			.respond_with(ResponseTemplate::new(503))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/agent.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"name": "demo-agent", "url": "https://demo.example/a2a", "version": "1.0",
			})))
			.mount(&server)
			.await;

		let (_dir, cache) = cache(Duration::from_secs(60));
		let url = format!("{}/agent.json", server.uri());
		let outcome = cache.fetch("agent-a", &url).await;
		assert!(outcome.ok);
	}

	#[tokio::test]
	async fn rejects_private_urls_before_sending_a_request() {
		let (_dir, cache) = cache(Duration::from_secs(60));
		let outcome = cache.fetch("agent-a", "http://127.0.0.1:9/agent.json").await;
		assert!(!outcome.ok);
		assert!(outcome.error.unwrap().contains("Private or local"));
	}
}
