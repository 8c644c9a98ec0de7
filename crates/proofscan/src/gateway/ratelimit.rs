//! Per-client rate limiting for the HTTP gateway: a fixed-size rolling
//! window of request timestamps per client key, trimmed lazily on each
//! check rather than by a background sweep.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

pub struct RateLimiter {
	limit_per_minute: Option<u32>,
	windows: DashMap<String, Mutex<Vec<Instant>>>,
}

impl RateLimiter {
	pub fn new(limit_per_minute: Option<u32>) -> Self {
		Self { limit_per_minute, windows: DashMap::new() }
	}

	/// Records one request for `client_key` and reports whether it is within
	/// the rolling-minute budget. Always `true` when no limit is configured.
	pub fn check(&self, client_key: &str) -> bool {
		let Some(limit) = self.limit_per_minute else { return true };
		let now = Instant::now();
		let window = self.windows.entry(client_key.to_string()).or_default();
		let mut timestamps = window.lock();
		timestamps.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
		if timestamps.len() >= limit as usize {
			return false;
		}
		timestamps.push(now);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_always_passes() {
		let limiter = RateLimiter::new(None);
		for _ in 0..1000 {
			assert!(limiter.check("client-a"));
		}
	}

	#[test]
	fn rejects_once_the_per_minute_budget_is_exhausted() {
		let limiter = RateLimiter::new(Some(3));
		assert!(limiter.check("client-a"));
		assert!(limiter.check("client-a"));
		assert!(limiter.check("client-a"));
		assert!(!limiter.check("client-a"));
	}

	#[test]
	fn clients_are_tracked_independently() {
		let limiter = RateLimiter::new(Some(1));
		assert!(limiter.check("client-a"));
		assert!(!limiter.check("client-a"));
		assert!(limiter.check("client-b"));
	}
}
