//! ULID-backed identifiers and timestamp helpers shared across the event store,
//! the recorder, and the proxy.

use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

/// Generates a new lexicographically-sortable identifier, e.g. for
/// `session_id` or `event_id`.
pub fn new_id() -> String {
	Ulid::new().to_string()
}

/// Current time in milliseconds since the Unix epoch.
///
/// Every timestamp column in the event store (`started_at`, `request_ts`,
/// `ts`, ...) is stored this way so ordering comparisons stay integer
/// comparisons rather than string or `DateTime` comparisons.
pub fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_millis() as i64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_unique_and_sortable() {
		let a = new_id();
		let b = new_id();
		assert_ne!(a, b);
		assert!(a <= b, "ULIDs generated in order should sort in order");
	}

	#[test]
	fn now_ms_is_monotonic_enough() {
		let a = now_ms();
		std::thread::sleep(std::time::Duration::from_millis(2));
		let b = now_ms();
		assert!(b >= a);
	}
}
