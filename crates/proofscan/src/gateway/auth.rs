//! Bearer auth and permission matching for the HTTP gateway. The wildcard
//! matcher is exact-segment: a pattern segment is either `*` (matches
//! exactly one segment) or must equal the checked segment literally; the
//! two strings must also have the same segment count.

use sha2::{Digest, Sha256};

use crate::config::{AuthMode, BearerTokenConfig, GatewayConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
	Missing,
	Malformed,
	UnknownToken,
	InsufficientPermission,
}

impl DenyReason {
	pub fn as_str(self) -> &'static str {
		match self {
			DenyReason::Missing => "missing",
			DenyReason::Malformed => "malformed",
			DenyReason::UnknownToken => "unknown_token",
			DenyReason::InsufficientPermission => "insufficient_permission",
		}
	}
}

/// `None` when `auth_mode` is `none` or the header checks out; `Some` names
/// the matched token so the caller can attribute the request to it.
pub enum AuthOutcome {
	Allowed { token_name: Option<String> },
	Denied(DenyReason),
}

/// Authenticates one request's `Authorization` header against `config`, and
/// (if authenticated) checks `required_permission`.
pub fn authenticate(config: &GatewayConfig, authorization_header: Option<&str>, required_permission: &str) -> AuthOutcome {
	if config.auth_mode == AuthMode::None {
		return AuthOutcome::Allowed { token_name: None };
	}

	let Some(header) = authorization_header else {
		return AuthOutcome::Denied(DenyReason::Missing);
	};
	let Some(token) = header.strip_prefix("Bearer ") else {
		return AuthOutcome::Denied(DenyReason::Malformed);
	};
	if token.is_empty() {
		return AuthOutcome::Denied(DenyReason::Malformed);
	}

	let hash_hex = hex::encode(Sha256::digest(token.as_bytes()));
	let Some(matched) = config.tokens.iter().find(|t| t.hash_hex == hash_hex) else {
		return AuthOutcome::Denied(DenyReason::UnknownToken);
	};

	if !token_permits(matched, required_permission) {
		return AuthOutcome::Denied(DenyReason::InsufficientPermission);
	}

	AuthOutcome::Allowed { token_name: Some(matched.name.clone()) }
}

fn token_permits(token: &BearerTokenConfig, required: &str) -> bool {
	token.permissions.iter().any(|pattern| permission_matches(pattern, required))
}

/// Segment-exact wildcard match: equal segment count required, `*` matches
/// exactly one segment.
pub fn permission_matches(pattern: &str, action: &str) -> bool {
	let pattern_segments: Vec<&str> = pattern.split(':').collect();
	let action_segments: Vec<&str> = action.split(':').collect();
	if pattern_segments.len() != action_segments.len() {
		return false;
	}
	pattern_segments.iter().zip(action_segments.iter()).all(|(p, a)| *p == "*" || p == a)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AuthMode, BearerTokenConfig, GatewayConfig};
	use std::time::Duration;

	fn gateway_with_tokens(tokens: Vec<BearerTokenConfig>) -> GatewayConfig {
		GatewayConfig {
			bind_addr: "127.0.0.1:0".to_string(),
			auth_mode: AuthMode::Bearer,
			tokens,
			body_cap_bytes: 1024,
			hide_not_found: true,
			default_timeout: Duration::from_secs(1),
			rate_limit_per_minute: None,
		}
	}

	fn token_hash(raw: &str) -> String {
		hex::encode(Sha256::digest(raw.as_bytes()))
	}

	#[test]
	fn wildcard_matches_exactly_one_segment() {
		assert!(permission_matches("mcp:call:*", "mcp:call:github"));
		assert!(!permission_matches("mcp:call:*", "mcp:call:github:extra"));
		assert!(!permission_matches("mcp:call:*", "mcp:list:github"));
		assert!(permission_matches("mcp:*:*", "mcp:call:github"));
		assert!(permission_matches("mcp:*:*", "mcp:list:anything"));
		assert!(!permission_matches("mcp:*:*", "mcp:call"));
	}

	#[test]
	fn exact_pattern_requires_exact_match() {
		assert!(permission_matches("mcp:call:github", "mcp:call:github"));
		assert!(!permission_matches("mcp:call:github", "mcp:call:gitlab"));
	}

	#[test]
	fn auth_mode_none_allows_everyone() {
		let config = GatewayConfig {
			bind_addr: "127.0.0.1:0".to_string(),
			auth_mode: AuthMode::None,
			tokens: vec![],
			body_cap_bytes: 1024,
			hide_not_found: false,
			default_timeout: Duration::from_secs(1),
			rate_limit_per_minute: None,
		};
		assert!(matches!(authenticate(&config, None, "mcp:call:github"), AuthOutcome::Allowed { .. }));
	}

	#[test]
	fn missing_header_is_denied_as_missing() {
		let config = gateway_with_tokens(vec![]);
		assert!(matches!(authenticate(&config, None, "mcp:call:github"), AuthOutcome::Denied(DenyReason::Missing)));
	}

	#[test]
	fn non_bearer_header_is_denied_as_malformed() {
		let config = gateway_with_tokens(vec![]);
		assert!(matches!(
			authenticate(&config, Some("Basic abc"), "mcp:call:github"),
			AuthOutcome::Denied(DenyReason::Malformed)
		));
	}

	#[test]
	fn unrecognized_token_is_denied() {
		let config = gateway_with_tokens(vec![BearerTokenConfig {
			name: "ci".to_string(),
			hash_hex: token_hash("right-token"),
			permissions: vec!["mcp:*:*".to_string()],
		}]);
		assert!(matches!(
			authenticate(&config, Some("Bearer wrong-token"), "mcp:call:github"),
			AuthOutcome::Denied(DenyReason::UnknownToken)
		));
	}

	#[test]
	fn recognized_token_without_permission_is_denied() {
		let config = gateway_with_tokens(vec![BearerTokenConfig {
			name: "ci".to_string(),
			hash_hex: token_hash("ci-token"),
			permissions: vec!["mcp:call:github".to_string()],
		}]);
		assert!(matches!(
			authenticate(&config, Some("Bearer ci-token"), "mcp:call:gitlab"),
			AuthOutcome::Denied(DenyReason::InsufficientPermission)
		));
	}

	#[test]
	fn recognized_token_with_matching_permission_is_allowed() {
		let config = gateway_with_tokens(vec![BearerTokenConfig {
			name: "ci".to_string(),
			hash_hex: token_hash("ci-token"),
			permissions: vec!["mcp:call:*".to_string()],
		}]);
		let outcome = authenticate(&config, Some("Bearer ci-token"), "mcp:call:github");
		assert!(matches!(outcome, AuthOutcome::Allowed { token_name: Some(ref name) } if name == "ci"));
	}
}
