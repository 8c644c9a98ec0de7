//! Secret reference resolution. The encryption-at-rest format for secrets is
//! out of scope; this is the plaintext/env-resolved stand-in described in
//! `SPEC_FULL.md` §6 so subprocess connectors still get a real admission
//! error when a `${SECRET:<ref>}` placeholder can't be resolved.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
	#[error("unresolved secret reference: {0}")]
	NotFound(String),
}

#[derive(Debug, Clone, Default)]
pub struct SecretResolver {
	file_secrets: HashMap<String, String>,
}

impl SecretResolver {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Loads `secrets.toml` (a flat `ref = "value"` table) if present. A
	/// missing file is not an error — resolution simply falls through to the
	/// environment.
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		if !path.exists() {
			return Ok(Self::default());
		}
		#[cfg(unix)]
		warn_if_world_readable(path);

		let raw = std::fs::read_to_string(path)?;
		let table: HashMap<String, String> = toml::from_str(&raw)?;
		Ok(Self { file_secrets: table })
	}

	/// Resolves every `${SECRET:<ref>}` occurrence in `input`. Lookup order:
	/// the loaded `secrets.toml` table, then `PROOFSCAN_SECRET_<REF>` in the
	/// environment (ref upper-cased).
	pub fn resolve(&self, input: &str) -> Result<String, SecretError> {
		let mut out = String::with_capacity(input.len());
		let mut rest = input;
		while let Some(start) = rest.find("${SECRET:") {
			let Some(end_rel) = rest[start..].find('}') else {
				out.push_str(rest);
				return Ok(out);
			};
			let end = start + end_rel;
			out.push_str(&rest[..start]);
			let reference = &rest[start + "${SECRET:".len()..end];
			out.push_str(&self.resolve_one(reference)?);
			rest = &rest[end + 1..];
		}
		out.push_str(rest);
		Ok(out)
	}

	fn resolve_one(&self, reference: &str) -> Result<String, SecretError> {
		if let Some(v) = self.file_secrets.get(reference) {
			return Ok(v.clone());
		}
		let env_key = format!("PROOFSCAN_SECRET_{}", reference.to_uppercase());
		std::env::var(&env_key).map_err(|_| SecretError::NotFound(reference.to_string()))
	}
}

#[cfg(unix)]
fn warn_if_world_readable(path: &Path) {
	use std::os::unix::fs::PermissionsExt;
	if let Ok(meta) = std::fs::metadata(path)
		&& meta.permissions().mode() & 0o077 != 0
	{
		tracing::warn!(path = %path.display(), "secrets.toml is readable by group/other");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_from_file_table() {
		let resolver = SecretResolver {
			file_secrets: HashMap::from([("github-token".to_string(), "ghp_abc".to_string())]),
		};
		assert_eq!(
			resolver.resolve("token=${SECRET:github-token}").unwrap(),
			"token=ghp_abc"
		);
	}

	#[test]
	fn falls_through_to_environment() {
		// SAFETY: test-only, single-threaded env mutation scoped to this test.
		unsafe { std::env::set_var("PROOFSCAN_SECRET_OTHER", "from-env") };
		let resolver = SecretResolver::empty();
		assert_eq!(resolver.resolve("${SECRET:other}").unwrap(), "from-env");
		unsafe { std::env::remove_var("PROOFSCAN_SECRET_OTHER") };
	}

	#[test]
	fn missing_reference_is_an_error() {
		let resolver = SecretResolver::empty();
		assert_eq!(
			resolver.resolve("${SECRET:missing}"),
			Err(SecretError::NotFound("missing".to_string()))
		);
	}

	#[test]
	fn passes_through_strings_without_placeholders() {
		let resolver = SecretResolver::empty();
		assert_eq!(resolver.resolve("plain value").unwrap(), "plain value");
	}
}
