//! SSRF guard for the A2A HTTP/SSE client (§4.3): host resolution that
//! yields any RFC1918, loopback, link-local, or unspecified address is
//! rejected synchronously at construction time.

use std::net::IpAddr;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use ipnet::{Ipv4Net, Ipv6Net};
use url::Url;

use super::{Result, TransportError};

const PRIVATE_TEXT: &str = "Private or local URLs are not allowed";

fn is_private(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			v4.is_loopback()
				|| v4.is_link_local()
				|| v4.is_unspecified()
				|| ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
					.iter()
					.any(|cidr| cidr.parse::<Ipv4Net>().unwrap().contains(&v4))
		},
		IpAddr::V6(v6) => {
			v6.is_loopback()
				|| v6.is_unspecified()
				|| "fe80::/10".parse::<Ipv6Net>().unwrap().contains(&v6)
				|| "fc00::/7".parse::<Ipv6Net>().unwrap().contains(&v6)
		},
	}
}

/// Resolves `url`'s host and rejects it synchronously if any resolved
/// address is private/loopback/link-local/unspecified.
pub async fn check_url_safe(url: &Url) -> Result<()> {
	let host = url
		.host_str()
		.ok_or_else(|| TransportError::Ssrf(format!("{PRIVATE_TEXT}: missing host")))?;

	if let Ok(ip) = host.parse::<IpAddr>() {
		if is_private(ip) {
			return Err(TransportError::Ssrf(PRIVATE_TEXT.to_string()));
		}
		return Ok(());
	}

	let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
	let lookup = resolver
		.lookup_ip(host)
		.await
		.map_err(|e| TransportError::Unreachable(e.to_string()))?;

	for ip in lookup.iter() {
		if is_private(ip) {
			return Err(TransportError::Ssrf(PRIVATE_TEXT.to_string()));
		}
	}
	Ok(())
}
