//! Output scanning
//!
//! Pure helpers that pull the tunnel hostname out of a raw output chunk.
//! Applying the hostname is the tracker's job.

use regex::Regex;
use thiserror::Error;
use url::Url;

/// URL printed by the tunnel client for quick tunnels
pub const QUICK_TUNNEL_PATTERN: &str = r"https://[a-z0-9-]+\.trycloudflare\.com";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid tunnel URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Tunnel URL has no hostname: {0}")]
    NoHost(String),
}

/// Compile the quick tunnel pattern.
pub fn quick_tunnel_pattern() -> Regex {
    Regex::new(QUICK_TUNNEL_PATTERN).expect("quick tunnel pattern is valid")
}

/// Last occurrence of `pattern` in `chunk`.
///
/// Earlier URLs in the same chunk are reconnect churn; only the latest one
/// counts.
pub fn last_match<'a>(pattern: &Regex, chunk: &'a str) -> Option<&'a str> {
    pattern.find_iter(chunk).last().map(|m| m.as_str())
}

/// Hostname of a matched URL.
pub fn hostname(matched: &str) -> Result<String, ScanError> {
    let url = Url::parse(matched).map_err(|source| ScanError::InvalidUrl {
        url: matched.to_string(),
        source,
    })?;
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ScanError::NoHost(matched.to_string()))
}

/// Hostname from the last match in `chunk`, if any.
pub fn extract_last_host(pattern: &Regex, chunk: &str) -> Option<Result<String, ScanError>> {
    last_match(pattern, chunk).map(hostname)
}
