/// Request validation helpers
///
/// Hostname normalization for crawl requests and cursor parsing for
/// paginated listings.
use crate::error::{RelayError, RelayResult};

/// Normalize a PDS hostname: lowercase, no scheme, no trailing slash.
///
/// Hostnames arriving with a protocol scheme are rejected outright; the
/// caller is expected to pass a bare domain.
pub fn normalize_hostname(host: &str) -> RelayResult<String> {
    if host.is_empty() {
        return Err(RelayError::Validation("must pass valid hostname".to_string()));
    }

    if host.starts_with("https://") || host.starts_with("http://") {
        return Err(RelayError::Validation(
            "must pass domain without protocol scheme".to_string(),
        ));
    }

    let norm = host.trim().trim_end_matches('/').to_lowercase();
    if norm.is_empty() {
        return Err(RelayError::Validation("must pass valid hostname".to_string()));
    }

    Ok(norm)
}

/// Parse a base-10 UID cursor; empty means start from the beginning.
pub fn parse_cursor(cursor: Option<&str>) -> RelayResult<i64> {
    match cursor {
        None | Some("") => Ok(0),
        Some(c) => c
            .parse::<i64>()
            .map_err(|e| RelayError::Validation(format!("invalid cursor: {}", e))),
    }
}
