//! Utility functions for the gateway
//!
//! Formatting helpers used by logs and heartbeat status text, plus Matrix id
//! helpers that work on raw strings so odd room ids never fail to parse.

use std::time::Duration;

/// Format a duration in a human-readable format
pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() < 60 {
        format!("{}ms", duration.as_millis())
    } else if duration.as_secs() < 3600 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}h {}m", duration.as_secs() / 3600, (duration.as_secs() % 3600) / 60)
    }
}

/// Format a byte count using binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Server part of a Matrix id (`!room:server`, `@user:server`).
pub fn server_name_of(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, server)| server).filter(|s| !s.is_empty())
}

/// Part of a Matrix id before the server name, without the sigil.
pub fn localpart_of(id: &str) -> &str {
    let local = id.split_once(':').map_or(id, |(local, _)| local);
    local
        .strip_prefix(['!', '@', '#', '$'])
        .unwrap_or(local)
}

/// Shortens a credential so it can appear in logs.
pub fn redact_token(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    if visible.len() == token.len() {
        "***".to_owned()
    } else {
        format!("{}***", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30000ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(3660)), "1h 1m");
    }

    #[test]
    fn test_bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20.00 MiB");
    }

    #[test]
    fn test_matrix_id_parts() {
        assert_eq!(server_name_of("!abc:matrix.org"), Some("matrix.org"));
        assert_eq!(server_name_of("!abc:localhost:8448"), Some("localhost:8448"));
        assert_eq!(server_name_of("!nodomain"), None);
        assert_eq!(localpart_of("!abcdef:matrix.org"), "abcdef");
        assert_eq!(localpart_of("@alice:example.org"), "alice");
    }

    #[test]
    fn test_token_redaction() {
        assert_eq!(redact_token("syt_abcdefghijk"), "syt_ab***");
        assert_eq!(redact_token("short"), "***");
    }
}
