//! Logging setup and secret redaction
//!
//! Everything that leaves the core as text (status notices, serialized
//! errors) goes through [`sanitize`] first. Passwords and key material must
//! never reach a log line or the UI.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum length of a message shown in a transient notification
const MAX_NOTICE_LENGTH: usize = 200;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "sshmon=info,warn";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 runs (key bodies, tokens)
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Safe to call more
/// than once; only the first call has an effect.
pub fn init_tracing(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.chars().count() > MAX_LINE_LENGTH {
        result = format!("{}... [truncated]", truncate_chars(&result, MAX_LINE_LENGTH));
    }

    result
}

/// Sanitize and shorten a message for a user-facing notification
pub fn notice_text(input: &str) -> String {
    let msg = sanitize(input);
    if msg.chars().count() > MAX_NOTICE_LENGTH {
        format!("{}...", truncate_chars(&msg, MAX_NOTICE_LENGTH))
    } else {
        msg
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
