//! Regex-only output normalization (stage S5)
//!
//! Strips intro and outro fluff, prepends the chemistry header when S-1
//! produced one, and guarantees exactly one trailing signature
//! `🔥 ~nyan [timestamp]`. Never an LLM call. Structured modes (indicator,
//! seed-metric, code audit, design) keep their bodies untouched but still
//! receive the signature.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::routing::RoutingMode;

fn intro_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^(sure|certainly|of course|absolutely|great question)[,!.]\s*",
            r"(?i)^let me (help|break|explain|walk you through)[^\n]*\n+",
            r"(?i)^as of my (knowledge|last update)[^\n]*\n+",
            r"(?i)^here(?:'s| is) (?:a |the )?(?:summary|answer|breakdown|overview)[^\n]*\n+",
            r"(?i)^i(?:'d| would) be happy to[^\n]*\n+",
            r"(?i)^thanks? for (?:your|the) (?:question|query)[^\n]*\n+",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn outro_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?is)\n+confidence (?:grade|level|assessment):.*$",
            r"(?is)\n+verification notes?:.*$",
            r"(?i)\n+in (?:summary|conclusion)[,:][^\n]*$",
            r"(?i)\n+(?:let me know|feel free to|i hope this helps)[^\n]*$",
            r"(?i)\n+is there anything else[^\n]*$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn signature_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"🔥 ~nyan \[[^\]]*\]\s*").unwrap())
}

/// Render the canonical signature for a pipeline timestamp.
pub fn signature(timestamp: DateTime<Utc>) -> String {
    format!("🔥 ~nyan [{}]", timestamp.format("%Y-%m-%dT%H:%M:%SZ"))
}

/// Remove every signature occurrence (used when merging compound parts).
pub fn strip_signature(text: &str) -> String {
    signature_pattern().replace_all(text, "").trim_end().to_string()
}

/// The S5 normalization pass.
pub fn apply_personality(
    text: &str,
    mode: RoutingMode,
    chemistry_header: Option<&str>,
    timestamp: DateTime<Utc>,
) -> String {
    let mut body = strip_signature(text);

    if !mode.skips_fluff_strip() {
        for pattern in intro_patterns() {
            body = pattern.replace(&body, "").to_string();
        }
        for pattern in outro_patterns() {
            body = pattern.replace(&body, "").to_string();
        }
    }

    let mut out = String::new();
    if let Some(header) = chemistry_header {
        out.push_str(header);
        if !header.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(body.trim());
    out.push_str("\n\n");
    out.push_str(&signature(timestamp));
    out
}
