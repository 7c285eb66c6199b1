//! The audit pass (stage S3)
//!
//! A second LLM pass verifies the draft against a dialectical context:
//! thesis (external sources), antithesis (the user's query), synthesis (the
//! draft). The verdict grammar treats APPROVED and ACCEPTED as synonyms.
//! Provider failure maps to API_FAILURE; the audit never mutates prior
//! stages; corrections ride in `fixed_answer` for S5 to apply.

use regex::Regex;
use std::sync::OnceLock;

use crate::pipeline::types::AuditOutcome;
use crate::providers::{CompletionRequest, ProviderChain, ProviderTag};
use crate::types::{AuditVerdict, TokenUsage};

/// Audit posture: STRICT when attachments ground the answer, RESEARCH
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStrictness {
    Strict,
    Research,
}

impl AuditStrictness {
    fn as_str(&self) -> &'static str {
        match self {
            AuditStrictness::Strict => "STRICT",
            AuditStrictness::Research => "RESEARCH",
        }
    }
}

/// Dialectical inputs to one audit.
pub struct AuditContext<'a> {
    /// External sources: search results, market context, attachment extracts.
    pub thesis: &'a str,
    /// The user's query.
    pub antithesis: &'a str,
    /// The draft answer under review.
    pub synthesis: &'a str,
}

/// Run the audit pass. Returns the outcome plus the tokens it consumed.
pub async fn run_audit(
    chain: &ProviderChain,
    provider: Option<ProviderTag>,
    context: AuditContext<'_>,
    strictness: AuditStrictness,
) -> (AuditOutcome, TokenUsage) {
    let prompt = format!(
        "You are the audit stage of an answer pipeline, operating in {mode} mode.\n\
         Judge whether the SYNTHESIS faithfully answers the ANTITHESIS and is \
         consistent with the THESIS.\n\n\
         THESIS (external sources):\n{thesis}\n\n\
         ANTITHESIS (user query):\n{antithesis}\n\n\
         SYNTHESIS (draft answer):\n{synthesis}\n\n\
         Reply on the first line with exactly:\n\
         VERDICT: <APPROVED|ACCEPTED|FIXABLE|REJECTED> CONFIDENCE: <0-100>\n\
         In STRICT mode, reject any claim the THESIS does not support.\n\
         If FIXABLE, follow with a line `FIXED:` and the corrected answer.",
        mode = strictness.as_str(),
        thesis = if context.thesis.is_empty() {
            "(none)"
        } else {
            context.thesis
        },
        antithesis = context.antithesis,
        synthesis = context.synthesis,
    );

    let request = CompletionRequest::new(prompt)
        .with_temperature(0.1)
        .with_max_tokens(800);

    match chain.call_with_retry(&request, provider).await {
        Ok(response) => (parse_audit_reply(&response.text), response.usage),
        Err(err) => {
            tracing::warn!(error = %err, "audit pass failed");
            (AuditOutcome::api_failure(), TokenUsage::default())
        }
    }
}

/// Parse the audit reply grammar. An unparseable reply is accepted at low
/// confidence rather than triggering a retry storm.
pub fn parse_audit_reply(text: &str) -> AuditOutcome {
    static VERDICT_RE: OnceLock<Regex> = OnceLock::new();
    static CONFIDENCE_RE: OnceLock<Regex> = OnceLock::new();
    static FIXED_RE: OnceLock<Regex> = OnceLock::new();

    let verdict_re = VERDICT_RE.get_or_init(|| {
        Regex::new(r"VERDICT:\s*(APPROVED|ACCEPTED|BYPASS|FIXABLE|REJECTED|API_FAILURE)").unwrap()
    });
    let confidence_re =
        CONFIDENCE_RE.get_or_init(|| Regex::new(r"CONFIDENCE:\s*(\d{1,3})").unwrap());
    let fixed_re = FIXED_RE.get_or_init(|| Regex::new(r"(?s)FIXED:\s*(.+)$").unwrap());

    let verdict = match verdict_re.captures(text).map(|c| c[1].to_string()) {
        Some(v) => match v.as_str() {
            "APPROVED" => AuditVerdict::Approved,
            "ACCEPTED" => AuditVerdict::Accepted,
            "BYPASS" => AuditVerdict::Bypass,
            "FIXABLE" => AuditVerdict::Fixable,
            "REJECTED" => AuditVerdict::Rejected,
            _ => AuditVerdict::ApiFailure,
        },
        None => {
            return AuditOutcome {
                verdict: AuditVerdict::Accepted,
                confidence: 50,
                fixed_answer: None,
                notes: Some("unparseable audit reply".to_string()),
            }
        }
    };

    let confidence = confidence_re
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .map(|c| c.min(100) as u8)
        .unwrap_or(50);

    let fixed_answer = if verdict == AuditVerdict::Fixable {
        fixed_re
            .captures(text)
            .map(|c| c[1].trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };

    AuditOutcome {
        verdict,
        confidence,
        fixed_answer,
        notes: None,
    }
}
