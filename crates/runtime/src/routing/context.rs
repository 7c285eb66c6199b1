//! System-context assembly for stage S1
//!
//! The message sequence always opens with a temporal-awareness line, then
//! either the full base protocol (first query of a session) or its
//! compressed reference, then one seed prompt per active routing flag. The
//! protocol texts themselves are caller-supplied and never inspected.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::analysis::{legal, psi_ema};
use crate::routing::types::{PreflightResult, RoutingMode};

/// One system message in the S1 sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    pub role: String,
    pub content: String,
}

impl SystemMessage {
    fn new(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Caller-supplied protocol texts and session facts.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub is_first_query: bool,
    pub base_protocol: String,
    pub compressed_protocol: String,
}

/// Build the full system-message sequence for a routed query.
pub fn build_system_context(
    preflight: &PreflightResult,
    options: &ContextOptions,
) -> Vec<SystemMessage> {
    let mut messages = Vec::new();

    messages.push(SystemMessage::new(format!(
        "Temporal awareness: the current UTC time is {}.",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    )));

    if options.is_first_query {
        if !options.base_protocol.is_empty() {
            messages.push(SystemMessage::new(options.base_protocol.clone()));
        }
    } else if !options.compressed_protocol.is_empty() {
        messages.push(SystemMessage::new(options.compressed_protocol.clone()));
    }

    let flags = &preflight.routing_flags;

    if flags.uses_financial_physics {
        messages.push(SystemMessage::new(
            "A financial document is attached. Classify rows into income (+), \
             cost (−), and profit (=), validate income − cost = profit within 5%, \
             and call out any accounting-identity violation explicitly.",
        ));
    }

    if flags.uses_legal_analysis {
        messages.push(SystemMessage::new(legal::render_template()));
    }

    if flags.uses_forex {
        let mut seed = String::from(
            "This is a currency question. Quote the fetched rate exactly as given; \
             never invent a rate.",
        );
        if let Some(context) = &preflight.forex_context {
            seed.push('\n');
            seed.push_str(context);
        }
        messages.push(SystemMessage::new(seed));
    }

    if flags.is_seed_metric {
        messages.push(SystemMessage::new(
            "This is a housing affordability question. Answer with the affordability \
             table (columns: City, Price/m², Annual income, Years for 700 m², Regime) \
             and nothing before it. Regimes: >25 years FATALISM, 10–25 years \
             PHI-BREATHING, <10 years OPTIMISM.",
        ));
    }

    if flags.is_psi_ema_identity {
        messages.push(SystemMessage::new(psi_ema::CANONICAL_DOC));
    }

    if flags.uses_psi_ema && !flags.is_psi_ema_identity {
        let mut seed = String::from(
            "Indicator analysis is active. Report θ, z, and R exactly as computed; \
             do not re-derive them.",
        );
        if let Some(context) = &preflight.stock_context {
            seed.push('\n');
            seed.push_str(context);
        }
        messages.push(SystemMessage::new(seed));
    }

    if flags.is_design_question {
        messages.push(SystemMessage::new(
            "This is an architecture question. Discuss trade-offs concretely, name \
             the load assumptions you are making, and give one primary \
             recommendation.",
        ));
    }

    if preflight.mode == RoutingMode::CodeAudit {
        messages.push(SystemMessage::new(
            "This is a code audit. Review for correctness first, then safety, then \
             style; cite line references from the provided source.",
        ));
    }

    messages
}
