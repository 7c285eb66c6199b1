//! Routing result types

use serde::{Deserialize, Serialize};

use crate::analysis::psi_ema::PsiEmaAnalysis;
use crate::fetchers::forex::ForexQuote;
use crate::fetchers::market::MarketData;
use crate::fetchers::search::SearchStrategy;

/// Pipeline mode selected by preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    #[default]
    General,
    PsiEma,
    PsiEmaIdentity,
    SeedMetric,
    Forex,
    CodeAudit,
    Design,
    Legal,
    Financial,
    Identity,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::General => "general",
            RoutingMode::PsiEma => "psi-ema",
            RoutingMode::PsiEmaIdentity => "psi-ema-identity",
            RoutingMode::SeedMetric => "seed-metric",
            RoutingMode::Forex => "forex",
            RoutingMode::CodeAudit => "code-audit",
            RoutingMode::Design => "design",
            RoutingMode::Legal => "legal",
            RoutingMode::Financial => "financial",
            RoutingMode::Identity => "identity",
        }
    }

    /// Modes that skip the S4 retry loop entirely.
    pub fn skips_retry(&self) -> bool {
        matches!(
            self,
            RoutingMode::PsiEma
                | RoutingMode::PsiEmaIdentity
                | RoutingMode::Design
                | RoutingMode::CodeAudit
        )
    }

    /// Modes whose output keeps its structure through the personality pass.
    pub fn skips_fluff_strip(&self) -> bool {
        matches!(
            self,
            RoutingMode::PsiEma
                | RoutingMode::SeedMetric
                | RoutingMode::CodeAudit
                | RoutingMode::Design
        )
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean routing facts recorded for downstream stages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingFlags {
    pub uses_psi_ema: bool,
    pub is_psi_ema_identity: bool,
    pub is_seed_metric: bool,
    pub uses_financial_physics: bool,
    pub uses_legal_analysis: bool,
    pub uses_forex: bool,
    pub uses_code_audit: bool,
    pub needs_realtime_search: bool,
    pub has_attachments: bool,
    pub has_doc_context: bool,
    pub is_blob: bool,
    pub geo_veto_applied: bool,
    pub is_design_question: bool,
}

/// Attachment facts the router needs (name and declared type only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub file_name: String,
    pub file_type: String,
}

/// Facts about already-extracted documents for this session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocContext {
    pub has_financial_doc: bool,
    pub has_legal_doc: bool,
    pub has_code_doc: bool,
}

/// Everything preflight decided, handed to the orchestrator at S0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightResult {
    pub mode: RoutingMode,
    pub ticker: Option<String>,
    pub ticker_verified: bool,

    pub market_data: Option<MarketData>,
    pub indicator_analysis: Option<PsiEmaAnalysis>,
    pub weekly_analysis: Option<PsiEmaAnalysis>,
    pub data_age: Option<String>,
    pub stock_context: Option<String>,
    pub custom_period: Option<String>,

    pub forex_pair: Option<String>,
    pub forex_data: Option<ForexQuote>,
    pub forex_context: Option<String>,

    pub code_context: Option<String>,
    pub code_topics: Vec<String>,

    pub search_strategy: SearchStrategy,
    /// Queries the orchestrator should run through the search cascade at S0.
    pub pending_search_queries: Vec<String>,
    /// Cities recognized for the seed-metric path.
    pub cities: Vec<String>,
    pub decade: Option<String>,

    pub routing_flags: RoutingFlags,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_serde_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&RoutingMode::PsiEmaIdentity).unwrap(),
            "\"psi-ema-identity\""
        );
        assert_eq!(
            serde_json::from_str::<RoutingMode>("\"seed-metric\"").unwrap(),
            RoutingMode::SeedMetric
        );
    }

    #[test]
    fn retry_skip_list() {
        assert!(RoutingMode::PsiEma.skips_retry());
        assert!(RoutingMode::Design.skips_retry());
        assert!(RoutingMode::CodeAudit.skips_retry());
        assert!(RoutingMode::PsiEmaIdentity.skips_retry());
        assert!(!RoutingMode::General.skips_retry());
        assert!(!RoutingMode::SeedMetric.skips_retry());
    }
}
