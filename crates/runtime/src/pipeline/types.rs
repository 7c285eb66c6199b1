//! Pipeline request/response envelope types

use serde::{Deserialize, Serialize};

use crate::memory::MemoryMessage;
use crate::package::PackageSummary;
use crate::providers::ProviderTag;
use crate::routing::{PreflightResult, RoutingMode};
use crate::types::{AuditVerdict, Badge, PackageId, TokenUsage};

/// A raw image attachment.
#[derive(Debug, Clone)]
pub struct Photo {
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

/// A raw document attachment.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub file_name: String,
    pub file_type: String,
    pub bytes: Vec<u8>,
}

/// One pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub query: String,
    /// Opaque tenant key (derive with [`crate::types::tenant_key`]).
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub caller_id: String,
    pub photos: Vec<Photo>,
    pub documents: Vec<DocumentInput>,
    pub history: Vec<MemoryMessage>,
    /// Force a single provider instead of walking the chain.
    pub provider: Option<ProviderTag>,
    /// Replace the dynamic chain order before this run.
    pub chain: Option<Vec<ProviderTag>>,
    pub temperature: Option<f32>,
    /// Skip preflight and use this result verbatim.
    pub pre_computed_preflight: Option<PreflightResult>,
    /// Caller-supplied protocol texts (opaque to the orchestrator).
    pub base_protocol: String,
    pub compressed_protocol: String,
}

impl PipelineRequest {
    pub fn query(query: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tenant_id: tenant_id.into(),
            caller_id: "anonymous".to_string(),
            ..Default::default()
        }
    }
}

/// Audit pass outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub verdict: AuditVerdict,
    /// Confidence in [0, 100].
    pub confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AuditOutcome {
    pub fn bypass() -> Self {
        Self {
            verdict: AuditVerdict::Bypass,
            confidence: 95,
            fixed_answer: None,
            notes: None,
        }
    }

    pub fn api_failure() -> Self {
        Self {
            verdict: AuditVerdict::ApiFailure,
            confidence: 0,
            fixed_answer: None,
            notes: None,
        }
    }
}

/// The response envelope returned by `Pipeline::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub success: bool,
    pub answer: String,
    pub mode: RoutingMode,
    #[serde(skip)]
    pub preflight: PreflightResult,
    pub audit: AuditOutcome,
    pub badge: Badge,
    pub did_search: bool,
    pub retry_count: u32,
    /// Reasoning/audit passes executed (compound runs sum their parts).
    pub pass_count: u32,
    pub data_package_id: PackageId,
    pub data_package_summary: PackageSummary,
    pub usage: TokenUsage,
}
