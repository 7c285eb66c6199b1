//! Core types and data structures for the nyanclaw pipeline runtime

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Unique identifier for data packages (one per pipeline run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId(pub Uuid);

impl PackageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex characters, used in compressed summaries.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for watchtower background runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("run-{}", Uuid::new_v4().simple()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for swarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage identifiers, ordered S-1 through S6.
///
/// The string forms (`"S-1"`, `"S0"`, ...) are the wire and artifact
/// representation; the enum ordering matches execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum StageId {
    #[serde(rename = "S-1")]
    ContextExtract,
    #[serde(rename = "S0")]
    Preflight,
    #[serde(rename = "S1")]
    ContextBuild,
    #[serde(rename = "S2")]
    Reasoning,
    #[serde(rename = "S3")]
    Audit,
    #[serde(rename = "S4")]
    Retry,
    #[serde(rename = "S5")]
    Personality,
    #[serde(rename = "S6")]
    Output,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::ContextExtract => "S-1",
            StageId::Preflight => "S0",
            StageId::ContextBuild => "S1",
            StageId::Reasoning => "S2",
            StageId::Audit => "S3",
            StageId::Retry => "S4",
            StageId::Personality => "S5",
            StageId::Output => "S6",
        }
    }

    /// All stages in execution order.
    pub fn all() -> [StageId; 8] {
        [
            StageId::ContextExtract,
            StageId::Preflight,
            StageId::ContextBuild,
            StageId::Reasoning,
            StageId::Audit,
            StageId::Retry,
            StageId::Personality,
            StageId::Output,
        ]
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S-1" => Ok(StageId::ContextExtract),
            "S0" => Ok(StageId::Preflight),
            "S1" => Ok(StageId::ContextBuild),
            "S2" => Ok(StageId::Reasoning),
            "S3" => Ok(StageId::Audit),
            "S4" => Ok(StageId::Retry),
            "S5" => Ok(StageId::Personality),
            "S6" => Ok(StageId::Output),
            other => Err(format!("unknown stage id: {other}")),
        }
    }
}

/// Verdict returned by the audit pass.
///
/// `Approved` and `Accepted` are synonyms by contract; every consumer
/// must treat them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditVerdict {
    Approved,
    Accepted,
    Bypass,
    Fixable,
    Rejected,
    ApiFailure,
}

impl AuditVerdict {
    /// True for verdicts that count as a pass (approved family or bypass).
    pub fn is_pass(&self) -> bool {
        matches!(
            self,
            AuditVerdict::Approved | AuditVerdict::Accepted | AuditVerdict::Bypass
        )
    }
}

impl std::fmt::Display for AuditVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditVerdict::Approved => "APPROVED",
            AuditVerdict::Accepted => "ACCEPTED",
            AuditVerdict::Bypass => "BYPASS",
            AuditVerdict::Fixable => "FIXABLE",
            AuditVerdict::Rejected => "REJECTED",
            AuditVerdict::ApiFailure => "API_FAILURE",
        };
        f.write_str(s)
    }
}

/// User-visible verification label derived from the audit verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    Verified,
    Corrected,
    Unverified,
    Unavailable,
}

impl Badge {
    pub fn from_verdict(verdict: AuditVerdict) -> Self {
        match verdict {
            AuditVerdict::Approved | AuditVerdict::Accepted | AuditVerdict::Bypass => {
                Badge::Verified
            }
            AuditVerdict::Fixable => Badge::Corrected,
            AuditVerdict::ApiFailure => Badge::Unavailable,
            AuditVerdict::Rejected => Badge::Unverified,
        }
    }

    /// The worse of two badges, used when merging compound-query parts.
    /// Ordering: verified < corrected < unverified < unavailable.
    pub fn worst(self, other: Badge) -> Badge {
        self.max(other)
    }
}

impl std::fmt::Display for Badge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Badge::Verified => "verified",
            Badge::Corrected => "corrected",
            Badge::Unverified => "unverified",
            Badge::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Token usage reported by a provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn combined(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Derive the opaque tenant key from raw request identifiers.
///
/// SHA-256 of `ip ∥ user_agent ∥ salt` truncated to 16 hex characters;
/// the stores never see the raw identifiers.
pub fn tenant_key(ip: &str, user_agent: &str, salt: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
