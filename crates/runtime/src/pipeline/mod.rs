//! The pipeline orchestrator: stages S-1 through S6
//!
//! A deterministic state machine drives every query through context
//! extraction, preflight routing, system-context assembly, reasoning, an
//! audit pass with a single bounded retry loop, regex personality
//! normalization, and badge derivation. Each stage writes an immutable
//! artifact into the run's [`crate::package::DataPackage`].

mod audit;
mod compound;
mod ingest;
mod orchestrator;
mod personality;
mod types;

pub use audit::{parse_audit_reply, run_audit, AuditStrictness};
pub use compound::split_compound;
pub use ingest::{NoVision, PhotoInsight, VisionAdapter};
pub use orchestrator::Pipeline;
pub use personality::apply_personality;
pub use types::{
    AuditOutcome, DocumentInput, Photo, PipelineRequest, PipelineResponse,
};
