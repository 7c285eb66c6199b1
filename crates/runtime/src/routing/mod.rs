//! Preflight routing: mode detection, key extraction, data prefetch
//!
//! The router classifies each query into a pipeline mode before any LLM
//! call, prefetching market and forex data where the mode needs it. Routing
//! decisions are made on a classification view of the query (blob queries
//! are reduced to their first three and last two sentences) and recorded as
//! flags the orchestrator consumes downstream.

mod context;
mod router;
mod ticker;
mod types;

pub use context::{build_system_context, ContextOptions, SystemMessage};
pub use router::{PreflightInput, PreflightRouter};
pub use ticker::{detect_keys, extract_ticker, geo_veto, LegoKeys, TickerCandidate};
pub use types::{AttachmentMeta, DocContext, PreflightResult, RoutingFlags, RoutingMode};
