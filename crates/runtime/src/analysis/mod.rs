//! Pluggable analysis seeds invoked by preflight and stage S-1
//!
//! Pure analysis routines: the indicator analyzer, the housing affordability
//! proxy, the financial-physics document classifier, the chemistry
//! identification cascade, and the legal analysis template. None of them do
//! I/O beyond the search/fetcher collaborators passed in explicitly.

pub mod chemistry;
pub mod financial_physics;
pub mod legal;
pub mod psi_ema;
pub mod seed_metric;
