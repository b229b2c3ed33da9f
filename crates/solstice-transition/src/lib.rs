//! Step transition engine for Solstice.
//!
//! This crate owns every mutation of a workflow run. Pipeline handlers,
//! the dispatcher and the dead-letter absorber all change run state through
//! [`StepTransitionEngine`]; nothing else writes to the run store.
//!
//! # Architecture
//!
//! ```text
//! StepTransitionEngine
//! ├── create_workflow_run(project, run, type)   idempotent create
//! ├── get_workflow_state(project, run)          read-only query
//! ├── update_step_status(..., status, ...)      Applied | SkippedIdempotent | SkippedTerminal
//! └── mark_step_processing_with_idempotency()   claim a step, true if this call won
//!
//! apply(): loop up to max_conflict_retries
//!   read run ──▶ plan_transition (pure) ──▶ conditional_update(token)
//!                                              └── VersionConflict ──▶ read again
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let engine = StepTransitionEngine::new(store, pipelines, &config.policy);
//!
//! engine.create_workflow_run("P1", "R1", "helioscope_processing").await?;
//! if engine.mark_step_processing_with_idempotency("P1", "R1", "fetch").await? {
//!     // do the work, then
//!     engine
//!         .update_step_status("P1", "R1", "fetch", StepStatus::Completed, Some(output), None)
//!         .await?;
//! }
//! ```

mod engine;
mod error;
mod plan;

pub use engine::{StepTransitionEngine, Transition};
pub use error::TransitionError;
pub use plan::{Plan, StepChange, TransitionOutcome, plan_transition};
