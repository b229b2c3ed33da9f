//! Solstice Workflow
//!
//! This crate provides the validated pipeline representation for Solstice.
//! A [`Pipeline`] is the checked form of a `PipelineDef`: a non-empty,
//! duplicate-free, ordered list of step names for one workflow type.
//!
//! Key differences from `solstice-config`:
//! - Step names are validated (non-blank, unique within the pipeline)
//! - Pipelines are indexed by workflow type in a [`PipelineSet`]
//! - Step succession ("what runs after `design`?") is answered here

mod error;
mod pipeline;
mod set;

pub use error::WorkflowError;
pub use pipeline::Pipeline;
pub use set::PipelineSet;
