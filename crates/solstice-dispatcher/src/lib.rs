//! Trigger dispatch for Solstice.
//!
//! A trigger names one step of one run. The [`Dispatcher`] claims the step,
//! runs its registered [`StepHandler`], records the result and emits the
//! trigger for the next step. The [`DispatchRunner`] feeds the dispatcher
//! from a channel, redelivers triggers whose dispatch failed and dead-letters
//! them once they reach the poison threshold.

mod dispatcher;
mod error;
mod handler;
mod message;
mod runner;
mod sink;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::DispatchError;
pub use handler::{
  FnHandler, HandlerError, HandlerRegistry, PassThroughHandler, StepContext, StepHandler,
};
pub use message::TriggerMessage;
pub use runner::DispatchRunner;
pub use sink::{ChannelTriggerSink, NoopTriggerSink, TriggerSink};
