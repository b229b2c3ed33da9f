//! Dead-letter absorption for Solstice.
//!
//! Messages that exhausted their deliveries end up here. The absorber keeps
//! the raw bytes, fails the step they belonged to and tells monitoring about
//! it, without ever returning an error to the broker:
//!
//! ```text
//! DeadLetterRouter::route(queue, bytes, id)
//!   └── DeadLetterAbsorber::absorb(failure_type, bytes, id, queue)
//!         1. extract projectId/runId          (parse failure: blob only)
//!         2. BlobSink::put(envelope)          (failure: logged)
//!         3. update_step_status(Failed)       (no route: logged)
//!         4. FailureNotifier::notify(record)
//! ```
//!
//! Stages 2 to 4 each run under their own panic guard; a panic in one is
//! logged and treated as that stage's failure.

mod absorber;
mod envelope;
mod notifier;
mod router;
mod routes;

pub use absorber::{AbsorptionReport, DeadLetterAbsorber};
pub use envelope::{
  DeadLetterEnvelope, PayloadEncoding, RunIdentifiers, encode_payload, extract_identifiers,
};
pub use notifier::{ChannelNotifier, FailureNotifier, FailureRecord, LogNotifier, NoopNotifier};
pub use router::{DeadLetterRouter, UNRECOGNIZED_FAILURE_TYPE};
pub use routes::QueueRoutes;
