//! Shared wire/domain types for the ingest endpoint and the projection worker.
//!
//! Dynamic per-event-type JSON payloads are modeled as a tagged [`Payload`]
//! enum: ingest validates the raw event once (`RawEvent::into_typed`) and
//! every downstream consumer works with strongly typed values. The database
//! column backing the payload stays opaque JSON; only the in-process
//! representation is typed.

mod event;
mod payload;
mod read_model;
mod time;

pub use event::{EventType, RawEvent, TypedEvent, ValidationError};
pub use payload::{ErrorType, HandoffMethod, LocalHandoffPayload, Payload, RunCompletedPayload, RunStatus};
pub use read_model::{OrgStatsDaily, RunFacts, SessionStats, UserStatsDaily};
pub use time::{day, POST_HANDOFF_WINDOW};

/// Maximum number of events accepted in a single ingest batch.
pub const MAX_BATCH_EVENTS: usize = 100;

/// Default queue claim batch size.
pub const DEFAULT_CLAIM_BATCH_SIZE: i64 = 100;
