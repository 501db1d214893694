//! Projection worker library: claim-batch dispatch and the per-event-type
//! projectors.

pub mod dispatch;
pub mod projectors;

pub use dispatch::{dispatch_batch, run_per_event, DispatchReport};
pub use projectors::{project_event, ProjectorOutcome};
