//! Human review: the ordered approval chain and its SLA sweep.

pub mod clock;
mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{DecisionOutcome, MAX_REVIEWERS, ReviewScheduler, TickReport};
