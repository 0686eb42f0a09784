//! Hold detection module
//!
//! The state machine that turns the raw key stream into hold gestures,
//! plus the timeout scheduler abstraction that drives it.

mod machine;
mod scheduler;

pub use machine::{Decision, HoldDetector, HoldState};
pub use scheduler::{DeadlineScheduler, Scheduler, TimerId};
