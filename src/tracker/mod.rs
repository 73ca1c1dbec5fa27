//! Outbound reply tracking and follow-up nudges.

pub mod nudge;
pub mod thread;

pub use nudge::{NudgeReport, ReplyTracker};
pub use thread::{ThreadDirection, ThreadStatus, TrackedThread};
