//! Supervision of long-running tasks.
//!
//! Covers resource-aware execution, session lifecycle management,
//! checkpoint cadence, progress tracking, failure recovery, and resumption.

pub mod durability;
pub mod executor;
pub mod long_duration;
pub mod progress;
pub mod recovery;
pub mod resume;
pub mod session_manager;
