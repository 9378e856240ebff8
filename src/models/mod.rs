//! Domain model module declarations.

pub mod checkpoint;
pub mod failure;
pub mod metrics;
pub mod progress;
pub mod session;
pub mod task_state;
