#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod hardware;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
