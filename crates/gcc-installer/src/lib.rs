pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod modules;
pub mod net;
pub mod planner;
pub mod request;
pub mod usage;
pub mod workspace;

pub use error::{Error, Result};
