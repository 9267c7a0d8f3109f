#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod scheduler;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, ErrorKind, Result};
