//! fileflow library crate.
//!
//! A queue-based file processing engine: users submit files, the scheduler
//! runs each one through fetch, extract, name, thumbnail and deliver stages
//! with fair per-user concurrency, and results are persisted in SQLite.

pub mod access;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod media;
pub mod naming;
pub mod pipeline;
pub mod preferences;
pub mod thumbnail;
pub mod transfer;
pub mod utils;

pub use error::{Error, Result};
