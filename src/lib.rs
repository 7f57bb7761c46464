//! Thumbnail Worker
//!
//! Queue-driven worker that turns uploaded images into JPEG thumbnails,
//! publishes them to the thumbnails bucket and marks job records done.

pub mod config;
pub mod consumer;
pub mod derive;
pub mod error;
pub mod message;
pub mod processor;
pub mod status;
pub mod storage;

// Public re-exports
pub use config::Config;
pub use error::{Result, WorkerError};
