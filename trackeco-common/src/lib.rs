//! # TrackEco Common Library
//!
//! Shared code for the TrackEco backend services including:
//! - Database initialization, schema and models
//! - Configuration loading
//! - Error types
//! - Day-bucketing time helpers (streak logic)

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
