//! Speaker Diarization Service Library

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod service;

pub use config::Config;
pub use error::{DiarizationError, Result};
