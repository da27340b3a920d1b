//! Service layer - request orchestration and health reporting

pub mod health;
pub mod session;
pub mod types;

pub use health::HealthReporter;
pub use session::{InferenceSession, SessionFailure};
pub use types::*;
