//! API module - REST handlers, auth gate and upload validation

pub mod auth;
pub mod dto;
pub mod rest;
pub mod upload;

pub use auth::{AuthGate, BearerGate};
pub use rest::{create_rest_router, AppState};
pub use upload::UploadGuard;
