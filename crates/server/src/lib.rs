//! HTTP intake server and completion worker for stowage.
//!
//! This crate provides:
//! - Resumable upload endpoints that stage chunks in temporary storage
//! - Intake preflight and job status endpoints
//! - The rate governor in front of every route
//! - The completion worker that validates uploads and moves them to
//!   permanent storage

pub mod error;
pub mod handlers;
pub mod intake;
pub mod metrics;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod worker;

pub use error::ApiError;
pub use ratelimit::RateLimitState;
pub use routes::create_router;
pub use state::AppState;
