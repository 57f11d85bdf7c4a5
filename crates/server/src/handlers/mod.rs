//! HTTP request handlers.

pub mod health;
pub mod jobs;
pub mod preflight;
pub mod uploads;

pub use health::*;
pub use jobs::*;
pub use preflight::*;
pub use uploads::*;
