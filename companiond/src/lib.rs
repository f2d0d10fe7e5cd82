pub mod api;
pub mod auth;
pub mod error;
pub mod shutdown;
pub mod state;
pub mod telemetry;
