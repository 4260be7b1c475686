//! Axum HTTP API server.
//!
//! This crate provides:
//! - Job submission, status and listing endpoints
//! - Owner identity from the gateway-injected `x-owner-id` header
//! - The retention sweeper background service
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::RetentionSweeper;
pub use state::AppState;
