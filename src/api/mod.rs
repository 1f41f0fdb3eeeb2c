//! HTTP API.
//!
//! Clinic routes live under `/api/`, the WhatsApp webhook at `/webhook`.
//! `api_router()` returns a composable `Router`; `server` runs it.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer, ServerError};
pub use types::{ApiContext, ApiResponse};
