//! API endpoint handlers.
//!
//! Each module corresponds to one resource. Handlers open their own
//! connection, call into the domain modules and wrap the result in
//! [`ApiResponse`](crate::api::types::ApiResponse).

pub mod appointments;
pub mod automation;
pub mod confirmations;
pub mod conversations;
pub mod health;
pub mod legal;
pub mod patients;
pub mod webhook;
