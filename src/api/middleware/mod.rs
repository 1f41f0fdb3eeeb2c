//! API middleware.
//!
//! - `access`: request log, every route
//! - `signature`: webhook HMAC check, `POST /webhook` only

pub mod access;
pub mod signature;
