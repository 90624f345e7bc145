//! Client for the work-management portal's REST services: access-credential
//! management with cross-replica single-flight refresh, a retrying HTTP
//! client with stable error classification, and a KV-backed response cache.

mod auth;
mod cache;
mod client;
mod error;
pub mod models;

pub use auth::{TokenConfig, TokenManager};
pub use cache::{fingerprint, CachedResponse, ResponseCache};
pub use client::{Client, Reply};
pub use error::{Error, Result};
