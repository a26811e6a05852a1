//! Admission control for actix-web services.
//!
//! Wrap an `App` with [`api::middleware::AdmissionGate`] to apply per-category
//! sliding-window rate limits, flood detection and bans backed by a shared
//! counter store.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod store;
pub mod utils;
