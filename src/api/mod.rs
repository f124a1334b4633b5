//! HTTP boundary.
//!
//! Thin axum layer over `ClinicalPipeline`: JSON in, stage outcomes out,
//! permissive CORS for the browser frontend.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer};
pub use types::ApiContext;
