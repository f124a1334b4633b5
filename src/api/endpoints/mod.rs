//! Endpoint handlers.
//!
//! Pipeline stages are blocking (synchronous HTTP to the model), so every
//! handler hands its work to `spawn_blocking` and awaits the result.

pub mod analyze;
pub mod extract;
pub mod filter;
pub mod health;
pub mod research;
