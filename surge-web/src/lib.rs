//! Surge Web - HTTP surface for the speed test engine

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Exposes the engine's command surface as a small JSON API and serves the
//! endpoints a speed test client measures against: random download data, an
//! empty echo for uploads and pings, and a client address lookup.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, build_router, run_server};
