//! HTTP status endpoint
//!
//! Serves the latest per-target observations collected by the status board.

pub mod handlers;
