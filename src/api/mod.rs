//! HTTP API Module
//!
//! Serves client sessions over WebSocket and exposes node status over HTTP.

mod http;
mod ws;

pub use http::{ApiServer, AppState, ErrorResponse, HealthResponse, PeerStatus, StatusResponse};
