//! User-facing Rust SDK for the Basalt record backend.
//!
//! The crate is organized by concern:
//! - `session`: principals, token cache, and credential refresh.
//! - `transport`: authorized HTTP request building for backend calls.
//! - `realtime`: long-lived event stream client and subscription handles.

/// Realtime event stream client and protocol types.
pub mod realtime;
/// Session store, principals, and credential refresh.
pub mod session;
/// Authorized HTTP transport shared by the request layers.
pub mod transport;
