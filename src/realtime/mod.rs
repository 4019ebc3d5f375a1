//! Realtime subscriptions over the backend's event stream.
//!
//! - [`client`]: streaming connection, handshake, and subscription lifecycle.
//! - [`proto`]: wire frames and control messages shared with the backend.

/// Streaming client and subscription handles.
pub mod client;
/// Wire-level frames and messages.
pub mod proto;
