//! Tower middleware for both ends of a twirp call.
//!
//! [`tower::TraceLayer`] wraps a server handler, [`transport`] wraps the
//! client transport.

pub mod tower;
pub mod transport;
