//! # Twirp observability
//! This crate instruments twirp calls on both ends with OpenTelemetry spans
//! and metrics tagged by package, service, method and status.
//!
//! ## Setup
//! Tracing, metrics and logging can be set up using [`setup::setup`]. This
//! should be the first call of any server binary. It returns a
//! [`telemetry::Telemetry`] handle which is passed to everything that needs
//! to be instrumented.
//!
//! ## Server
//! A twirp [`twirp::Server`] gets two levels of spans per request:
//! [`telemetry::Telemetry::server_hooks`] opens the logical call span from
//! the server's lifecycle hooks, [`telemetry::Telemetry::wrap_handler`]
//! opens the transport level span around it and continues traces found in
//! the request headers.
//!
//! ```ignore
//! let server = Server::new("twirp.example", "Haberdasher")
//!     .method("MakeHat", make_hat)
//!     .with_hooks(telemetry.server_hooks());
//! let handler = telemetry.wrap_handler(server);
//! ```
//!
//! ## Client
//! [`telemetry::Telemetry::wrap_transport`] wraps any tower transport used by
//! a [`twirp::Client`], recording a client span and the round-trip latency.
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from [`http::Request`]s.

pub mod hooks;
pub mod http_injector;
pub mod metrics;
pub mod middleware;
pub mod setup;
pub mod tags;
pub mod telemetry;
pub mod twirp;

pub use telemetry::Telemetry;
