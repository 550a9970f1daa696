//! The twirp-style RPC surface the instrumentation plugs into.
//!
//! Methods are served as `POST /twirp/<package>.<service>/<Method>` with JSON
//! bodies. The server exposes three lifecycle hooks through [`ServerHooks`]
//! and hands each of them the request scoped [`RpcContext`]; the client
//! tags every outgoing request with its [`CallIdentity`].

mod client;
mod context;
mod error;
mod hooks;
mod server;

pub use client::Client;
pub use context::{CallIdentity, RpcContext};
pub use error::{ClientError, ErrorCode, RpcError};
pub use hooks::{RequestHook, ResponseHook, ServerHooks};
pub use server::Server;

pub const PATH_PREFIX: &str = "/twirp";

pub const CONTENT_TYPE_JSON: &str = "application/json";
