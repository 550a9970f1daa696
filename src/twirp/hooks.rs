use std::{fmt, sync::Arc};

use super::{RpcContext, RpcError};

/// Callback for the request-received and request-routed stages. Returning an
/// error aborts the request with that error.
pub type RequestHook = Arc<dyn Fn(&mut RpcContext) -> Result<(), RpcError> + Send + Sync>;

/// Callback for the response-sent stage.
pub type ResponseHook = Arc<dyn Fn(&mut RpcContext) + Send + Sync>;

/// Lifecycle callbacks a [`Server`](super::Server) invokes for every request.
///
/// Each slot is optional; an empty slot is skipped.
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub request_received: Option<RequestHook>,
    pub request_routed: Option<RequestHook>,
    pub response_sent: Option<ResponseHook>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RpcContext) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.request_received = Some(Arc::new(hook));
        self
    }

    pub fn on_request_routed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RpcContext) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.request_routed = Some(Arc::new(hook));
        self
    }

    pub fn on_response_sent<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RpcContext) + Send + Sync + 'static,
    {
        self.response_sent = Some(Arc::new(hook));
        self
    }

    /// Combines several hook sets into one. Request stages run in order and
    /// stop at the first error; response-sent runs every callback.
    pub fn chain(hooks: impl IntoIterator<Item = ServerHooks>) -> Self {
        let hooks: Arc<[ServerHooks]> = hooks.into_iter().collect();

        let received = hooks.clone();
        let routed = hooks.clone();
        let sent = hooks;

        ServerHooks::new()
            .on_request_received(move |ctx| {
                received
                    .iter()
                    .try_for_each(|hooks| hooks.request_received(ctx))
            })
            .on_request_routed(move |ctx| {
                routed
                    .iter()
                    .try_for_each(|hooks| hooks.request_routed(ctx))
            })
            .on_response_sent(move |ctx| sent.iter().for_each(|hooks| hooks.response_sent(ctx)))
    }

    pub(crate) fn request_received(&self, ctx: &mut RpcContext) -> Result<(), RpcError> {
        match &self.request_received {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn request_routed(&self, ctx: &mut RpcContext) -> Result<(), RpcError> {
        match &self.request_routed {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn response_sent(&self, ctx: &mut RpcContext) {
        if let Some(hook) = &self.response_sent {
            hook(ctx);
        }
    }
}

impl fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHooks")
            .field("request_received", &self.request_received.is_some())
            .field("request_routed", &self.request_routed.is_some())
            .field("response_sent", &self.response_sent.is_some())
            .finish()
    }
}
