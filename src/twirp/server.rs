use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use http::{header::CONTENT_TYPE, HeaderValue, Method, Request, Response};
use serde::{de::DeserializeOwned, Serialize};
use tower::Service;

use super::{CallIdentity, RpcContext, RpcError, ServerHooks, CONTENT_TYPE_JSON, PATH_PREFIX};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type MethodHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<Result<Vec<u8>, RpcError>> + Send + Sync>;

/// Serves the JSON methods of one twirp service.
///
/// ```ignore
/// let server = Server::new("twirp.example", "Haberdasher")
///     .method("MakeHat", make_hat)
///     .with_hooks(telemetry.server_hooks());
/// ```
#[derive(Clone)]
pub struct Server {
    package: Arc<str>,
    service: Arc<str>,
    methods: Arc<HashMap<String, MethodHandler>>,
    hooks: ServerHooks,
}

impl Server {
    pub fn new(package: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            package: package.into().into(),
            service: service.into().into(),
            methods: Arc::default(),
            hooks: ServerHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Registers a handler for `name`, decoding its input from and encoding
    /// its output to JSON.
    pub fn method<I, O, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let method: MethodHandler = Arc::new(
            move |body: Vec<u8>| -> BoxFuture<Result<Vec<u8>, RpcError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let input: I = serde_json::from_slice(&body).map_err(|err| {
                        RpcError::malformed(format!("the json request could not be decoded: {err}"))
                    })?;
                    let output = handler(input).await?;
                    serde_json::to_vec(&output).map_err(|err| {
                        RpcError::internal(format!("failed to encode response: {err}"))
                    })
                })
            },
        );
        Arc::make_mut(&mut self.methods).insert(name.into(), method);
        self
    }

    /// Path under which every method of this service is served.
    pub fn path_prefix(&self) -> String {
        format!("{PATH_PREFIX}/{}.{}/", self.package, self.service)
    }

    pub async fn handle(&self, request: Request<Vec<u8>>) -> Response<Vec<u8>> {
        let (parts, body) = request.into_parts();
        let mut ctx = RpcContext::new(CallIdentity::new(&*self.package, &*self.service))
            .with_extensions(parts.extensions);

        if let Err(err) = self.hooks.request_received(&mut ctx) {
            return self.write_error(&mut ctx, err);
        }

        let (method, handler) = match self.route(&parts.method, parts.uri.path(), &parts.headers) {
            Ok(route) => route,
            Err(err) => {
                tracing::debug!(path = parts.uri.path(), %err, "failed to route request");
                return self.write_error(&mut ctx, err);
            }
        };

        ctx.set_method_name(method);
        if let Err(err) = self.hooks.request_routed(&mut ctx) {
            return self.write_error(&mut ctx, err);
        }

        match handler(body).await {
            Ok(output) => self.write_response(&mut ctx, output),
            Err(err) => self.write_error(&mut ctx, err),
        }
    }

    fn route(
        &self,
        method: &Method,
        path: &str,
        headers: &http::HeaderMap,
    ) -> Result<(String, MethodHandler), RpcError> {
        if method != Method::POST {
            return Err(RpcError::bad_route(format!(
                "unsupported method {method} (only POST is allowed)"
            )));
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(CONTENT_TYPE_JSON) {
            return Err(RpcError::bad_route(format!(
                "unexpected Content-Type: {content_type:?}"
            )));
        }

        let no_handler = || RpcError::bad_route(format!("no handler for path {path:?}"));
        let name = path
            .strip_prefix(&self.path_prefix())
            .ok_or_else(no_handler)?;
        let handler = self.methods.get(name).ok_or_else(no_handler)?;

        Ok((name.to_owned(), handler.clone()))
    }

    fn write_response(&self, ctx: &mut RpcContext, body: Vec<u8>) -> Response<Vec<u8>> {
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        self.finish(ctx, response)
    }

    fn write_error(&self, ctx: &mut RpcContext, err: RpcError) -> Response<Vec<u8>> {
        let mut response = Response::new(err.to_json());
        *response.status_mut() = err.http_status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        self.finish(ctx, response)
    }

    fn finish(&self, ctx: &mut RpcContext, response: Response<Vec<u8>>) -> Response<Vec<u8>> {
        ctx.set_status_code(response.status().as_str());
        self.hooks.response_sent(ctx);
        response
    }
}

impl Service<Request<Vec<u8>>> for Server {
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;
    type Response = Response<Vec<u8>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Vec<u8>>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move { Ok(server.handle(request).await) })
    }
}
