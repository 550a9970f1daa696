use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use http::{Request, Response};
use opentelemetry::{
    trace::{FutureExt, SpanKind, Status, TraceContextExt, Tracer as _},
    KeyValue,
};
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_PATH,
};
use tower::Service;
use tower_layer::Layer;

use crate::http_injector::{self, Propagation};

/// Opens a transport level span around every request.
///
/// The span continues the trace found in the request headers and is handed
/// to the wrapped service as an [`opentelemetry::Context`] request extension,
/// so spans started further down (such as the twirp server hooks) become its
/// children.
///
/// Generally, the middleware should wrap the whole twirp server, this usually
/// means that it is registered in the outermost position, to be the first to
/// run.
///
/// ```ignore
/// let server = Server::new("twirp.example", "Haberdasher")
///     .method("MakeHat", make_hat)
///     .with_hooks(telemetry.server_hooks());
/// let handler = TraceLayer::new(tracer, Propagation::Global).layer(server);
/// ```
#[derive(Clone, Debug)]
pub struct TraceLayer {
    tracer: Tracer,
    propagation: Propagation,
}

impl TraceLayer {
    pub fn new(tracer: Tracer, propagation: Propagation) -> Self {
        Self {
            tracer,
            propagation,
        }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService {
            service,
            tracer: self.tracer.clone(),
            propagation: self.propagation.clone(),
        }
    }
}

/// This service implements the Trace behavior
#[derive(Clone, Debug)]
pub struct TraceService<S> {
    service: S,
    tracer: Tracer,
    propagation: Propagation,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let parent = http_injector::extract_context_from_request(&self.propagation, &request);

        let span = self
            .tracer
            .span_builder(request.uri().path().to_owned())
            .with_kind(SpanKind::Server)
            .with_attributes([
                KeyValue::new(HTTP_REQUEST_METHOD, request.method().to_string()),
                KeyValue::new(URL_PATH, request.uri().path().to_owned()),
            ])
            .start_with_context(&self.tracer, &parent);
        let context = parent.with_span(span);
        request.extensions_mut().insert(context.clone());

        let future = self.service.call(request).with_context(context.clone());

        Box::pin(async move {
            let result = future.await;

            let span = context.span();
            match &result {
                Ok(response) => {
                    let status = response.status();
                    span.set_attribute(KeyValue::new(
                        HTTP_RESPONSE_STATUS_CODE,
                        i64::from(status.as_u16()),
                    ));
                    if status.is_server_error() {
                        span.set_status(Status::error(status.to_string()));
                    }
                }
                Err(_) => span.set_status(Status::error("handler failed")),
            }
            span.end();

            result
        })
    }
}
