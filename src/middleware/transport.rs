//! Client transport instrumentation.
//!
//! [`wrap_transport`] composes three layers around a base transport:
//!
//! ```text
//! TagTransport -> ClientTraceTransport -> SpanAttributeTransport -> base
//! ```
//!
//! The tag layer runs first so the round-trip measurement taken by the
//! tracing layer sees the call's tags. The attribute layer runs after the
//! tracing layer so the client span exists by the time it is enriched.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use http::{Request, Response};
use opentelemetry::{
    trace::{SpanKind, Status, TraceContextExt, Tracer as _},
    KeyValue,
};
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_FULL,
};
use tower::Service;
use tower_layer::Layer;

use crate::{
    http_injector::{self, Propagation},
    metrics::Metrics,
    tags::{TagKey, TagMap},
    twirp::CallIdentity,
};

/// The fully instrumented client transport.
pub type Transport<S> = TagTransport<ClientTraceTransport<SpanAttributeTransport<S>>>;

/// Wraps `base` with tagging, client spans and span enrichment. Responses
/// and errors of `base` are returned unchanged.
pub fn wrap_transport<S>(
    tracer: Tracer,
    metrics: Metrics,
    propagation: Propagation,
    base: S,
) -> Transport<S> {
    let traced = ClientTraceLayer::new(tracer, metrics, propagation)
        .layer(SpanAttributeLayer.layer(base));
    TagLayer.layer(traced)
}

fn call_identity<B>(request: &Request<B>) -> CallIdentity {
    request
        .extensions()
        .get::<CallIdentity>()
        .cloned()
        .unwrap_or_default()
}

/// Copies the call identity into the request's [`TagMap`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TagLayer;

impl<S> Layer<S> for TagLayer {
    type Service = TagTransport<S>;

    fn layer(&self, service: S) -> Self::Service {
        TagTransport { service }
    }
}

#[derive(Clone, Debug)]
pub struct TagTransport<S> {
    service: S,
}

impl<S, B> Service<Request<B>> for TagTransport<S>
where
    S: Service<Request<B>>,
{
    type Error = S::Error;
    type Future = S::Future;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let identity = call_identity(&request);

        TagMap::update_in(request.extensions_mut(), |tags| {
            tags.insert(TagKey::Package, identity.package().unwrap_or_default())
                .insert(TagKey::Service, identity.service().unwrap_or_default())
                .insert(TagKey::Method, identity.method().unwrap_or_default());
        });

        self.service.call(request)
    }
}

/// Adds the call identity to the client span once it exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanAttributeLayer;

impl<S> Layer<S> for SpanAttributeLayer {
    type Service = SpanAttributeTransport<S>;

    fn layer(&self, service: S) -> Self::Service {
        SpanAttributeTransport { service }
    }
}

#[derive(Clone, Debug)]
pub struct SpanAttributeTransport<S> {
    service: S,
}

impl<S, B> Service<Request<B>> for SpanAttributeTransport<S>
where
    S: Service<Request<B>>,
{
    type Error = S::Error;
    type Future = S::Future;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        match request.extensions().get::<opentelemetry::Context>() {
            Some(context) if context.has_active_span() => {
                let identity = call_identity(&request);
                let span = context.span();
                for (key, value) in [
                    (TagKey::Package, identity.package()),
                    (TagKey::Service, identity.service()),
                    (TagKey::Method, identity.method()),
                ] {
                    span.set_attribute(key.attribute(value.unwrap_or_default()));
                }
            }
            _ => tracing::debug!("no client span to enrich"),
        }

        self.service.call(request)
    }
}

/// Starts a client span covering the whole round trip, propagates it in the
/// request headers and records the round-trip latency.
#[derive(Clone, Debug)]
pub struct ClientTraceLayer {
    tracer: Tracer,
    metrics: Metrics,
    propagation: Propagation,
}

impl ClientTraceLayer {
    pub fn new(tracer: Tracer, metrics: Metrics, propagation: Propagation) -> Self {
        Self {
            tracer,
            metrics,
            propagation,
        }
    }
}

impl<S> Layer<S> for ClientTraceLayer {
    type Service = ClientTraceTransport<S>;

    fn layer(&self, service: S) -> Self::Service {
        ClientTraceTransport {
            service,
            tracer: self.tracer.clone(),
            metrics: self.metrics.clone(),
            propagation: self.propagation.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientTraceTransport<S> {
    service: S,
    tracer: Tracer,
    metrics: Metrics,
    propagation: Propagation,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ClientTraceTransport<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + 'static,
    ResBody: 'static,
{
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let parent = request
            .extensions()
            .get::<opentelemetry::Context>()
            .cloned()
            .unwrap_or_else(opentelemetry::Context::current);

        let span = self
            .tracer
            .span_builder(request.uri().path().to_owned())
            .with_kind(SpanKind::Client)
            .with_attributes([
                KeyValue::new(HTTP_REQUEST_METHOD, request.method().to_string()),
                KeyValue::new(URL_FULL, request.uri().to_string()),
            ])
            .start_with_context(&self.tracer, &parent);
        let context = parent.with_span(span);

        http_injector::inject_context_into_request(&self.propagation, &context, &mut request);
        request.extensions_mut().insert(context.clone());

        let mut tags = request
            .extensions()
            .get::<TagMap>()
            .cloned()
            .unwrap_or_default();
        let metrics = self.metrics.clone();
        let start = Instant::now();
        let future = self.service.call(request);

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
                    if status.is_client_error() || status.is_server_error() {
                        span.set_status(Status::error(status.to_string()));
                    }
                    tags.insert(TagKey::Status, status.as_str());
                }
                Err(err) => span.set_status(Status::error(err.to_string())),
            }
            span.end();

            // a failed round trip has no status
            tags.fill_missing(&TagKey::ALL);
            metrics.record_client_roundtrip(&tags, start.elapsed());

            result
        })
    }
}
