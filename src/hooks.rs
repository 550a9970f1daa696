//! Server hooks opening one span per twirp call and recording its latency.
//!
//! The span is started when the request is received, learns its method when
//! the request is routed, and is ended together with the latency measurement
//! when the response is sent. Routing may fail before a method is known; in
//! that case the span and the measurement simply carry an empty method.

use std::{sync::Arc, time::Instant};

use opentelemetry::{
    trace::{SpanKind, TraceContextExt, Tracer as _},
    Context,
};
use opentelemetry_sdk::trace::Tracer;

use crate::{
    metrics::Metrics,
    tags::{TagKey, TagMap},
    twirp::{RpcContext, RpcError, ServerHooks},
};

/// Per-request state, created when the request is received and consumed when
/// the response is sent.
#[derive(Clone)]
struct HookState {
    start_time: Instant,
    span: Context,
}

/// Span and metric instrumentation for twirp servers.
#[derive(Clone, Debug)]
pub struct HookSet {
    tracer: Tracer,
    metrics: Metrics,
}

impl HookSet {
    pub fn new(tracer: Tracer, metrics: Metrics) -> Self {
        Self { tracer, metrics }
    }

    /// Registers the three lifecycle callbacks.
    pub fn into_server_hooks(self) -> ServerHooks {
        let hooks = Arc::new(self);
        let received = hooks.clone();
        let routed = hooks.clone();

        ServerHooks::new()
            .on_request_received(move |ctx| received.request_received(ctx))
            .on_request_routed(move |ctx| routed.request_routed(ctx))
            .on_response_sent(move |ctx| hooks.response_sent(ctx))
    }

    pub fn request_received(&self, ctx: &mut RpcContext) -> Result<(), RpcError> {
        if ctx.extensions().get::<HookState>().is_some() {
            tracing::debug!("request already has an active twirp span");
            return Ok(());
        }

        // the method is not known until the request is routed
        let package = ctx.package_name().unwrap_or_default().to_owned();
        let service = ctx.service_name().unwrap_or_default().to_owned();

        TagMap::update_in(ctx.extensions_mut(), |tags| {
            tags.insert(TagKey::Package, package.as_str())
                .insert(TagKey::Service, service.as_str());
        });

        let parent = ctx
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(Context::current);
        let span = self
            .tracer
            .span_builder(format!("{package}.{service}"))
            .with_kind(SpanKind::Server)
            .with_attributes([
                TagKey::Package.attribute(package),
                TagKey::Service.attribute(service),
            ])
            .start_with_context(&self.tracer, &parent);
        let span = parent.with_span(span);

        ctx.extensions_mut().insert(span.clone());
        ctx.extensions_mut().insert(HookState {
            start_time: Instant::now(),
            span,
        });

        Ok(())
    }

    pub fn request_routed(&self, ctx: &mut RpcContext) -> Result<(), RpcError> {
        let Some(state) = ctx.extensions().get::<HookState>() else {
            tracing::debug!("request routed without an active twirp span");
            return Ok(());
        };

        let method = ctx.method_name().unwrap_or_default().to_owned();
        state
            .span
            .span()
            .set_attribute(TagKey::Method.attribute(method.as_str()));

        TagMap::update_in(ctx.extensions_mut(), |tags| {
            tags.insert(TagKey::Method, method);
        });

        Ok(())
    }

    pub fn response_sent(&self, ctx: &mut RpcContext) {
        let status = ctx.status_code().unwrap_or_default().to_owned();

        TagMap::update_in(ctx.extensions_mut(), |tags| {
            tags.insert(TagKey::Status, status.as_str())
                .fill_missing(&TagKey::ALL);
        });

        let Some(state) = ctx.extensions_mut().remove::<HookState>() else {
            tracing::debug!("response sent without an active twirp span");
            return;
        };

        let span = state.span.span();
        span.set_attribute(TagKey::Status.attribute(status));
        span.end();

        let elapsed = state.start_time.elapsed();
        let tags = ctx.extensions().get::<TagMap>().cloned().unwrap_or_default();
        self.metrics.record_server_response(&tags, elapsed);
    }
}
