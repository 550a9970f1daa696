use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::trace::Tracer;
use tower_layer::Layer;

use crate::{
    hooks::HookSet,
    http_injector::Propagation,
    metrics::Metrics,
    middleware::{
        tower::{TraceLayer, TraceService},
        transport::{self, Transport},
    },
    twirp::ServerHooks,
};

/// Everything the instrumentation needs, created once at startup and handed
/// to each component explicitly.
///
/// [`setup::setup`](crate::setup::setup) builds one from the environment.
/// Tests build their own around in-memory exporters.
#[derive(Clone, Debug)]
pub struct Telemetry {
    tracer: Tracer,
    metrics: Metrics,
    propagation: Propagation,
}

impl Telemetry {
    pub fn new(tracer: Tracer, metrics: Metrics) -> Self {
        Self {
            tracer,
            metrics,
            propagation: Propagation::Global,
        }
    }

    /// Uses `propagator` instead of the globally installed one.
    pub fn with_propagator(
        mut self,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        self.propagation = Propagation::custom(propagator);
        self
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    /// Wraps a server handler so every request gets a transport level span.
    pub fn wrap_handler<S>(&self, handler: S) -> TraceService<S> {
        TraceLayer::new(self.tracer.clone(), self.propagation.clone()).layer(handler)
    }

    pub fn hook_set(&self) -> HookSet {
        HookSet::new(self.tracer.clone(), self.metrics.clone())
    }

    /// Server hooks opening the logical call span and recording latency.
    pub fn server_hooks(&self) -> ServerHooks {
        self.hook_set().into_server_hooks()
    }

    /// Wraps a client transport, see [`transport::wrap_transport`].
    pub fn wrap_transport<S>(&self, base: S) -> Transport<S> {
        transport::wrap_transport(
            self.tracer.clone(),
            self.metrics.clone(),
            self.propagation.clone(),
            base,
        )
    }
}
