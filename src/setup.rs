use std::{env, time::Duration};

use opentelemetry::{
    global, metrics::MetricsError, metrics::MeterProvider as _, trace::TraceError, KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    propagation::TraceContextPropagator,
    runtime,
    trace::{Sampler, Tracer},
    Resource,
};
use tracing_core::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Registry,
};

use crate::{
    metrics::{LatencyAggregation, Metrics, ViewDefinition, ViewError},
    telemetry::Telemetry,
};

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to install the trace pipeline")]
    Trace(#[from] TraceError),
    #[error("failed to install the metric pipeline")]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("a global tracing subscriber is already installed")]
    Subscriber(#[from] TryInitError),
}

/// Wire format used to propagate trace context between processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PropagatorKind {
    #[default]
    Jaeger,
    TraceContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub endpoint: String,
    pub metric_interval: Duration,
    /// Fraction of new traces to sample. `None` samples everything.
    pub sampling_ratio: Option<f64>,
    pub propagator: PropagatorKind,
    rejected: Vec<RejectedVar>,
}

/// An environment variable whose value could not be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedVar {
    pub name: &'static str,
    pub value: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_owned(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            metric_interval: DEFAULT_METRIC_INTERVAL,
            sampling_ratio: None,
            propagator: PropagatorKind::default(),
            rejected: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Reads the configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SERVICE_NAME` | the crate name |
    /// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` |
    /// | `OTEL_METRIC_EXPORT_INTERVAL` | `1000` (ms) |
    /// | `OTEL_TRACES_SAMPLER_ARG` | unset, sample everything |
    /// | `OTEL_PROPAGATORS` | `jaeger` (or `tracecontext`) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(service_name) = lookup("SERVICE_NAME") {
            config.service_name = service_name;
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(interval) = lookup("OTEL_METRIC_EXPORT_INTERVAL") {
            match interval.parse::<u64>() {
                Ok(millis) if millis > 0 => config.metric_interval = Duration::from_millis(millis),
                _ => config.reject("OTEL_METRIC_EXPORT_INTERVAL", interval),
            }
        }
        if let Some(ratio) = lookup("OTEL_TRACES_SAMPLER_ARG") {
            match ratio.parse::<f64>() {
                Ok(parsed) if (0.0..=1.0).contains(&parsed) => {
                    config.sampling_ratio = Some(parsed)
                }
                _ => config.reject("OTEL_TRACES_SAMPLER_ARG", ratio),
            }
        }
        if let Some(propagator) = lookup("OTEL_PROPAGATORS") {
            match propagator.trim().to_ascii_lowercase().as_str() {
                "jaeger" => config.propagator = PropagatorKind::Jaeger,
                "tracecontext" => config.propagator = PropagatorKind::TraceContext,
                _ => config.reject("OTEL_PROPAGATORS", propagator),
            }
        }

        config
    }

    fn reject(&mut self, name: &'static str, value: String) {
        self.rejected.push(RejectedVar { name, value });
    }

    /// Variables that were set to unusable values and replaced by defaults.
    /// [`setup`] logs them once logging is installed.
    pub fn rejected(&self) -> &[RejectedVar] {
        &self.rejected
    }

    fn resource(&self) -> Resource {
        Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            self.service_name.clone(),
        )])
    }

    fn sampler(&self) -> Sampler {
        match self.sampling_ratio {
            Some(ratio) => Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio))),
            None => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
        }
    }
}

/// Keeps the exporters alive. Call [`TelemetryGuard::teardown`] before the
/// process exits so buffered spans and metrics are flushed.
#[derive(Debug)]
pub struct TelemetryGuard {
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    pub fn teardown(self) {
        if let Err(err) = self.meter_provider.shutdown() {
            tracing::warn!(%err, "failed to shut down the meter provider");
        }
        global::shutdown_tracer_provider();
        tracing::info!("telemetry shut down");
    }
}

/// Sets up tracing, metrics and logging via otlp exporter and registers the
/// given metric views.
///
/// This should generally be the first statement of any server binary's main
/// function. It has to be called from within a tokio runtime and must only be
/// called once per process.
pub fn setup(
    config: &TelemetryConfig,
    views: &[ViewDefinition],
) -> Result<(Telemetry, TelemetryGuard), SetupError> {
    init_propagator(config.propagator);
    let tracer = init_tracer(config)?;
    let meter_provider = init_metrics(config)?;
    let metrics = Metrics::register(&meter_provider.meter(config.service_name.clone()), views)?;

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer.clone()))
        .try_init()?;

    for var in config.rejected() {
        tracing::warn!(
            var = var.name,
            value = %var.value,
            "ignoring invalid value, using default"
        );
    }
    tracing::info!(
        service = %config.service_name,
        endpoint = %config.endpoint,
        views = views.len(),
        "telemetry initialized"
    );

    Ok((
        Telemetry::new(tracer, metrics),
        TelemetryGuard { meter_provider },
    ))
}

fn init_propagator(kind: PropagatorKind) {
    match kind {
        PropagatorKind::Jaeger => {
            global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new())
        }
        PropagatorKind::TraceContext => {
            global::set_text_map_propagator(TraceContextPropagator::new())
        }
    }
}

fn init_tracer(config: &TelemetryConfig) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.endpoint.clone()),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_resource(config.resource())
                .with_sampler(config.sampler()),
        )
        .install_batch(runtime::Tokio)
}

fn init_metrics(config: &TelemetryConfig) -> Result<SdkMeterProvider, MetricsError> {
    opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.endpoint.clone()),
        )
        .with_resource(config.resource())
        .with_period(config.metric_interval)
        .with_aggregation_selector(LatencyAggregation)
        .build()
}
