#![allow(dead_code)]

use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use http::{Request, Response};
use opentelemetry::{metrics::MeterProvider as _, trace::TracerProvider as _, Value};
use opentelemetry_sdk::{
    export::trace::SpanData,
    metrics::{data, PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    runtime,
    testing::{
        metrics::{InMemoryMetricsExporter, InMemoryMetricsExporterBuilder},
        trace::InMemorySpanExporter,
    },
    trace::{self, Sampler, TracerProvider},
    AttributeSet,
};
use serde::{Deserialize, Serialize};
use tower::{Service, ServiceExt};
use twirp_trace::{
    metrics::{LatencyAggregation, Metrics, ALL_VIEWS},
    twirp::{RpcError, Server, ServerHooks},
    Telemetry,
};

pub const PACKAGE: &str = "twirp.example";
pub const SERVICE: &str = "Haberdasher";
pub const BASE_URL: &str = "http://haberdasher.test";

#[derive(Debug, Serialize, Deserialize)]
pub struct Size {
    pub inches: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hat {
    pub inches: i32,
    pub color: String,
    pub name: String,
}

pub async fn make_hat(size: Size) -> Result<Hat, RpcError> {
    if size.inches <= 0 {
        return Err(RpcError::invalid_argument(
            "inches",
            "I can't make a hat that small!",
        ));
    }

    Ok(Hat {
        inches: size.inches,
        color: "blue".to_owned(),
        name: "bowler".to_owned(),
    })
}

pub fn haberdasher(hooks: ServerHooks) -> Server {
    Server::new(PACKAGE, SERVICE)
        .method("MakeHat", make_hat)
        .with_hooks(hooks)
}

/// Forwards only what would cross the wire: method, uri, headers and body.
/// Request extensions of the caller do not reach the server.
#[derive(Clone, Debug)]
pub struct Network<S> {
    server: S,
}

pub fn network<S>(server: S) -> Network<S> {
    Network { server }
}

impl<S> Service<Request<Vec<u8>>> for Network<S>
where
    S: Service<Request<Vec<u8>>, Response = Response<Vec<u8>>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = Response<Vec<u8>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Vec<u8>>) -> Self::Future {
        let server = self.server.clone();
        let (parts, body) = request.into_parts();
        let mut hop = Request::new(body);
        *hop.method_mut() = parts.method;
        *hop.uri_mut() = parts.uri;
        *hop.headers_mut() = parts.headers;
        Box::pin(async move { server.oneshot(hop).await })
    }
}

/// Telemetry wired to in-memory exporters.
pub struct Harness {
    pub telemetry: Telemetry,
    span_exporter: InMemorySpanExporter,
    tracer_provider: TracerProvider,
    metrics_exporter: InMemoryMetricsExporter,
    meter_provider: SdkMeterProvider,
}

impl Harness {
    /// Needs a multi threaded tokio runtime for [`Harness::flush_metrics`].
    pub fn new() -> Self {
        let span_exporter = InMemorySpanExporter::default();
        let tracer_provider = TracerProvider::builder()
            .with_simple_exporter(span_exporter.clone())
            .with_config(trace::config().with_sampler(Sampler::AlwaysOn))
            .build();

        let metrics_exporter = InMemoryMetricsExporterBuilder::new()
            .with_aggregation_selector(LatencyAggregation)
            .build();
        let reader = PeriodicReader::builder(metrics_exporter.clone(), runtime::Tokio).build();
        let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();

        let metrics = Metrics::register(&meter_provider.meter("twirp-trace-test"), &ALL_VIEWS)
            .expect("views are distinct");
        let telemetry = Telemetry::new(tracer_provider.tracer("twirp-trace-test"), metrics)
            .with_propagator(TraceContextPropagator::new());

        Self {
            telemetry,
            span_exporter,
            tracer_provider,
            metrics_exporter,
            meter_provider,
        }
    }

    /// Spans in the order they ended.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        for result in self.tracer_provider.force_flush() {
            result.expect("flush spans");
        }
        self.span_exporter
            .get_finished_spans()
            .expect("finished spans")
    }

    pub fn flush_metrics(&self) {
        self.meter_provider.force_flush().expect("flush metrics");
    }

    /// Number of observations recorded by the histogram `name`, summed over
    /// every attribute set.
    pub fn histogram_count(&self, name: &str) -> u64 {
        self.latest_metric(name, |aggregation| {
            aggregation
                .downcast_ref::<data::Histogram<f64>>()
                .map(|histogram| histogram.data_points.iter().map(|dp| dp.count).sum())
        })
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.latest_metric(name, |aggregation| {
            aggregation
                .downcast_ref::<data::Sum<u64>>()
                .map(|sum| sum.data_points.iter().map(|dp| dp.value).sum())
        })
    }

    /// Tags of every data point of the metric `name`, sorted.
    pub fn data_point_tags(&self, name: &str) -> Vec<Tags> {
        let exported = self
            .metrics_exporter
            .get_finished_metrics()
            .expect("finished metrics");
        let Some(latest) = exported.last() else {
            return Vec::new();
        };

        let mut points: Vec<Tags> = latest
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .filter(|metric| metric.name == name)
            .flat_map(|metric| {
                let aggregation = metric.data.as_any();
                let mut sets: Vec<Tags> = Vec::new();
                if let Some(histogram) = aggregation.downcast_ref::<data::Histogram<f64>>() {
                    sets.extend(histogram.data_points.iter().map(|dp| tags(&dp.attributes)));
                }
                if let Some(sum) = aggregation.downcast_ref::<data::Sum<u64>>() {
                    sets.extend(sum.data_points.iter().map(|dp| tags(&dp.attributes)));
                }
                sets
            })
            .collect();
        points.sort();
        points
    }

    /// Bucket boundaries of the first data point of the histogram `name`.
    pub fn histogram_bounds(&self, name: &str) -> Vec<f64> {
        let exported = self
            .metrics_exporter
            .get_finished_metrics()
            .expect("finished metrics");
        exported
            .last()
            .into_iter()
            .flat_map(|resource| resource.scope_metrics.iter())
            .flat_map(|scope| scope.metrics.iter())
            .filter(|metric| metric.name == name)
            .filter_map(|metric| {
                metric
                    .data
                    .as_any()
                    .downcast_ref::<data::Histogram<f64>>()
            })
            .flat_map(|histogram| histogram.data_points.first())
            .map(|dp| dp.bounds.clone())
            .next()
            .unwrap_or_default()
    }

    fn latest_metric(
        &self,
        name: &str,
        read: impl Fn(&dyn std::any::Any) -> Option<u64>,
    ) -> u64 {
        let exported = self
            .metrics_exporter
            .get_finished_metrics()
            .expect("finished metrics");
        let Some(latest) = exported.last() else {
            return 0;
        };

        latest
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .filter(|metric| metric.name == name)
            .filter_map(|metric| read(metric.data.as_any()))
            .sum()
    }
}

/// Key/value pairs of one data point, sorted by key.
pub type Tags = Vec<(String, String)>;

fn tags(attributes: &AttributeSet) -> Tags {
    let mut tags: Tags = attributes
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), value.as_str().into_owned()))
        .collect();
    tags.sort();
    tags
}

/// The full tag set of a Haberdasher call.
pub fn call_tags(method: &str, status: &str) -> Tags {
    vec![
        ("twirp.method".to_owned(), method.to_owned()),
        ("twirp.package".to_owned(), PACKAGE.to_owned()),
        ("twirp.service".to_owned(), SERVICE.to_owned()),
        ("twirp.status".to_owned(), status.to_owned()),
    ]
}

pub fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

pub fn string_attribute(span: &SpanData, key: &str) -> Option<String> {
    attribute(span, key).map(|value| value.as_str().into_owned())
}
