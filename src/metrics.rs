//! Metric views recorded for twirp calls.
//!
//! A view is only collected once it has been registered through
//! [`Metrics::register`], which is meant to happen exactly once while the
//! process starts, before any traffic is served.
//!
//! Views aggregate one of two measurements: the latency of a served response
//! or the round trip latency seen by a client. A latency distribution view
//! records the latency into a histogram, a count view only counts
//! observations.

use std::{collections::HashSet, fmt, time::Duration};

use opentelemetry::{
    metrics::{Counter, Histogram, Meter, Unit},
    KeyValue,
};
use opentelemetry_sdk::metrics::{reader::AggregationSelector, Aggregation, InstrumentKind};

use crate::tags::{TagKey, TagMap};

/// Histogram bucket boundaries for latencies, in milliseconds.
pub const DEFAULT_LATENCY_DISTRIBUTION: [f64; 34] = [
    1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 13.0, 16.0, 20.0, 25.0, 30.0, 40.0, 50.0, 65.0, 80.0,
    100.0, 130.0, 160.0, 200.0, 250.0, 300.0, 400.0, 500.0, 650.0, 800.0, 1000.0, 2000.0, 5000.0,
    10000.0, 20000.0, 50000.0, 100000.0,
];

/// What a view observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Measure {
    /// Latency of every response a server sends.
    ServerLatency,
    /// End-to-end latency of every client call.
    ClientRoundtripLatency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewAggregation {
    /// Histogram over [`DEFAULT_LATENCY_DISTRIBUTION`].
    LatencyDistribution,
    Count,
}

/// Static description of one measurement stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub measure: Measure,
    pub aggregation: ViewAggregation,
    /// Tags recorded with every observation; any other tag is dropped.
    pub tag_keys: &'static [TagKey],
}

/// Latency distribution of served requests.
pub const SERVER_LATENCY_VIEW: ViewDefinition = ViewDefinition {
    name: "twirp.server.latency",
    description: "Latency distribution of HTTP requests",
    unit: "ms",
    measure: Measure::ServerLatency,
    aggregation: ViewAggregation::LatencyDistribution,
    tag_keys: &TagKey::ALL,
};

/// Number of responses sent.
pub const SERVER_RESPONSE_VIEW: ViewDefinition = ViewDefinition {
    name: "twirp.server.response_count",
    description: "Server response count",
    unit: "1",
    measure: Measure::ServerLatency,
    aggregation: ViewAggregation::Count,
    tag_keys: &TagKey::ALL,
};

/// End-to-end latency as seen by the client.
pub const CLIENT_ROUNDTRIP_LATENCY_VIEW: ViewDefinition = ViewDefinition {
    name: "twirp.client.roundtrip_latency",
    description: "End-to-end latency",
    unit: "ms",
    measure: Measure::ClientRoundtripLatency,
    aggregation: ViewAggregation::LatencyDistribution,
    tag_keys: &TagKey::ALL,
};

pub const SERVER_VIEWS: [ViewDefinition; 2] = [SERVER_LATENCY_VIEW, SERVER_RESPONSE_VIEW];

pub const CLIENT_VIEWS: [ViewDefinition; 1] = [CLIENT_ROUNDTRIP_LATENCY_VIEW];

pub const ALL_VIEWS: [ViewDefinition; 3] = [
    SERVER_LATENCY_VIEW,
    SERVER_RESPONSE_VIEW,
    CLIENT_ROUNDTRIP_LATENCY_VIEW,
];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    #[error("metric view {0:?} is registered more than once")]
    Duplicate(&'static str),
}

#[derive(Clone)]
enum Instrument {
    Latency(Histogram<f64>),
    Count(Counter<u64>),
}

#[derive(Clone)]
struct RegisteredView {
    definition: ViewDefinition,
    instrument: Instrument,
}

impl RegisteredView {
    fn record(&self, tags: &TagMap, elapsed: Duration) {
        let attributes = tags.select(self.definition.tag_keys);
        match &self.instrument {
            Instrument::Latency(histogram) => histogram.record(millis(elapsed), &attributes),
            Instrument::Count(counter) => counter.add(1, &attributes),
        }
    }
}

/// Instruments for the registered views.
///
/// Recording a measure no registered view observes is a no-op.
#[derive(Clone, Default)]
pub struct Metrics {
    views: Vec<RegisteredView>,
}

impl Metrics {
    pub fn register(meter: &Meter, views: &[ViewDefinition]) -> Result<Self, ViewError> {
        let mut seen = HashSet::new();
        let mut registered = Vec::with_capacity(views.len());

        for view in views {
            if !seen.insert(view.name) {
                return Err(ViewError::Duplicate(view.name));
            }

            let instrument = match view.aggregation {
                ViewAggregation::LatencyDistribution => Instrument::Latency(
                    meter
                        .f64_histogram(view.name)
                        .with_description(view.description)
                        .with_unit(Unit::new(view.unit))
                        .init(),
                ),
                ViewAggregation::Count => Instrument::Count(
                    meter
                        .u64_counter(view.name)
                        .with_description(view.description)
                        .with_unit(Unit::new(view.unit))
                        .init(),
                ),
            };
            registered.push(RegisteredView {
                definition: *view,
                instrument,
            });
        }

        tracing::debug!(views = ?seen, "registered metric views");
        Ok(Self { views: registered })
    }

    /// Metrics with no registered views.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Names of the registered views, in registration order.
    pub fn view_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.views.iter().map(|view| view.definition.name)
    }

    /// Records one served response and its latency.
    pub fn record_server_response(&self, tags: &TagMap, elapsed: Duration) {
        self.record(Measure::ServerLatency, tags, elapsed);
    }

    pub fn record_client_roundtrip(&self, tags: &TagMap, elapsed: Duration) {
        self.record(Measure::ClientRoundtripLatency, tags, elapsed);
    }

    fn record(&self, measure: Measure, tags: &TagMap, elapsed: Duration) {
        self.views
            .iter()
            .filter(|view| view.definition.measure == measure)
            .for_each(|view| view.record(tags, elapsed));
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.view_names()).finish()
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Aggregates every histogram into [`DEFAULT_LATENCY_DISTRIBUTION`] buckets.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatencyAggregation;

impl AggregationSelector for LatencyAggregation {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        match kind {
            InstrumentKind::Histogram => Aggregation::ExplicitBucketHistogram {
                boundaries: DEFAULT_LATENCY_DISTRIBUTION.to_vec(),
                record_min_max: true,
            },
            InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Aggregation::LastValue,
            _ => Aggregation::Sum,
        }
    }
}
