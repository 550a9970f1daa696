mod common;

use common::{
    attribute, call_tags, network, string_attribute, Harness, Hat, Network, Size, BASE_URL,
    PACKAGE, SERVICE,
};
use opentelemetry::{trace::SpanKind, Value};
use twirp_trace::{
    metrics::DEFAULT_LATENCY_DISTRIBUTION,
    middleware::tower::TraceService,
    twirp::{Client, ErrorCode, Server},
};

fn client(harness: &Harness) -> Client<Network<TraceService<Server>>> {
    let server = common::haberdasher(harness.telemetry.server_hooks());
    Client::new(
        BASE_URL,
        PACKAGE,
        SERVICE,
        network(harness.telemetry.wrap_handler(server)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn valid_size_records_nested_spans_and_latency() {
    let harness = Harness::new();

    let hat: Hat = client(&harness)
        .call("MakeHat", &Size { inches: 10 })
        .await
        .unwrap();
    assert_eq!(hat.inches, 10);

    let spans = harness.finished_spans();
    assert_eq!(spans.len(), 2);
    let (inner, outer) = (&spans[0], &spans[1]);

    assert_eq!(outer.name, "/twirp/twirp.example.Haberdasher/MakeHat");
    assert_eq!(outer.span_kind, SpanKind::Server);
    assert_eq!(
        attribute(outer, "http.response.status_code"),
        Some(Value::I64(200))
    );

    assert_eq!(inner.name, "twirp.example.Haberdasher");
    assert_eq!(inner.span_kind, SpanKind::Server);
    assert_eq!(inner.parent_span_id, outer.span_context.span_id());
    assert_eq!(inner.span_context.trace_id(), outer.span_context.trace_id());
    assert_eq!(string_attribute(inner, "twirp.package").as_deref(), Some(PACKAGE));
    assert_eq!(string_attribute(inner, "twirp.service").as_deref(), Some(SERVICE));
    assert_eq!(string_attribute(inner, "twirp.method").as_deref(), Some("MakeHat"));
    assert_eq!(string_attribute(inner, "twirp.status").as_deref(), Some("200"));

    harness.flush_metrics();
    assert_eq!(harness.histogram_count("twirp.server.latency"), 1);
    assert_eq!(harness.counter_value("twirp.server.response_count"), 1);
    assert_eq!(harness.histogram_count("twirp.client.roundtrip_latency"), 0);

    let expected = [call_tags("MakeHat", "200")];
    assert_eq!(harness.data_point_tags("twirp.server.latency"), expected);
    assert_eq!(harness.data_point_tags("twirp.server.response_count"), expected);
    assert_eq!(
        harness.histogram_bounds("twirp.server.latency"),
        DEFAULT_LATENCY_DISTRIBUTION
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn invalid_size_records_error_status() {
    let harness = Harness::new();

    let err = client(&harness)
        .call::<_, Hat>("MakeHat", &Size { inches: 0 })
        .await
        .unwrap_err();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.code, ErrorCode::InvalidArgument);
    assert_eq!(rpc.meta("argument"), Some("inches"));

    let spans = harness.finished_spans();
    assert_eq!(spans.len(), 2);
    let (inner, outer) = (&spans[0], &spans[1]);
    assert_eq!(
        attribute(outer, "http.response.status_code"),
        Some(Value::I64(400))
    );
    assert_eq!(string_attribute(inner, "twirp.status").as_deref(), Some("400"));
    assert_eq!(string_attribute(inner, "twirp.method").as_deref(), Some("MakeHat"));

    harness.flush_metrics();
    assert_eq!(harness.histogram_count("twirp.server.latency"), 1);
    let expected = [call_tags("MakeHat", "400")];
    assert_eq!(harness.data_point_tags("twirp.server.latency"), expected);
    assert_eq!(harness.data_point_tags("twirp.server.response_count"), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn unknown_method_still_ends_both_spans() {
    let harness = Harness::new();

    let err = client(&harness)
        .call::<_, Hat>("MakeScarf", &Size { inches: 10 })
        .await
        .unwrap_err();
    assert_eq!(err.as_rpc().unwrap().code, ErrorCode::BadRoute);

    let spans = harness.finished_spans();
    assert_eq!(spans.len(), 2);
    let (inner, outer) = (&spans[0], &spans[1]);
    assert_eq!(
        attribute(outer, "http.response.status_code"),
        Some(Value::I64(404))
    );
    assert_eq!(attribute(inner, "twirp.method"), None);
    assert_eq!(string_attribute(inner, "twirp.status").as_deref(), Some("404"));

    harness.flush_metrics();
    assert_eq!(harness.counter_value("twirp.server.response_count"), 1);
    assert_eq!(
        harness.data_point_tags("twirp.server.response_count"),
        [call_tags("", "404")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn concurrent_requests_get_independent_spans() {
    let harness = Harness::new();
    let client = client(&harness);

    let (small, large) = tokio::join!(
        client.call::<_, Hat>("MakeHat", &Size { inches: 0 }),
        client.call::<_, Hat>("MakeHat", &Size { inches: 12 }),
    );
    assert!(small.is_err());
    assert_eq!(large.unwrap().inches, 12);

    let spans = harness.finished_spans();
    assert_eq!(spans.len(), 4);
    let mut statuses: Vec<_> = spans
        .iter()
        .filter_map(|span| string_attribute(span, "twirp.status"))
        .collect();
    statuses.sort();
    assert_eq!(statuses, ["200", "400"]);

    harness.flush_metrics();
    assert_eq!(harness.counter_value("twirp.server.response_count"), 2);
    assert_eq!(harness.histogram_count("twirp.server.latency"), 2);
    assert_eq!(
        harness.data_point_tags("twirp.server.latency"),
        [call_tags("MakeHat", "200"), call_tags("MakeHat", "400")]
    );
}
