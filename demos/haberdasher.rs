//! An instrumented Haberdasher server and client talking to each other in one
//! process. Spans and metrics are exported to the collector configured
//! through `OTEL_EXPORTER_OTLP_ENDPOINT`.
//!
//! ```sh
//! OTEL_PROPAGATORS=tracecontext cargo run --example haberdasher
//! ```

use serde::{Deserialize, Serialize};
use twirp_trace::{
    metrics::ALL_VIEWS,
    setup::{setup, TelemetryConfig},
    twirp::{Client, RpcError, Server},
};

const COLORS: [&str; 5] = ["white", "black", "brown", "red", "blue"];
const NAMES: [&str; 4] = ["bowler", "baseball cap", "top hat", "derby"];

#[derive(Debug, Serialize, Deserialize)]
struct Size {
    inches: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hat {
    inches: i32,
    color: String,
    name: String,
}

async fn make_hat(size: Size) -> Result<Hat, RpcError> {
    if size.inches <= 0 {
        return Err(RpcError::invalid_argument(
            "inches",
            "I can't make a hat that small!",
        ));
    }

    let pick = size.inches.unsigned_abs() as usize;
    Ok(Hat {
        inches: size.inches,
        color: COLORS[pick % COLORS.len()].to_owned(),
        name: NAMES[pick % NAMES.len()].to_owned(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (telemetry, guard) = setup(&TelemetryConfig::from_env(), &ALL_VIEWS)?;

    let server = Server::new("twirp.example", "Haberdasher")
        .method("MakeHat", make_hat)
        .with_hooks(telemetry.server_hooks());
    let handler = telemetry.wrap_handler(server);

    let client = Client::new(
        "http://localhost:8080",
        "twirp.example",
        "Haberdasher",
        telemetry.wrap_transport(handler),
    );

    let mut hat = None;
    for inches in [12, 0, 7, 3, 9] {
        match client.call::<_, Hat>("MakeHat", &Size { inches }).await {
            Ok(made) => hat = Some(made),
            Err(err) => match err.as_rpc() {
                Some(rpc) if rpc.meta("retryable").is_some() => {
                    tracing::warn!(%err, "retrying");
                    continue;
                }
                _ => tracing::error!(%err, inches, "failed to make a hat"),
            },
        }
    }
    tracing::info!(?hat, "last hat");

    guard.teardown();
    Ok(())
}
