//! One-shot client half of the twin demo.
//!
//! Starts a client span, carries a `user-id` baggage member, injects
//! both into the outgoing request headers, and calls the server on
//! port 3000. Pending telemetry is flushed by the guard shutdown
//! instead of a fixed sleep.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use opentelemetry::{
    baggage::BaggageExt,
    global,
    trace::{SpanKind, TraceContextExt, Tracer},
    Context, KeyValue,
};
use opentelemetry_http::HeaderInjector;
use tracing::info;

async fn send_request(url: &str) -> anyhow::Result<()> {
    let client = Client::builder(TokioExecutor::new()).build_http();
    let tracer = global::tracer("http-client");

    let span = tracer
        .span_builder("http_request")
        .with_kind(SpanKind::Client)
        .start(&tracer);
    let cx = Context::current_with_span(span)
        .with_baggage([KeyValue::new("user-id", "caiwenzhe")]);

    let mut req = hyper::Request::builder().uri(url);
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &cx,
            &mut HeaderInjector(req.headers_mut().expect("builder headers")),
        )
    });

    let res = client.request(req.body(Full::new(Bytes::new()))?).await?;
    cx.span().add_event(
        "response received",
        vec![KeyValue::new("status", res.status().to_string())],
    );

    let body = res.into_body().collect().await?.to_bytes();
    info!(name: "response_body", body = %String::from_utf8_lossy(&body), "server answered");

    cx.span().end();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("http-client")
            .with_node_name("single-node")
            .from_env(),
    )?;

    send_request("http://127.0.0.1:3000/").await?;

    // Traces are exported in the background; shutting the guard down
    // flushes them before the process exits.
    guard.shutdown()?;
    Ok(())
}
