//! Single instrumented HTTP server.
//!
//! Serves `GET /api/time/:input` on port 3000. Every request passes
//! through a middleware span with a hit counter; the time handler
//! starts a child span, validates the input, and answers with the
//! current timestamp.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use opentelemetry::{
    global::{self, BoxedTracer},
    metrics::Counter,
    trace::{Span, SpanKind, TraceContextExt, Tracer},
    Context, KeyValue,
};
use tokio::net::TcpListener;
use tracing::info;

const TIME_PREFIX: &str = "/api/time/";

fn get_tracer() -> &'static BoxedTracer {
    static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
    TRACER.get_or_init(|| global::tracer("time-server"))
}

// Built per request so the instrument follows the currently registered
// meter provider; the SDK deduplicates the underlying stream by name.
fn middleware_hits() -> Counter<u64> {
    global::meter("time-server")
        .u64_counter("api_middleware_hits")
        .with_description("Requests passing through the api middleware")
        .build()
}

#[derive(Debug, thiserror::Error)]
#[error("input does not contain \"hello\"")]
struct InputValidation;

/// Child span around the actual time lookup. Records an error on the
/// span when the input fails validation, but still answers 200 like
/// the rest of the demo endpoints.
fn time_response<T: Tracer>(tracer: &T, parent_cx: &Context, url: &str, input: &str) -> String {
    let started = Instant::now();
    let mut span = tracer
        .span_builder("time_handle")
        .with_kind(SpanKind::Internal)
        .with_attributes(vec![KeyValue::new("url", url.to_string())])
        .start_with_context(tracer, parent_cx);

    span.add_event("input validation", vec![]);
    if !input.contains("hello") {
        span.record_error(&InputValidation);
    }

    let body = format!("OK {}", chrono::Utc::now().to_rfc3339());
    span.set_attribute(KeyValue::new(
        "process.time",
        format!("{:?}", started.elapsed()),
    ));
    span.end();
    body
}

fn plain_text(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::new(
        Full::new(Bytes::from(body))
            .map_err(|err| match err {})
            .boxed(),
    )
}

async fn router<B>(req: Request<B>) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let tracer = get_tracer();
    let span = tracer
        .span_builder("api_middleware")
        .with_kind(SpanKind::Server)
        .start(tracer);
    let cx = Context::current_with_span(span);

    cx.span().add_event("before dispatch", vec![]);
    middleware_hits().add(1, &[]);

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, path) if path.strip_prefix(TIME_PREFIX).is_some_and(|s| !s.is_empty()) => {
            let input = &path[TIME_PREFIX.len()..];
            let url = req.uri().to_string();
            plain_text(time_response(tracer, &cx, &url, input))
        }
        _ => {
            cx.span()
                .set_attribute(KeyValue::new("http.response.status_code", 404));
            let mut not_found = Response::new(BoxBody::default());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };

    cx.span().add_event("after dispatch", vec![]);
    cx.span().end();
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use hyper_util::server::conn::auto::Builder;

    // Half of the root traces are kept, like the original demo.
    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("time-server")
            .with_sample_ratio(0.5)
            .from_env(),
    )?;

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await?;
    info!(name: "listening", address = %addr, "time-server accepting connections");

    while let Ok((stream, _addr)) = listener.accept().await {
        if let Err(err) = Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service_fn(router))
            .await
        {
            eprintln!("{err}");
        }
    }

    guard.shutdown()?;
    Ok(())
}
