//! Instrumented HTTP server half of the twin demo.
//!
//! Listens on port 3000. Each request's trace context and baggage are
//! pulled out of the headers, the handler span is parented on the
//! remote client span, and received baggage members are surfaced as
//! span events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{service::service_fn, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use opentelemetry::{
    baggage::BaggageExt,
    global::{self, BoxedTracer},
    metrics::Counter,
    trace::{Span, SpanKind, Tracer},
    Context, KeyValue,
};
use opentelemetry_http::HeaderExtractor;
use tokio::net::TcpListener;
use tracing::info;

fn get_tracer() -> &'static BoxedTracer {
    static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
    TRACER.get_or_init(|| global::tracer("http-server"))
}

// Built per request so the instrument follows the currently registered
// meter provider; the SDK deduplicates the underlying stream by name.
fn index_hits() -> Counter<u64> {
    global::meter("http-server")
        .u64_counter("index_hits")
        .with_description("Requests answered by the index handler")
        .build()
}

/// Pulls trace context and baggage out of the incoming headers.
fn extract_context_from_request<B>(req: &Request<B>) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(req.headers()))
    })
}

/// Handler span parented on the remote client span. Baggage members
/// are not attached to telemetry automatically; this surfaces each one
/// as an event the way the Go original logged the baggage string.
fn index_response<T: Tracer>(tracer: &T, parent_cx: &Context, url: &str) -> String {
    let started = Instant::now();
    let mut span = tracer
        .span_builder("handle_index")
        .with_kind(SpanKind::Server)
        .with_attributes(vec![KeyValue::new("url", url.to_string())])
        .start_with_context(tracer, parent_cx);

    span.add_event("request received", vec![]);
    for (key, (value, _metadata)) in parent_cx.baggage() {
        span.add_event(
            "baggage member",
            vec![KeyValue::new(key.clone(), value.clone())],
        );
    }

    index_hits().add(1, &[]);

    let body = chrono::Utc::now().to_rfc3339();
    span.set_attribute(KeyValue::new(
        "process.time",
        format!("{:?}", started.elapsed()),
    ));
    span.end();
    body
}

async fn handle<B>(req: Request<B>) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let parent_cx = extract_context_from_request(&req);
    let url = req.uri().to_string();
    let body = index_response(get_tracer(), &parent_cx, &url);

    Ok(Response::new(
        Full::new(Bytes::from(body))
            .map_err(|err| match err {})
            .boxed(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use hyper_util::server::conn::auto::Builder;

    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("http-server")
            .with_node_name("single-node")
            .from_env(),
    )?;

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await?;
    info!(name: "listening", address = %addr, "http-server accepting connections");

    while let Ok((stream, _addr)) = listener.accept().await {
        if let Err(err) = Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service_fn(handle))
            .await
        {
            eprintln!("{err}");
        }
    }

    guard.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::propagation::TextMapCompositePropagator;
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry::trace::{TraceContextExt, TracerProvider};
    use opentelemetry_http::HeaderInjector;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};
    use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    fn counter_sum(exporter: &InMemoryMetricExporter, name: &str) -> u64 {
        exporter
            .get_finished_metrics()
            .expect("finished metrics")
            .iter()
            .flat_map(|rm| rm.scope_metrics())
            .flat_map(|sm| sm.metrics())
            .filter(|metric| metric.name() == name)
            .map(|metric| match metric.data() {
                AggregatedMetrics::U64(MetricData::Sum(sum)) => {
                    sum.data_points().map(|dp| dp.value()).sum::<u64>()
                }
                _ => 0,
            })
            .sum()
    }

    fn composite() -> TextMapCompositePropagator {
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ])
    }

    #[test]
    fn server_span_joins_the_client_trace_and_sees_baggage() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("test");
        let propagator = composite();

        // Client side: span + baggage injected into request headers.
        let client_span = tracer
            .span_builder("client")
            .with_kind(SpanKind::Client)
            .start(&tracer);
        let client_cx = Context::current_with_span(client_span)
            .with_baggage([KeyValue::new("user-id", "caiwenzhe")]);
        let client_trace_id = client_cx.span().span_context().trace_id();

        let mut req = Request::builder().uri("http://127.0.0.1:3000/");
        propagator.inject_context(
            &client_cx,
            &mut HeaderInjector(req.headers_mut().expect("builder headers")),
        );
        let req = req.body(()).expect("request");
        client_cx.span().end();

        // Server side.
        let parent_cx = propagator.extract(&HeaderExtractor(req.headers()));
        let body = index_response(&tracer, &parent_cx, &req.uri().to_string());
        assert!(!body.is_empty());

        let spans = exporter.get_finished_spans().expect("finished spans");
        let server_span = spans
            .iter()
            .find(|s| s.name == "handle_index")
            .expect("server span recorded");
        assert_eq!(server_span.span_context.trace_id(), client_trace_id);
        assert!(server_span
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "url"));
        assert!(server_span.events.iter().any(|e| {
            e.name == "baggage member"
                && e.attributes
                    .iter()
                    .any(|kv| kv.key.as_str() == "user-id")
        }));
    }

    #[test]
    fn index_response_without_propagation_starts_a_new_trace() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("test");

        index_response(&tracer, &Context::new(), "http://127.0.0.1:3000/");

        let spans = exporter.get_finished_spans().expect("finished spans");
        assert_eq!(spans.len(), 1);
        assert!(spans[0].parent_span_id == opentelemetry::trace::SpanId::INVALID);
        assert!(spans[0]
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "process.time"));
    }

    #[test]
    fn index_response_bumps_the_index_hit_counter() {
        let metric_exporter = InMemoryMetricExporter::default();
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter.clone())
            .build();
        global::set_meter_provider(meter_provider.clone());

        let span_exporter = InMemorySpanExporter::default();
        let tracer_provider = SdkTracerProvider::builder()
            .with_simple_exporter(span_exporter)
            .build();
        let tracer = tracer_provider.tracer("test");

        index_response(&tracer, &Context::new(), "http://127.0.0.1:3000/");

        meter_provider.force_flush().expect("flush");
        // Other tests share the global meter provider, so at least one
        // hit must be visible rather than exactly one.
        assert!(counter_sum(&metric_exporter, "index_hits") >= 1);
    }
}
