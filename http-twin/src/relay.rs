//! Middle hop of the twin demo.
//!
//! Listens on port 3001; every request starts a span, adds the
//! `user-id` baggage member, injects context + baggage into a
//! downstream call to the server on port 3000, and relays the
//! downstream body back to the caller.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{service::service_fn, Request, Response, StatusCode};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo},
};
use opentelemetry::{
    baggage::BaggageExt,
    global::{self, BoxedTracer},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context, KeyValue,
};
use opentelemetry_http::HeaderInjector;
use tokio::net::TcpListener;
use tracing::info;

const DOWNSTREAM: &str = "http://127.0.0.1:3000/";

fn get_tracer() -> &'static BoxedTracer {
    static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
    TRACER.get_or_init(|| global::tracer("http-relay"))
}

async fn relay<B>(_req: Request<B>) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let tracer = get_tracer();
    let span = tracer
        .span_builder("relay_downstream")
        .with_kind(SpanKind::Client)
        .start(tracer);
    let cx = Context::current_with_span(span)
        .with_baggage([KeyValue::new("user-id", "caiwenzhe")]);

    let mut downstream = hyper::Request::builder().uri(DOWNSTREAM);
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &cx,
            &mut HeaderInjector(downstream.headers_mut().expect("builder headers")),
        )
    });

    let client = Client::builder(TokioExecutor::new()).build_http();
    let body = match downstream.body(Full::new(Bytes::new())) {
        Ok(req) => client.request(req).await,
        Err(err) => {
            cx.span().add_event("downstream request invalid", vec![]);
            cx.span().end();
            let mut res = Response::new(
                Full::new(Bytes::from(err.to_string()))
                    .map_err(|e| match e {})
                    .boxed(),
            );
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return Ok(res);
        }
    };

    let response = match body {
        Ok(res) => {
            cx.span().add_event(
                "downstream answered",
                vec![KeyValue::new("status", res.status().to_string())],
            );
            res.map(|incoming| incoming.boxed())
        }
        Err(err) => {
            cx.span().record_error(&err);
            let mut res = Response::new(
                Full::new(Bytes::from(format!("downstream unavailable: {err}")))
                    .map_err(|e| match e {})
                    .boxed(),
            );
            *res.status_mut() = StatusCode::BAD_GATEWAY;
            res
        }
    };

    cx.span().end();
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use hyper_util::server::conn::auto::Builder;

    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("http-relay")
            .with_node_name("single-node")
            .from_env(),
    )?;

    let addr = SocketAddr::from(([127, 0, 0, 1], 3001));
    let listener = TcpListener::bind(addr).await?;
    info!(name: "listening", address = %addr, "http-relay accepting connections");

    while let Ok((stream, _addr)) = listener.accept().await {
        if let Err(err) = Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service_fn(relay))
            .await
        {
            eprintln!("{err}");
        }
    }

    guard.shutdown()?;
    Ok(())
}
