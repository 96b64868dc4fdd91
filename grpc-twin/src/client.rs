//! HTTP-fronted client half of the gRPC twin demo.
//!
//! Listens on port 8001; each request dials the gRPC server on port
//! 8080, calls `SayHello`, then adds a `user-id` baggage member and
//! calls `Add`, injecting trace context + baggage into the request
//! metadata of both calls.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;

use grpc_twin::demo::demo_client::DemoClient;
use grpc_twin::demo::{AddRequest, HelloRequest};
use grpc_twin::MetadataInjector;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use opentelemetry::{
    baggage::BaggageExt,
    global::{self, BoxedTracer},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context, KeyValue,
};
use tokio::net::TcpListener;
use tracing::info;

const GRPC_SERVER: &str = "http://127.0.0.1:8080";

fn get_tracer() -> &'static BoxedTracer {
    static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
    TRACER.get_or_init(|| global::tracer("grpc-client"))
}

/// One full downstream exchange: SayHello without baggage, then Add
/// with the `user-id` member attached.
async fn call_downstream() -> anyhow::Result<String> {
    let tracer = get_tracer();
    let span = tracer
        .span_builder("grpc_exchange")
        .with_kind(SpanKind::Client)
        .start(tracer);
    let cx = Context::current_with_span(span);

    let mut client = DemoClient::connect(GRPC_SERVER).await?;

    cx.span().add_event("request say_hello", vec![]);
    let mut request = tonic::Request::new(HelloRequest {
        name: "Sato".into(),
    });
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut MetadataInjector(request.metadata_mut()))
    });
    let greeting = client.say_hello(request).await?.into_inner().message;

    cx.span().add_event("request add", vec![]);
    let cx = cx.with_baggage([KeyValue::new("user-id", "caiwenzhe")]);
    let mut request = tonic::Request::new(AddRequest {
        values: vec![1, 2, 3, 4, 5, 6, 7],
    });
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut MetadataInjector(request.metadata_mut()))
    });
    let sum = client.add(request).await?.into_inner().sum;

    cx.span().end();
    Ok(format!("{greeting} sum={sum}"))
}

async fn handle<B>(_req: Request<B>) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let (status, body) = match call_downstream().await {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            format!("grpc server unavailable: {err}"),
        ),
    };

    let mut res = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|err| match err {})
            .boxed(),
    );
    *res.status_mut() = status;
    Ok(res)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use hyper_util::server::conn::auto::Builder;

    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("grpc-client")
            .with_node_name("single-node")
            .from_env(),
    )?;

    let addr = SocketAddr::from(([127, 0, 0, 1], 8001));
    let listener = TcpListener::bind(addr).await?;
    info!(name: "listening", address = %addr, "grpc-client accepting connections");

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
