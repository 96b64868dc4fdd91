//! gRPC server half of the twin demo.
//!
//! Serves the `Demo` service on port 8080. Each method extracts the
//! propagated context from the request metadata, parents its span on
//! the remote caller, and surfaces the `user-id` baggage member.

use std::net::SocketAddr;
use std::sync::OnceLock;

use grpc_twin::demo::demo_server::{Demo, DemoServer};
use grpc_twin::demo::{AddReply, AddRequest, HelloReply, HelloRequest};
use grpc_twin::{sum_values, MetadataExtractor};
use opentelemetry::{
    baggage::BaggageExt,
    global::{self, BoxedTracer},
    trace::{Span, SpanKind, Tracer},
    Context, KeyValue,
};
use tonic::{transport::Server, Request, Response, Status};
use tracing::info;

fn get_tracer() -> &'static BoxedTracer {
    static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
    TRACER.get_or_init(|| global::tracer("grpc-server"))
}

fn extract_context<T>(request: &Request<T>) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&MetadataExtractor(request.metadata()))
    })
}

#[derive(Debug, Default)]
struct DemoService;

#[tonic::async_trait]
impl Demo for DemoService {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let parent_cx = extract_context(&request);
        let tracer = get_tracer();
        let mut span = tracer
            .span_builder("grpc_say_hello")
            .with_kind(SpanKind::Server)
            .start_with_context(tracer, &parent_cx);

        let name = request.into_inner().name;
        span.add_event("reply", vec![]);
        span.end();

        Ok(Response::new(HelloReply {
            message: format!("Hello {name}!"),
        }))
    }

    async fn add(&self, request: Request<AddRequest>) -> Result<Response<AddReply>, Status> {
        let parent_cx = extract_context(&request);
        let tracer = get_tracer();
        let mut span = tracer
            .span_builder("grpc_add")
            .with_kind(SpanKind::Server)
            .start_with_context(tracer, &parent_cx);

        if let Some(user_id) = parent_cx.baggage().get("user-id") {
            span.add_event(
                "user-id baggage",
                vec![KeyValue::new("user-id", user_id.clone())],
            );
        }

        let sum = sum_values(&request.into_inner().values);
        span.add_event("done", vec![]);
        span.end();

        Ok(Response::new(AddReply { sum }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let guard = otel_init::init(
        otel_init::TelemetryConfig::new("grpc-server")
            .with_node_name("single-node")
            .from_env(),
    )?;

    let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
    info!(name: "listening", address = %addr, "grpc-server accepting connections");

    Server::builder()
        .add_service(DemoServer::new(DemoService))
        .serve(addr)
        .await?;

    guard.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc_twin::MetadataInjector;
    use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
    use opentelemetry::trace::TraceContextExt;
    use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

    #[tokio::test]
    async fn say_hello_greets_by_name() {
        let reply = DemoService
            .say_hello(Request::new(HelloRequest {
                name: "Sato".into(),
            }))
            .await
            .expect("say_hello succeeds")
            .into_inner();
        assert_eq!(reply.message, "Hello Sato!");
    }

    #[tokio::test]
    async fn add_sums_the_values() {
        let reply = DemoService
            .add(Request::new(AddRequest {
                values: vec![1, 2, 3, 4, 5, 6, 7],
            }))
            .await
            .expect("add succeeds")
            .into_inner();
        assert_eq!(reply.sum, 28);
    }

    #[tokio::test]
    async fn add_accepts_propagated_metadata() {
        let propagator = TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]);
        let cx = Context::new().with_baggage([KeyValue::new("user-id", "caiwenzhe")]);

        let mut request = Request::new(AddRequest { values: vec![40, 2] });
        propagator.inject_context(&cx, &mut MetadataInjector(request.metadata_mut()));

        let extracted = propagator.extract(&MetadataExtractor(request.metadata()));
        assert_eq!(
            extracted.baggage().get("user-id").map(|v| v.as_str()),
            Some("caiwenzhe")
        );
        assert!(!extracted.span().span_context().is_valid());

        let reply = DemoService
            .add(request)
            .await
            .expect("add succeeds")
            .into_inner();
        assert_eq!(reply.sum, 42);
    }
}
