//! Shared pieces of the gRPC twin demo: the generated `demo` service
//! types and the propagation carriers over tonic request metadata.
//!
//! Newer opentelemetry releases no longer implement the propagation
//! traits for `tonic::metadata::MetadataMap`, so both carriers live
//! here and are used by the client (inject) and server (extract) bins.

use opentelemetry::propagation::{Extractor, Injector};

#[allow(clippy::derive_partial_eq_without_eq)] // tonic doesn't derive Eq for generated types
pub mod demo {
    tonic::include_proto!("demo");
}

/// Writes propagation headers into outgoing request metadata.
pub struct MetadataInjector<'a>(pub &'a mut tonic::metadata::MetadataMap);

impl Injector for MetadataInjector<'_> {
    /// Sets a key and value in the metadata. Does nothing if the key or
    /// value is not a valid metadata entry.
    fn set(&mut self, key: &str, value: String) {
        if let Ok(key) = tonic::metadata::MetadataKey::from_bytes(key.as_bytes()) {
            if let Ok(val) = tonic::metadata::MetadataValue::try_from(&value) {
                self.0.insert(key, val);
            }
        }
    }
}

/// Reads propagation headers out of incoming request metadata.
pub struct MetadataExtractor<'a>(pub &'a tonic::metadata::MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                tonic::metadata::KeyRef::Ascii(v) => v.as_str(),
                tonic::metadata::KeyRef::Binary(v) => v.as_str(),
            })
            .collect()
    }
}

/// Widening sum over the request values.
pub fn sum_values(values: &[i32]) -> i64 {
    values.iter().map(|v| i64::from(*v)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
    use opentelemetry::trace::{Span, TraceContextExt, Tracer, TracerProvider};
    use opentelemetry::{Context, KeyValue};
    use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    #[test]
    fn sum_values_widens_and_sums() {
        assert_eq!(sum_values(&[1, 2, 3, 4, 5, 6, 7]), 28);
        assert_eq!(sum_values(&[]), 0);
        assert_eq!(sum_values(&[i32::MAX, i32::MAX]), 2 * i64::from(i32::MAX));
        assert_eq!(sum_values(&[-5, 5]), 0);
    }

    #[test]
    fn metadata_round_trips_context_and_baggage() {
        let propagator = TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]);

        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter)
            .build();
        let tracer = provider.tracer("test");

        let span = tracer.start("client");
        let trace_id = span.span_context().trace_id();
        let cx = Context::current_with_span(span)
            .with_baggage([KeyValue::new("user-id", "caiwenzhe")]);

        let mut request = tonic::Request::new(());
        propagator.inject_context(&cx, &mut MetadataInjector(request.metadata_mut()));
        assert!(request.metadata().contains_key("traceparent"));
        assert!(request.metadata().contains_key("baggage"));

        let extracted = propagator.extract(&MetadataExtractor(request.metadata()));
        assert_eq!(extracted.span().span_context().trace_id(), trace_id);
        assert_eq!(
            extracted.baggage().get("user-id").map(|v| v.as_str()),
            Some("caiwenzhe")
        );
        cx.span().end();
    }

    #[test]
    fn injector_skips_invalid_metadata_keys() {
        let mut metadata = tonic::metadata::MetadataMap::new();
        let mut injector = MetadataInjector(&mut metadata);
        injector.set("valid-key", "value".to_string());
        injector.set("invalid key with spaces", "value".to_string());
        assert!(metadata.contains_key("valid-key"));
        assert_eq!(metadata.len(), 1);
    }
}
