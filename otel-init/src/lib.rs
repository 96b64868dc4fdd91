//! Shared OpenTelemetry bootstrap for the playground demos.
//!
//! Every demo binary performs the same initialization sequence: build a
//! resource describing the service instance, point OTLP/HTTP span and
//! metric exporters at the collector, register global tracer/meter
//! providers, and install a composite trace-context + baggage
//! propagator. This crate packages that sequence behind
//! [`TelemetryConfig`] and [`init`], and hands back an [`OtelGuard`]
//! whose shutdown flushes whatever the batch pipelines still hold.
//!
//! ```no_run
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let guard = otel_init::init(otel_init::TelemetryConfig::new("demo").from_env())?;
//!     // run the demo...
//!     guard.shutdown()?;
//!     Ok(())
//! }
//! ```

use opentelemetry::{global, propagation::TextMapCompositePropagator, KeyValue};
use opentelemetry_otlp::{
    ExporterBuildError, MetricExporter, Protocol, SpanExporter, WithExportConfig,
};
use opentelemetry_sdk::{
    error::OTelSdkResult,
    metrics::SdkMeterProvider,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::K8S_NODE_NAME;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Static description of one service instance and where it exports to.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name` on every span and metric.
    pub service_name: String,
    /// Reported as `k8s.node.name` when present.
    pub node_name: Option<String>,
    /// Base OTLP/HTTP collector endpoint; signal paths are appended.
    pub endpoint: String,
    /// Head sampling ratio for root spans. `None` keeps every trace.
    pub sample_ratio: Option<f64>,
}

impl TelemetryConfig {
    /// Default collector endpoint used by all demos.
    pub const DEFAULT_ENDPOINT: &'static str = "http://127.0.0.1:4318";

    pub fn new(service_name: impl Into<String>) -> Self {
        TelemetryConfig {
            service_name: service_name.into(),
            node_name: None,
            endpoint: Self::DEFAULT_ENDPOINT.to_owned(),
            sample_ratio: None,
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = Some(ratio);
        self
    }

    /// Overrides fields from the standard OpenTelemetry environment
    /// variables when they are set and non-empty.
    pub fn from_env(mut self) -> Self {
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            if !name.is_empty() {
                self.service_name = name;
            }
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.is_empty() {
                self.endpoint = endpoint;
            }
        }
        if let Ok(arg) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(ratio) = arg.parse::<f64>() {
                self.sample_ratio = Some(ratio);
            }
        }
        self
    }

    fn signal_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// Telemetry initialization failure. The demos treat this as fatal and
/// abort via `?` from `main`.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("building OTLP trace exporter: {0}")]
    TraceExporter(#[source] ExporterBuildError),
    #[error("building OTLP metric exporter: {0}")]
    MetricExporter(#[source] ExporterBuildError),
}

/// Owns the registered providers so the process can flush pending
/// telemetry before exiting.
///
/// Export happens on background batch pipelines; dropping the guard (or
/// calling [`OtelGuard::shutdown`] to observe the result) replaces the
/// "sleep before exit" idiom seen in quick demos.
#[derive(Debug)]
pub struct OtelGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    shut_down: bool,
}

impl OtelGuard {
    /// Flushes and shuts down both providers.
    pub fn shutdown(mut self) -> OTelSdkResult {
        self.shutdown_once()
    }

    fn shutdown_once(&mut self) -> OTelSdkResult {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_once() {
            tracing::warn!(name: "otel_shutdown_failed", error = %err, "telemetry shutdown failed");
        }
    }
}

/// Wires up the whole pipeline: propagator, tracer and meter providers
/// registered globally, and a console `tracing` subscriber.
///
/// Call once at startup, before the first listener accepts.
pub fn init(config: TelemetryConfig) -> Result<OtelGuard, InitError> {
    init_propagator();

    let resource = build_resource(&config);

    let tracer_provider = init_traces(&config, resource.clone())?;
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = init_metrics(&config, resource)?;
    global::set_meter_provider(meter_provider.clone());

    init_fmt_subscriber();

    Ok(OtelGuard {
        tracer_provider,
        meter_provider,
        shut_down: false,
    })
}

/// Registers the composite W3C trace-context + baggage propagator.
fn init_propagator() {
    let composite = TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]);
    global::set_text_map_propagator(composite);
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut builder = Resource::builder().with_service_name(config.service_name.clone());
    if let Some(node_name) = &config.node_name {
        builder = builder.with_attribute(KeyValue::new(K8S_NODE_NAME, node_name.clone()));
    }
    builder.build()
}

fn init_traces(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkTracerProvider, InitError> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(config.signal_url("v1/traces"))
        .build()
        .map_err(InitError::TraceExporter)?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .with_sampler(sampler(config.sample_ratio))
        .build())
}

fn init_metrics(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkMeterProvider, InitError> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(config.signal_url("v1/metrics"))
        .build()
        .map_err(InitError::MetricExporter)?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// Maps a configured ratio onto a parent-respecting sampler. Values
/// outside (0, 1) clamp to AlwaysOff / AlwaysOn.
fn sampler(ratio: Option<f64>) -> Sampler {
    let root = match ratio {
        None => Sampler::AlwaysOn,
        Some(r) if r >= 1.0 => Sampler::AlwaysOn,
        Some(r) if r <= 0.0 => Sampler::AlwaysOff,
        Some(r) => Sampler::TraceIdRatioBased(r),
    };
    Sampler::ParentBased(Box::new(root))
}

/// Console logging. Keeps the transport crates used by the OTLP
/// exporters out of the stream, same directives as the upstream OTLP
/// examples, unless `RUST_LOG` overrides the filter.
fn init_fmt_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info")
            .add_directive("hyper=off".parse().unwrap())
            .add_directive("tonic=off".parse().unwrap())
            .add_directive("h2=off".parse().unwrap())
            .add_directive("reqwest=off".parse().unwrap())
            .add_directive("opentelemetry=off".parse().unwrap())
    });
    // Several demo binaries share one test process; losing the race to
    // install the subscriber is fine.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init();
}
