//! Observability module - tracing subscriber, OpenTelemetry export and engine metrics
//!
//! This module provides:
//! - `tracing` subscriber with env filter and fmt output
//! - OpenTelemetry tracing exported over OTLP (gRPC) when enabled
//! - Prometheus bridge for OpenTelemetry metrics
//! - `EngineMetrics`: per-engine Prometheus counters and gauges
//!
//! # Usage
//! ```no_run
//! use hydrotier::observability::init_observability;
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_observability(None).expect("Failed to initialize observability");
//!     // Guard will flush traces on drop
//! }
//! ```

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    runtime,
    trace::{Config, RandomIdGenerator, Sampler},
    Resource,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for the observability system
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Service name for traces and metrics
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (dev, staging, prod)
    pub environment: String,
    /// OTLP endpoint for traces
    pub otlp_endpoint: String,
    /// Whether to enable trace export
    pub enable_tracing: bool,
    /// Whether to enable the Prometheus bridge
    pub enable_metrics: bool,
    /// Sampling ratio (0.0 to 1.0)
    pub sampling_ratio: f64,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "hydrotier".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_tracing: std::env::var("ENABLE_TRACING")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            enable_metrics: std::env::var("ENABLE_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            sampling_ratio: std::env::var("TRACE_SAMPLING_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
            default_filter: "info".to_string(),
        }
    }
}

/// Guard that ensures proper cleanup of OpenTelemetry resources
#[derive(Default)]
pub struct ObservabilityGuard {
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                tracing::warn!("Meter provider shutdown failed: {}", e);
            }
        }
        // Shutdown the tracer provider to flush remaining spans
        global::shutdown_tracer_provider();
        tracing::info!("OpenTelemetry tracer provider shutdown complete");
    }
}

/// Initialize logging, trace export and the metrics bridge
///
/// # Arguments
/// * `config` - Optional configuration. If None, uses default configuration
///
/// # Returns
/// A guard that will flush traces when dropped
pub fn init_observability(config: Option<ObservabilityConfig>) -> Result<ObservabilityGuard> {
    let config = config.unwrap_or_default();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let meter_provider = if config.enable_metrics {
        Some(init_metrics(&resource)?)
    } else {
        None
    };

    if config.enable_tracing {
        init_tracing(&config, resource)?;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.enable_tracing {
        let telemetry_layer = tracing_opentelemetry::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(telemetry_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }

    tracing::info!(
        "Observability initialized: service={}, version={}, environment={}, tracing={}",
        config.service_name,
        config.service_version,
        config.environment,
        config.enable_tracing
    );

    Ok(ObservabilityGuard { meter_provider })
}

/// Initialize OpenTelemetry tracing with OTLP exporter
fn init_tracing(config: &ObservabilityConfig, resource: Resource) -> Result<()> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.otlp_endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_secs(3));

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(runtime::Tokio)
        .context("Failed to install OTLP tracer")?;

    global::set_tracer_provider(tracer_provider);

    tracing::info!(
        "OpenTelemetry tracing initialized with endpoint: {}",
        config.otlp_endpoint
    );

    Ok(())
}

/// Bridge OpenTelemetry metrics into the process-global Prometheus registry
fn init_metrics(resource: &Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus::default_registry().clone())
        .build()
        .context("Failed to create Prometheus exporter")?;

    let provider = SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource.clone())
        .build();
    global::set_meter_provider(provider.clone());

    tracing::info!("Prometheus metrics initialized");
    Ok(provider)
}

fn encode(registry_families: Vec<prometheus::proto::MetricFamily>) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&registry_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// Get the process-global Prometheus metrics in text format
pub fn get_metrics() -> String {
    encode(prometheus::gather())
}

/// Counters and gauges for one engine instance, on their own registry
pub struct EngineMetrics {
    registry: Registry,
    pub readings_ingested: IntCounter,
    pub readings_rejected: IntCounter,
    pub buffer_flushes: IntCounter,
    pub buffer_flush_failures: IntCounter,
    pub buffer_pending: IntGauge,
    /// Labelled by the tier that failed or came back empty
    pub tier_fallthroughs: IntCounterVec,
    pub degraded_reads: IntCounter,
    /// Labelled by anomaly kind
    pub anomalies_detected: IntCounterVec,
    /// Labelled by job name and outcome (completed, failed, skipped)
    pub job_runs: IntCounterVec,
    pub model_promotions: IntCounter,
    pub model_retirements: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("hydrotier".to_string()), None)
            .context("Failed to create metrics registry")?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let buffer_pending = IntGauge::new("buffer_pending", "Readings waiting for a warm flush")?;
        registry.register(Box::new(buffer_pending.clone()))?;

        Ok(Self {
            readings_ingested: counter("readings_ingested_total", "Readings accepted at ingest")?,
            readings_rejected: counter("readings_rejected_total", "Readings rejected at ingest")?,
            buffer_flushes: counter("buffer_flushes_total", "Successful write buffer flushes")?,
            buffer_flush_failures: counter("buffer_flush_failures_total", "Failed write buffer flushes")?,
            buffer_pending,
            tier_fallthroughs: counter_vec(
                "tier_fallthroughs_total",
                "Reads that fell through to a colder tier",
                &["tier"],
            )?,
            degraded_reads: counter("degraded_reads_total", "Reads served from a degraded tier set")?,
            anomalies_detected: counter_vec("anomalies_detected_total", "Anomalies recorded", &["kind"])?,
            job_runs: counter_vec("job_runs_total", "Scheduled job executions", &["job", "outcome"])?,
            model_promotions: counter("model_promotions_total", "Models promoted to active")?,
            model_retirements: counter("model_retirements_total", "Models retired")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of this engine's metrics
    pub fn render(&self) -> String {
        encode(self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "hydrotier");
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_get_metrics() {
        let metrics = get_metrics();
        assert!(metrics.is_empty() || metrics.contains("# HELP"));
    }

    #[test]
    fn test_engine_metrics_render() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.readings_ingested.inc_by(3);
        metrics.job_runs.with_label_values(&["recent_sync", "completed"]).inc();

        let text = metrics.render();
        assert!(text.contains("hydrotier_readings_ingested_total 3"));
        assert!(text.contains("job=\"recent_sync\""));
    }

    #[test]
    fn test_engine_metrics_are_isolated() {
        // Two engines in one process must not collide on registration
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.degraded_reads.inc();
        assert!(!b.render().contains("hydrotier_degraded_reads_total 1"));
    }
}
