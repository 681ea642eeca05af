//! Telemetry and observability for the authorization engine.
//!
//! Prometheus metrics are owned per engine (each [`Telemetry`] has its own
//! registry). Log and span output is installed once per process by
//! [`init_tracing`], optionally exporting spans over OTLP (OpenTelemetry
//! v0.27).

use crate::api::Decision;
use crate::config::{LoggingConfig, TelemetryConfig};
use crate::{Error, Result};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, trace::TracerProvider, Resource};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Latency buckets in seconds; decisions are expected well under a millisecond.
const DURATION_BUCKETS: [f64; 10] = [
    0.000_005, 0.000_01, 0.000_025, 0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.005, 0.025,
];

/// Decision and reload metrics.
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    checks: IntCounterVec,
    check_duration: Histogram,
    reloads: IntCounterVec,
    rules: IntGauge,
}

impl Telemetry {
    /// Create the metrics and register them in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let checks = IntCounterVec::new(
            Opts::new("authz_check_requests_total", "Authorization checks by outcome"),
            &["effect", "reason"],
        )
        .map_err(metric_error)?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new(
                "authz_check_duration_seconds",
                "Time spent deciding a check",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )
        .map_err(metric_error)?;
        let reloads = IntCounterVec::new(
            Opts::new("authz_policy_reloads_total", "Policy reload attempts by result"),
            &["result"],
        )
        .map_err(metric_error)?;
        let rules = IntGauge::new("authz_policy_rules", "Rules in the active policy set")
            .map_err(metric_error)?;

        registry.register(Box::new(checks.clone())).map_err(metric_error)?;
        registry
            .register(Box::new(check_duration.clone()))
            .map_err(metric_error)?;
        registry.register(Box::new(reloads.clone())).map_err(metric_error)?;
        registry.register(Box::new(rules.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            checks,
            check_duration,
            reloads,
            rules,
        })
    }

    /// Record one decision.
    pub fn record_check(&self, decision: &Decision, elapsed: Duration) {
        self.checks
            .with_label_values(&[decision.effect.as_str(), decision.reason.as_str()])
            .inc();
        self.check_duration.observe(elapsed.as_secs_f64());
    }

    /// Record a reload attempt.
    pub fn record_reload(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.reloads.with_label_values(&[result]).inc();
    }

    /// Publish the active rule count.
    pub fn set_rules(&self, count: usize) {
        self.rules.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Checks recorded with the given labels.
    pub fn check_count(&self, effect: &str, reason: &str) -> u64 {
        self.checks.with_label_values(&[effect, reason]).get()
    }

    /// Reload attempts recorded with the given result label.
    pub fn reload_count(&self, result: &str) -> u64 {
        self.reloads.with_label_values(&[result]).get()
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| Error::telemetry(e.to_string()))
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::telemetry(e.to_string())
}

/// Keeps span export alive; flushes and shuts down the exporter on drop.
#[must_use = "dropping the guard stops span export"]
pub struct TracingGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down span exporter: {}", e);
            }
        }
    }
}

/// Install the global subscriber: env filter, plain or JSON formatting and,
/// if an endpoint is configured, OTLP span export.
///
/// Must be called from within a Tokio runtime when OTLP export is enabled.
pub fn init_tracing(logging: &LoggingConfig, telemetry: &TelemetryConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| Error::config_key(format!("invalid log filter: {}", e), "logging.level"))?;

    let fmt_layer = if logging.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let provider = match export_endpoint(telemetry) {
        Some(endpoint) => Some(otlp_provider(endpoint, &telemetry.service_name)?),
        None => None,
    };
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(telemetry.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::telemetry(format!("failed to install subscriber: {}", e)))?;

    if let Some(p) = &provider {
        opentelemetry::global::set_tracer_provider(p.clone());
    }

    Ok(TracingGuard { provider })
}

/// Where spans go, if anywhere. Metrics do not depend on this.
fn export_endpoint(telemetry: &TelemetryConfig) -> Option<&str> {
    telemetry
        .otlp_endpoint
        .as_deref()
        .filter(|endpoint| telemetry.enabled && !endpoint.trim().is_empty())
}

#[allow(deprecated)]
fn otlp_provider(endpoint: &str, service_name: &str) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::telemetry(format!("failed to build OTLP exporter: {}", e)))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .build())
}
