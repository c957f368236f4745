//! Logging, tracing and metrics setup.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub struct TelemetryBuilder {
    service_name: String,
    service_version: String,
    log_level: String,
    json: bool,
    log_dir: Option<PathBuf>,
    otlp_endpoint: Option<String>,
    sampling_ratio: f64,
    metrics: bool,
}

impl TelemetryBuilder {
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            log_level: "info".into(),
            json: false,
            log_dir: None,
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            metrics: false,
        }
    }

    /// Used when `RUST_LOG` is not set.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Adds a daily rolling JSON log file under `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Exports spans over OTLP/gRPC.
    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Installs the Prometheus recorder.
    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }

    fn tracer_provider(&self, endpoint: &str) -> Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP span exporter")?;
        let resource = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(SERVICE_VERSION, self.service_version.clone()))
            .build();
        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                self.sampling_ratio,
            ))))
            .with_resource(resource)
            .build())
    }

    pub fn init(self) -> Result<TelemetryGuard> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        layers.push(if self.json {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(true).boxed()
        });

        let mut file_guard = None;
        if let Some(dir) = &self.log_dir {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", self.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
        }

        let mut provider = None;
        if let Some(endpoint) = &self.otlp_endpoint {
            let tracer_provider = self.tracer_provider(endpoint)?;
            let tracer = tracer_provider.tracer(self.service_name.clone());
            layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
            provider = Some(tracer_provider);
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(self.filter())
            .try_init()
            .context("failed to install tracing subscriber")?;

        let metrics = if self.metrics {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install Prometheus recorder")?,
            )
        } else {
            None
        };

        Ok(TelemetryGuard {
            _file_guard: file_guard,
            provider,
            metrics,
        })
    }
}

/// Flushes buffered logs and spans when dropped.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
    provider: Option<SdkTracerProvider>,
    metrics: Option<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics.clone()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_and_overrides() {
        let builder = TelemetryBuilder::new("node-scout", "0.1.0");
        assert_eq!(builder.log_level, "info");
        assert!(!builder.metrics);
        assert!(builder.otlp_endpoint.is_none());

        let builder = builder
            .with_log_level("debug")
            .with_json(true)
            .with_sampling_ratio(4.0)
            .with_tracing("http://localhost:4317")
            .with_metrics();
        assert_eq!(builder.log_level, "debug");
        assert!(builder.json);
        assert_eq!(builder.sampling_ratio, 1.0);
        assert_eq!(builder.otlp_endpoint.as_deref(), Some("http://localhost:4317"));
        assert!(builder.metrics);
    }
}
