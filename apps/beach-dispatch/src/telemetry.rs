use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OTEL_STDOUT_ENV: &str = "BEACH_DISPATCH_OTEL_STDOUT";

/// What a process wants from its telemetry stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// `service.name` on exported spans.
    pub service: &'static str,
    /// Install the Prometheus recorder rendered at `/metrics`.
    pub prometheus: bool,
    pub otel_stdout: bool,
    /// Used when `RUST_LOG` is unset or unparsable.
    pub default_filter: &'static str,
}

impl TelemetryOptions {
    pub fn server() -> Self {
        Self {
            service: "beach-dispatch",
            prometheus: true,
            otel_stdout: env_flag(OTEL_STDOUT_ENV),
            default_filter: "info",
        }
    }

    /// Agents print to a terminal; no recorder, no span export.
    pub fn agent() -> Self {
        Self {
            service: "beach-dispatch-agent",
            prometheus: false,
            otel_stdout: false,
            default_filter: "info",
        }
    }
}

/// Installed logging, span export and metrics. Flushes spans on drop.
pub struct Telemetry {
    metrics_handle: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(options: &TelemetryOptions) -> Result<Self> {
        let metrics_handle = if options.prometheus {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install Prometheus metrics recorder")?,
            )
        } else {
            None
        };

        let tracer_provider = options.otel_stdout.then(|| stdout_provider(options.service));
        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(options.service)));

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(options.default_filter)),
            )
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!(service = options.service, "exporting spans to stdout ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_provider(service: &'static str) -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", service)])
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|val| is_truthy(&val)).unwrap_or(false)
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
