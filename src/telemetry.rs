use opentelemetry::sdk::{propagation::TraceContextPropagator, trace as sdktrace, Resource};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Installs the global subscriber: env-filtered stdout logs, plus OTLP trace export when
/// an endpoint is configured. `RUST_LOG` overrides `default_level`.
pub fn init_telemetry(service_name: &str, default_level: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(
                    sdktrace::config()
                        .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())])),
                )
                .install_batch(opentelemetry::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
