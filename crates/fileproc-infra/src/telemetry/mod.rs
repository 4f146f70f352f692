use fileproc_core::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "fileproc=debug,sqlx=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(env_filter());

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?,
    }

    tracing::info!(format = ?format, "Tracing initialized");
    Ok(())
}
