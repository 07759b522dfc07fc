//! Tracing bootstrap for the render host.

use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

// The CDP connection and the broker client log every frame at debug;
// cap them at warn unless RUST_LOG explicitly asks for more.
const QUIET_DEPENDENCIES: &[&str] = &["chromiumoxide", "rdkafka", "librdkafka"];

#[derive(Debug, Error)]
#[error("telemetry initialization failed: {reason}")]
pub struct TelemetryError {
    reason: String,
}

impl TelemetryError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Install the process-wide subscriber.
///
/// JSON output suits aggregated deployments; compact is the local
/// default. Either way events keep their `platen::*` targets, which is
/// how the dispatchers and the pool are told apart downstream.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry()
        .with(build_filter(logging)?)
        .with(ErrorLayer::default());

    let outcome = match logging.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
    };

    outcome.map_err(|err| TelemetryError::new(format!("subscriber already installed: {err}")))
}

fn build_filter(logging: &LoggingSettings) -> Result<EnvFilter, TelemetryError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    for dependency in QUIET_DEPENDENCIES {
        let directive: Directive = format!("{dependency}=warn").parse().map_err(|err| {
            TelemetryError::new(format!("bad filter directive for `{dependency}`: {err}"))
        })?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn dependency_directives_parse() {
        let logging = LoggingSettings {
            level: LevelFilter::DEBUG,
            format: LogFormat::Compact,
        };

        let filter = build_filter(&logging).expect("filter builds");
        let rendered = filter.to_string();
        for dependency in QUIET_DEPENDENCIES {
            assert!(rendered.contains(dependency));
        }
    }
}
