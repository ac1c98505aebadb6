// Logging setup for the stagehand binary
//
// Configure via environment variables:
// - RUST_LOG or LOG_LEVEL: Log filter (default: "stagehand=info")

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "stagehand=info,stagehand_exec=info";

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Filter directives, e.g. `stagehand_exec=debug`
    pub log_filter: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok().map(level_filter)),
        }
    }
}

/// A bare level such as `debug` applies to our crates only
fn level_filter(level: String) -> String {
    if level.contains('=') {
        level
    } else {
        format!("stagehand={level},stagehand_exec={level}")
    }
}

/// Install the global subscriber. Logs are written to stderr.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry().with(console_layer).init();
}
