//! Tracing subscriber setup for binaries and tests that embed the bridge.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "sluice=info";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Install a global fmt subscriber filtered by `RUST_LOG`, or `filter` if unset
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: &str) -> bool {
    init_tracing_with(filter, LogFormat::Text)
}

/// Like [`init_tracing`] with an explicit output format
pub fn init_tracing_with(filter: &str, format: LogFormat) -> bool {
    let env_filter = env_filter(filter);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing(DEFAULT_FILTER);
        assert!(!init_tracing(DEFAULT_FILTER));
        assert!(!init_tracing_with("debug", LogFormat::Json));
    }

    #[test]
    fn test_fallback_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert!(EnvFilter::try_new("sluice=debug,sluice::script=trace").is_ok());
    }
}
