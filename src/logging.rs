//! Tracing subscriber setup for binaries.

use tracing_subscriber::EnvFilter;

/// Output format of [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines on stderr
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Build the filter: `RUST_LOG` if set, otherwise `level` for this crate
/// and warnings for everything else.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,gpib_usb={0},gpib_ctl={0}", level)))
}

/// Install the global tracing subscriber.
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing(level: &str, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_uses_level_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter("debug");
        assert!(filter.to_string().contains("gpib_usb=debug"));
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        init_tracing("info", LogFormat::Text);
        init_tracing("debug", LogFormat::Json);
    }
}
