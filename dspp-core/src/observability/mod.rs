//! Observability infrastructure: structured logging.
//!
//! Logs go to stderr so that commands printing a compiled stack on stdout
//! can be piped safely.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` when set, `default_level` otherwise.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the global tracing subscriber.
///
/// Must be called once at application startup. A second call returns an error
/// instead of panicking.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .try_init()?;

    tracing::debug!("Observability initialized (level: {})", default_level);
    Ok(())
}
