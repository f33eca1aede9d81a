//! Logging bootstrap.
//!
//! Installs a `tracing_subscriber::fmt` subscriber filtered by `RUST_LOG`,
//! falling back to the supplied default directive.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
        tracing::info!("logging initialized");
    }
}
