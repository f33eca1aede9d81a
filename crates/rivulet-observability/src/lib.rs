//! Rivulet Observability
//!
//! Metrics and logging shared by the Rivulet storage engine and the
//! processes embedding it.
//!
//! # Features
//!
//! - Prometheus metric families for database transactions
//! - Text exposition of the registry for scraping
//! - `tracing` subscriber bootstrap driven by `RUST_LOG`
//!
//! # Usage
//!
//! ```no_run
//! use rivulet_observability::{exporter, logging, metrics};
//!
//! logging::init_logging("info");
//! metrics::init();
//!
//! let body = exporter::encode_text().unwrap();
//! println!("{}", body);
//! ```

pub mod exporter;
pub mod logging;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize metrics and logging with the given default filter.
pub fn init(default_filter: &str) {
    metrics::init();
    logging::init_logging(default_filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init("warn");
        init("warn");
    }

    #[test]
    fn test_registry_accessible() {
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
