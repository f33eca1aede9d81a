use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

/// Outcome label values for [`DBTX_STATUS`].
pub const STATUS_PASS: &str = "pass";
pub const STATUS_FAIL: &str = "fail";
pub const STATUS_RETRY: &str = "retry";

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Database Transaction Metrics
    // ============================================================================

    /// Transaction attempts by operation name and outcome
    pub static ref DBTX_STATUS: IntCounterVec = IntCounterVec::new(
        Opts::new("dbtx_status", "Database transaction attempts by outcome"),
        &["name", "status"]
    ).expect("metric can be created");

    /// Transaction duration including retries
    pub static ref DBTX_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("dbtx_duration_seconds", "Database transaction duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["name"]
    ).expect("metric can be created");
}

/// Register all metric families with [`REGISTRY`]. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(DBTX_STATUS.clone()))
            .expect("dbtx_status can be registered");
        REGISTRY
            .register(Box::new(DBTX_DURATION.clone()))
            .expect("dbtx_duration_seconds can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counter_labels() {
        init();
        let before = DBTX_STATUS
            .with_label_values(&["metrics_test", STATUS_RETRY])
            .get();
        DBTX_STATUS
            .with_label_values(&["metrics_test", STATUS_RETRY])
            .inc();
        assert_eq!(
            DBTX_STATUS
                .with_label_values(&["metrics_test", STATUS_RETRY])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_families_registered() {
        init();
        DBTX_DURATION
            .with_label_values(&["metrics_test"])
            .observe(0.01);
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"dbtx_duration_seconds".to_string()));
    }
}
