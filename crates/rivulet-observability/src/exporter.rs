use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Render every family in [`REGISTRY`] in the Prometheus text format.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Content type to serve alongside [`encode_text`].
pub fn content_type() -> &'static str {
    prometheus::TEXT_FORMAT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{init, DBTX_STATUS, STATUS_PASS};

    #[test]
    fn test_encode_contains_dbtx_status() {
        init();
        DBTX_STATUS
            .with_label_values(&["exporter_test", STATUS_PASS])
            .inc();

        let body = encode_text().unwrap();
        assert!(body.contains("dbtx_status"));
        assert!(body.contains("exporter_test"));
        assert_eq!(content_type(), "text/plain; version=0.0.4");
    }
}
