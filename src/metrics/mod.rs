//! Metrics module
//!
//! Prometheus metrics for dispatch, proxied operations and uploads.
//! All collectors live in the default registry; [`render`] produces the
//! text exposition format.

use crate::client::Operation;
use crate::dispatch::DispatchMode;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Dispatch metrics
    pub static ref DISPATCH_TOTAL: CounterVec = register_counter_vec!(
        "cloud_bridge_dispatch_total",
        "Blocking jobs dispatched",
        &["mode", "outcome"]
    ).unwrap();

    pub static ref DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "cloud_bridge_dispatch_duration_seconds",
        "Time from submission to completion of a blocking job",
        &["mode"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Operation metrics
    pub static ref OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "cloud_bridge_operations_total",
        "Proxied client operations",
        &["operation", "status"]
    ).unwrap();

    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "cloud_bridge_uploads_total",
        "Total number of uploads",
        &["bucket", "method", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "cloud_bridge_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "cloud_bridge_upload_duration_seconds",
        "Upload duration in seconds",
        &["bucket", "method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "cloud_bridge_multipart_parts",
        "Number of parts per completed multipart upload",
        vec![1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    pub static ref MULTIPART_ABORTS: CounterVec = register_counter_vec!(
        "cloud_bridge_multipart_aborts_total",
        "Multipart abort attempts",
        &["outcome"]  // "aborted", "failed" or "detached"
    ).unwrap();
}

/// Record a finished dispatch
pub fn record_dispatch(mode: DispatchMode, success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    DISPATCH_TOTAL
        .with_label_values(&[mode.as_str(), outcome])
        .inc();
    DISPATCH_DURATION
        .with_label_values(&[mode.as_str()])
        .observe(duration_secs);
}

/// Record a proxied operation result
pub fn record_operation(operation: Operation, success: bool) {
    let status = if success { "success" } else { "error" };
    OPERATIONS_TOTAL
        .with_label_values(&[operation.as_str(), status])
        .inc();
}

/// Record a successful upload
pub fn record_upload_success(bucket: &str, method: &str, bytes: u64, duration_secs: f64) {
    UPLOADS_TOTAL
        .with_label_values(&[bucket, method, "success"])
        .inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    UPLOAD_DURATION
        .with_label_values(&[bucket, method])
        .observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failure(bucket: &str, method: &str) {
    UPLOADS_TOTAL
        .with_label_values(&[bucket, method, "failure"])
        .inc();
}

pub fn record_multipart_parts(parts_count: usize) {
    MULTIPART_PARTS.observe(parts_count as f64);
}

pub fn record_multipart_abort(outcome: &str) {
    MULTIPART_ABORTS.with_label_values(&[outcome]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_dispatch() {
        record_dispatch(DispatchMode::WorkerPool, true, 0.001);
        record_dispatch(DispatchMode::Executor, false, 0.002);
        let count = DISPATCH_TOTAL
            .with_label_values(&["executor", "failure"])
            .get();
        assert!(count >= 1.0);
    }

    #[test]
    fn test_record_operation() {
        record_operation(Operation::HeadObject, true);
        let count = OPERATIONS_TOTAL
            .with_label_values(&["head_object", "success"])
            .get();
        assert!(count >= 1.0);
    }

    #[test]
    fn test_record_upload_success() {
        record_upload_success("metrics-bucket", "put_object", 1024, 0.01);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_multipart_abort() {
        record_multipart_abort("failed");
        let count = MULTIPART_ABORTS.with_label_values(&["failed"]).get();
        assert!(count >= 1.0);
    }

    #[test]
    fn test_render_contains_families() {
        record_upload_failure("render-bucket", "multipart");
        let text = render();
        assert!(text.contains("cloud_bridge_uploads_total"));
    }
}
