use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus collectors for the capture pipeline.
///
/// Shared behind an `Arc` between the consumer loop, the exporter's blocking
/// workers and the `/metrics` endpoint.
pub struct CaptureMetrics {
    pub registry: Registry,
    /// Anchors currently held by the registry.
    pub anchors_tracked: IntGauge,
    pub events_applied_total: IntCounter,
    /// Events skipped because an export held the capture gate.
    pub events_dropped_total: IntCounter,
    /// Events whose geometry or scene update failed.
    pub anchor_failures_total: IntCounter,
    pub exports_completed_total: IntCounter,
    pub exports_failed_total: IntCounter,
    pub exports_rejected_total: IntCounter,
    pub pose_samples_total: IntCounter,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        // Names and help strings are static, so registration can only fail on a
        // duplicate name below.
        let registry = Registry::new_custom(Some("mesh_capture".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric.expect("Invalid metric definition");
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            anchors_tracked: reg!(IntGauge::new(
                "anchors_tracked",
                "Number of mesh anchors currently in the registry"
            )),
            events_applied_total: reg!(IntCounter::new(
                "events_applied_total",
                "Anchor events applied to the registry"
            )),
            events_dropped_total: reg!(IntCounter::new(
                "events_dropped_total",
                "Anchor events dropped while an export was in flight"
            )),
            anchor_failures_total: reg!(IntCounter::new(
                "anchor_failures_total",
                "Anchor events that failed to decode or reach the scene"
            )),
            exports_completed_total: reg!(IntCounter::new(
                "exports_completed_total",
                "Snapshot exports written successfully"
            )),
            exports_failed_total: reg!(IntCounter::new(
                "exports_failed_total",
                "Snapshot exports that failed to write"
            )),
            exports_rejected_total: reg!(IntCounter::new(
                "exports_rejected_total",
                "Export requests ignored because another export was in flight"
            )),
            pose_samples_total: reg!(IntCounter::new(
                "pose_samples_total",
                "Camera pose samples recorded"
            )),
            registry,
        }
    }

    /// Serves the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                        Ok(()) => String::from_utf8_lossy(&buffer).into_owned().into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }

    pub fn set_anchors_tracked(&self, count: usize) {
        self.anchors_tracked.set(count as i64);
    }
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_prefixed_families() {
        let metrics = CaptureMetrics::new();
        metrics.exports_rejected_total.inc();
        metrics.set_anchors_tracked(3);

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"mesh_capture_exports_rejected_total".to_string()));
        assert_eq!(metrics.anchors_tracked.get(), 3);
    }
}
