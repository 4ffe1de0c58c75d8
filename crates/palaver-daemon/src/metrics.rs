//! Prometheus metrics for daemon health observability.
//!
//! All counters are incremented at the point the event happens; the
//! supervisor's metrics tick only refreshes gauges (connected sessions,
//! uptime). Export is Prometheus text format over a localhost HTTP
//! endpoint.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `palaver_sessions_active` | Gauge | |
//! | `palaver_frames_total` | Counter | `direction` |
//! | `palaver_bytes_total` | Counter | `direction` |
//! | `palaver_broadcast_drops_total` | Counter | |
//! | `palaver_rekeys_total` | Counter | |
//! | `palaver_replay_rejections_total` | Counter | |
//! | `palaver_auth_failures_total` | Counter | `reason` |
//! | `palaver_session_closes_total` | Counter | `reason` |
//! | `palaver_task_failures_total` | Counter | `task` |
//! | `palaver_task_alerts_total` | Counter | `task` |
//! | `palaver_uptime_seconds` | Gauge | |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router as HttpRouter;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric failed to register (e.g. duplicate name).
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    /// Encoded output was not valid UTF-8.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// All daemon metrics behind intent-named methods.
///
/// Interior mutability throughout; the struct is `Clone`, `Send`, and
/// `Sync` and is handed to every component that records events.
#[derive(Clone)]
pub struct ServerMetrics {
    sessions_active: IntGauge,
    frames_total: IntCounterVec,
    bytes_total: IntCounterVec,
    broadcast_drops_total: IntCounter,
    rekeys_total: IntCounter,
    replay_rejections_total: IntCounter,
    auth_failures_total: IntCounterVec,
    session_closes_total: IntCounterVec,
    task_failures_total: IntCounterVec,
    task_alerts_total: IntCounterVec,
    uptime_seconds: IntGauge,
}

impl ServerMetrics {
    /// Creates the metric families and registers them.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] on a duplicate registration.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let sessions_active = IntGauge::new(
            "palaver_sessions_active",
            "Number of sessions currently registered with the router",
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        let frames_total = IntCounterVec::new(
            Opts::new("palaver_frames_total", "Records processed, by direction"),
            &["direction"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let bytes_total = IntCounterVec::new(
            Opts::new("palaver_bytes_total", "Payload bytes processed, by direction"),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_total.clone()))?;

        let broadcast_drops_total = IntCounter::new(
            "palaver_broadcast_drops_total",
            "Chat frames dropped because a recipient queue was full",
        )?;
        registry.register(Box::new(broadcast_drops_total.clone()))?;

        let rekeys_total =
            IntCounter::new("palaver_rekeys_total", "Completed session rekeys")?;
        registry.register(Box::new(rekeys_total.clone()))?;

        let replay_rejections_total = IntCounter::new(
            "palaver_replay_rejections_total",
            "Records rejected for sequence regression",
        )?;
        registry.register(Box::new(replay_rejections_total.clone()))?;

        let auth_failures_total = IntCounterVec::new(
            Opts::new("palaver_auth_failures_total", "Authentication failures, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(auth_failures_total.clone()))?;

        let session_closes_total = IntCounterVec::new(
            Opts::new("palaver_session_closes_total", "Session terminations, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(session_closes_total.clone()))?;

        let task_failures_total = IntCounterVec::new(
            Opts::new(
                "palaver_task_failures_total",
                "Periodic task failures (the task is restarted with backoff)",
            ),
            &["task"],
        )?;
        registry.register(Box::new(task_failures_total.clone()))?;

        let task_alerts_total = IntCounterVec::new(
            Opts::new(
                "palaver_task_alerts_total",
                "Escalations after repeated consecutive periodic task failures",
            ),
            &["task"],
        )?;
        registry.register(Box::new(task_alerts_total.clone()))?;

        let uptime_seconds =
            IntGauge::new("palaver_uptime_seconds", "Seconds since daemon start")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            sessions_active,
            frames_total,
            bytes_total,
            broadcast_drops_total,
            rekeys_total,
            replay_rejections_total,
            auth_failures_total,
            session_closes_total,
            task_failures_total,
            task_alerts_total,
            uptime_seconds,
        })
    }

    /// A session registered with the router.
    pub fn session_registered(&self) {
        self.sessions_active.inc();
    }

    /// A registered session was removed.
    pub fn session_unregistered(&self) {
        self.sessions_active.dec();
    }

    /// Sets the active-session gauge from an authoritative count.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_sessions_active(&self, count: usize) {
        self.sessions_active.set(count as i64);
    }

    /// A record arrived from a client.
    pub fn frame_in(&self, bytes: usize) {
        self.frames_total.with_label_values(&["in"]).inc();
        self.bytes_total
            .with_label_values(&["in"])
            .inc_by(bytes as u64);
    }

    /// A record was written to a client.
    pub fn frame_out(&self, bytes: usize) {
        self.frames_total.with_label_values(&["out"]).inc();
        self.bytes_total
            .with_label_values(&["out"])
            .inc_by(bytes as u64);
    }

    /// Broadcast drops from one dispatch.
    pub fn broadcast_dropped(&self, count: usize) {
        self.broadcast_drops_total.inc_by(count as u64);
    }

    /// A rekey sub-exchange completed.
    pub fn rekey_completed(&self) {
        self.rekeys_total.inc();
    }

    /// A record was rejected as a replay.
    pub fn replay_rejected(&self) {
        self.replay_rejections_total.inc();
    }

    /// An authentication attempt failed.
    pub fn auth_failure(&self, reason: &str) {
        self.auth_failures_total.with_label_values(&[reason]).inc();
    }

    /// A session closed.
    pub fn session_closed(&self, reason: &str) {
        self.session_closes_total.with_label_values(&[reason]).inc();
    }

    /// A periodic task failed and will be restarted.
    pub fn task_failure(&self, task: &str) {
        self.task_failures_total.with_label_values(&[task]).inc();
    }

    /// Repeated task failures escalated to an alert.
    pub fn task_alert(&self, task: &str) {
        self.task_alerts_total.with_label_values(&[task]).inc();
    }

    /// Refreshes the uptime gauge.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_uptime_seconds(&self, seconds: u64) {
        self.uptime_seconds.set(seconds as i64);
    }

    #[cfg(test)]
    pub(crate) fn sessions_active_value(&self) -> i64 {
        self.sessions_active.get()
    }

    #[cfg(test)]
    pub(crate) fn session_close_count(&self, reason: &str) -> u64 {
        self.session_closes_total.with_label_values(&[reason]).get()
    }
}

/// Registry plus its metric families.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: ServerMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all families registered.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if any family fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = ServerMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// Handle for recording events.
    #[must_use]
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Encodes all families in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Serves `/metrics` on `addr` until `shutdown` fires.
///
/// Binds localhost by default; put a reverse proxy in front if the metrics
/// must leave the host.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve_metrics(
    registry: Arc<MetricsRegistry>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let handler = move || {
        let registry = Arc::clone(&registry);
        async move {
            match registry.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                },
            }
        }
    };

    let app = HttpRouter::new().route("/metrics", get(handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_register_once() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();

        metrics.session_registered();
        metrics.session_registered();
        metrics.session_unregistered();
        assert_eq!(metrics.sessions_active_value(), 1);

        metrics.session_closed("idle");
        metrics.session_closed("idle");
        metrics.session_closed("backpressure");
        assert_eq!(metrics.session_close_count("idle"), 2);
        assert_eq!(metrics.session_close_count("backpressure"), 1);
    }

    #[test]
    fn text_export_contains_family_names() {
        let registry = MetricsRegistry::new().unwrap();
        registry.metrics().frame_in(128);
        registry.metrics().frame_out(64);
        registry.metrics().replay_rejected();

        let text = registry.encode_text().unwrap();
        assert!(text.contains("palaver_frames_total"));
        assert!(text.contains("palaver_bytes_total"));
        assert!(text.contains("palaver_replay_rejections_total"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        let _first = ServerMetrics::new(&registry).unwrap();
        assert!(ServerMetrics::new(&registry).is_err());
    }
}
