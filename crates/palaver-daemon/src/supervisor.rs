//! Daemon supervisor: startup, the accept loop, periodic maintenance, and
//! orderly shutdown.
//!
//! Startup order is bind listener, start periodic tasks, then accept. The
//! supervisor owns every long-lived piece of state (router, metrics, auth
//! gate, session-id counter, shutdown token); connection tasks borrow it
//! through a cloned [`ConnectionCtx`]. The only global mutable state is
//! the atomic session-id counter and the shutdown token.
//!
//! # Failure policy
//!
//! The supervisor is the error sink for the accept loop and the periodic
//! tasks. A failing periodic task is restarted with exponential backoff
//! (capped at 30 s); five consecutive failures inside five minutes raise
//! an alert counter but never exit the process. The process exits only on
//! configuration or bind failure at startup.
//!
//! # Shutdown
//!
//! Cancelling the shutdown token stops the accept loop, cancels every
//! session (each drains and emits a `Close` with reason "server"), waits
//! up to `graceful_shutdown_sec`, then aborts stragglers. Key material
//! zeroizes when each session's crypto state drops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use palaver_core::auth::{AuthGate, AuthStore, HistoryStore};
use palaver_core::clock::Clock;
use palaver_core::config::Config;
use palaver_core::rate_limit::LoginThrottle;

use crate::connection::{run_connection, ConnectionCtx};
use crate::listener::{upgrade, Listener, ListenerError};
use crate::metrics::{serve_metrics, MetricsRegistry, ServerMetrics};
use crate::router::Router;
use crate::session::DisconnectCause;

/// Reaper cadence.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Rekeyer cadence.
const REKEYER_INTERVAL: Duration = Duration::from_secs(60);

/// Metrics gauge refresh cadence.
const METRICS_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Ceiling for periodic-task restart backoff.
const MAX_TASK_BACKOFF: Duration = Duration::from_secs(30);

/// Consecutive failures inside the alert window that raise an alert.
const TASK_ALERT_THRESHOLD: u32 = 5;

/// Window for counting consecutive failures.
const TASK_ALERT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Server startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be set up.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// Metrics families could not be registered.
    #[error(transparent)]
    Metrics(#[from] crate::metrics::MetricsError),
}

/// External dependencies the daemon core does not own.
pub struct ServerDeps {
    /// User store port.
    pub auth_store: Arc<dyn AuthStore>,
    /// Optional message archive port.
    pub history: Option<Arc<dyn HistoryStore>>,
    /// Clock port.
    pub clock: Arc<dyn Clock>,
}

/// The bound, not-yet-running daemon.
pub struct Server {
    config: Arc<Config>,
    listener: Listener,
    router: Arc<Router>,
    registry: Arc<MetricsRegistry>,
    auth: Arc<AuthGate>,
    history: Option<Arc<dyn HistoryStore>>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    shutdown: CancellationToken,
    next_session_id: AtomicU64,
}

impl Server {
    /// Binds the listener and assembles the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] on bind or metrics-registration failure;
    /// these are the only failures that abort startup.
    pub fn bind(config: Config, deps: ServerDeps) -> Result<Self, ServerError> {
        let listener = Listener::bind(
            &config.listen_addr(),
            config.server.backlog,
            config.server.max_connections,
            &config.security,
        )?;
        let registry = Arc::new(MetricsRegistry::new()?);
        let throttle = Arc::new(LoginThrottle::new(config.login_throttle()));
        let auth = Arc::new(AuthGate::new(deps.auth_store, throttle));

        Ok(Self {
            config: Arc::new(config),
            listener,
            router: Arc::new(Router::new()),
            registry,
            auth,
            history: deps.history,
            clock: deps.clock,
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
            next_session_id: AtomicU64::new(0),
        })
    }

    /// The bound listener address.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the daemon when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Metrics registry, for the HTTP endpoint and tests.
    #[must_use]
    pub fn metrics_registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    /// Session registry, for tests and diagnostics.
    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    fn connection_ctx(&self) -> ConnectionCtx {
        ConnectionCtx {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            metrics: self.registry.metrics().clone(),
            auth: Arc::clone(&self.auth),
            history: self.history.clone(),
            clock: Arc::clone(&self.clock),
            epoch: self.epoch,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the daemon until the shutdown token fires, then drains.
    pub async fn run(self) {
        let addr = self
            .listener
            .local_addr()
            .map_or_else(|_| "<unknown>".to_string(), |a| a.to_string());
        info!(
            addr = %addr,
            max_connections = self.config.server.max_connections,
            tls = self.config.security.enable_tls,
            "daemon started"
        );

        let periodic = self.spawn_periodic_tasks();
        let metrics_task = self.spawn_metrics_endpoint();

        let mut sessions: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                // Reap finished session tasks so the set stays small.
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        // The driver absorbs its own errors; reaching this
                        // means a panic, which must not take the daemon.
                        error!(error = %e, "session task aborted abnormally");
                    }
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr, permit)) => {
                            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                            let ctx = self.connection_ctx();
                            let tls = self.listener.tls_acceptor();
                            sessions.spawn(async move {
                                match upgrade(stream, tls).await {
                                    Ok(stream) => {
                                        run_connection(ctx, id, stream, peer_addr, permit).await;
                                    },
                                    Err(e) => {
                                        debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                                        drop(permit);
                                    },
                                }
                            });
                        },
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        },
                    }
                },
            }
        }

        info!("shutdown requested, draining sessions");
        // Sessions hold child tokens of the shutdown token, so every
        // driver is already draining toward a "server" close; Ready
        // sessions get the explicit cause recorded for metrics.
        for handle in self.router.handles() {
            handle.request_close(DisconnectCause::Shutdown);
        }

        let deadline = self.config.graceful_shutdown_deadline();
        let drained = tokio::time::timeout(deadline, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "graceful shutdown deadline exceeded, forcing close"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        for task in periodic {
            task.abort();
        }
        if let Some(task) = metrics_task {
            // The endpoint observes the shutdown token; give it a moment
            // before abandoning it.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        info!("daemon stopped");
    }

    fn spawn_periodic_tasks(&self) -> Vec<JoinHandle<()>> {
        let metrics = self.registry.metrics().clone();

        let reaper = {
            let router = Arc::clone(&self.router);
            let clock = Arc::clone(&self.clock);
            let metrics = metrics.clone();
            let idle_timeout = self.config.idle_timeout();
            let epoch = self.epoch;
            spawn_periodic(
                "reaper",
                REAPER_INTERVAL,
                self.shutdown.clone(),
                metrics.clone(),
                move || {
                    let router = Arc::clone(&router);
                    let clock = Arc::clone(&clock);
                    let metrics = metrics.clone();
                    async move {
                        let now = clock.now();
                        for handle in router.handles() {
                            if handle.cancel.is_cancelled() {
                                // Closed but not yet removed; force it out.
                                if router.unregister(handle.id).is_some() {
                                    metrics.session_unregistered();
                                    debug!(session = handle.id, "reaped dead registry entry");
                                }
                            } else if handle.stats.idle_for(epoch, now) >= idle_timeout {
                                info!(session = handle.id, "reaper closing idle session");
                                handle.request_close(DisconnectCause::Idle);
                            }
                        }
                        Ok(())
                    }
                },
            )
        };

        let rekeyer = {
            let router = Arc::clone(&self.router);
            let clock = Arc::clone(&self.clock);
            let interval = self.config.key_rotation_interval();
            let epoch = self.epoch;
            spawn_periodic(
                "rekeyer",
                REKEYER_INTERVAL,
                self.shutdown.clone(),
                metrics.clone(),
                move || {
                    let router = Arc::clone(&router);
                    let clock = Arc::clone(&clock);
                    async move {
                        let now = clock.now();
                        for handle in router.handles() {
                            if handle.stats.key_age(epoch, now) >= interval {
                                debug!(session = handle.id, "rekeyer flagging stale keys");
                                handle.rekey_requested.store(true, Ordering::Relaxed);
                            }
                        }
                        Ok(())
                    }
                },
            )
        };

        let ticker = {
            let router = Arc::clone(&self.router);
            let epoch = self.epoch;
            let tick_metrics = metrics.clone();
            spawn_periodic(
                "metrics-tick",
                METRICS_TICK_INTERVAL,
                self.shutdown.clone(),
                metrics,
                move || {
                    let router = Arc::clone(&router);
                    let metrics = tick_metrics.clone();
                    async move {
                        metrics.set_sessions_active(router.len());
                        metrics.set_uptime_seconds(epoch.elapsed().as_secs());
                        Ok(())
                    }
                },
            )
        };

        vec![reaper, rekeyer, ticker]
    }

    fn spawn_metrics_endpoint(&self) -> Option<JoinHandle<()>> {
        if !self.config.monitoring.enable_metrics {
            info!("metrics endpoint disabled");
            return None;
        }
        let addr: SocketAddr = ([127, 0, 0, 1], self.config.monitoring.metrics_port).into();
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_metrics(registry, addr, shutdown).await {
                error!(error = %e, "metrics endpoint failed");
            }
        }))
    }
}

/// Runs `task` every `interval`, restarting with exponential backoff on
/// failure. Repeated consecutive failures inside the alert window raise
/// the alert counter; the task itself never dies.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    metrics: ServerMetrics,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let mut consecutive_failures = 0u32;
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {},
            }

            match task().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    backoff = Duration::from_secs(1);
                },
                Err(e) => {
                    warn!(task = name, error = %e, "periodic task failed, backing off");
                    metrics.task_failure(name);

                    if window_start.elapsed() > TASK_ALERT_WINDOW {
                        window_start = Instant::now();
                        consecutive_failures = 0;
                    }
                    consecutive_failures += 1;
                    if consecutive_failures >= TASK_ALERT_THRESHOLD {
                        error!(task = name, failures = consecutive_failures, "periodic task failing repeatedly");
                        metrics.task_alert(name);
                        consecutive_failures = 0;
                    }

                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {},
                    }
                    backoff = (backoff * 2).min(MAX_TASK_BACKOFF);
                },
            }
        }
        debug!(task = name, "periodic task stopped");
    })
}
