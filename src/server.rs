//! Port lifecycle: probe, bind, delayed fallback, and live reconfiguration.
//!
//! [`RelayServer`] owns at most one listening socket at a time and the
//! authoritative [`ServerStatus`].  Binding is separated from probing so
//! "port taken by a foreign process" is distinguishable from "our own prior
//! listener still shutting down", and bind failure degrades to a known-good
//! default port instead of leaving the relay silently dead.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::relay::{app, RelayState};
use crate::rlog;
use crate::status::{ServerStatus, StatusBus};

/// Port used when none is configured, and the fallback after a bind conflict.
pub const DEFAULT_PORT: u16 = 12380;

/// Delay before retrying on the fallback port after a bind conflict.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How long [`probe_port`] keeps re-trying a busy port before declaring it
/// occupied.  Covers the window in which our own previous listener is still
/// releasing the port after a restart.
const PROBE_ATTEMPTS: u32 = 5;
const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct RelayConfig {
    /// Initial listening port.
    pub port: u16,
    /// Hard-coded fallback when binding the configured port fails.
    pub fallback_port: u16,
    /// Network history record ceiling.
    pub history_capacity: usize,
    pub retry_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            port: DEFAULT_PORT,
            fallback_port: DEFAULT_PORT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// The relay's listening-socket owner.
///
/// Cheap to clone; clones share the listener, peer registry, history store,
/// and status bus.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    state: RelayState,
    status: StatusBus,
    inner: Arc<Mutex<ListenerInner>>,
}

struct ListenerInner {
    shutdown: Option<oneshot::Sender<()>>,
    bound_port: Option<u16>,
    /// Last explicitly requested port; `start(None)` reuses it.
    configured_port: u16,
    /// Bumped by every start/stop; a pending delayed retry whose generation
    /// no longer matches is stale and ignores itself.
    generation: u64,
    /// A delayed fallback retry is scheduled and has not yet fired.
    fallback_pending: bool,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let state = RelayState::new(config.history_capacity);
        let configured_port = config.port;
        RelayServer {
            config,
            state,
            status: StatusBus::new(),
            inner: Arc::new(Mutex::new(ListenerInner {
                shutdown: None,
                bound_port: None,
                configured_port,
                generation: 0,
                fallback_pending: false,
            })),
        }
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The port the active listener is bound to, if any.
    pub async fn bound_port(&self) -> Option<u16> {
        self.inner.lock().await.bound_port
    }

    /// Bind and start accepting peers.
    ///
    /// `None` reuses the last configured port.  An already-running server is
    /// fully stopped first (idempotent restart).  A bind conflict publishes
    /// `{running: false, error}` and schedules one delayed retry on the
    /// fallback port; success publishes `{running: true, port}` before any
    /// peer can connect.  Port 0 binds an ephemeral port and the published
    /// status carries the actual one.
    pub async fn start(&self, port: Option<u16>) {
        let (port, generation) = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.fallback_pending = false;
            if let Some(port) = port {
                inner.configured_port = port;
            }
            if let Some(shutdown) = inner.shutdown.take() {
                let _ = shutdown.send(());
            }
            inner.bound_port = None;
            (inner.configured_port, inner.generation)
        };
        self.state.clear_peers().await;
        self.start_on(port, generation, true).await;
    }

    /// Validate and switch to a new port, restarting the listener.
    ///
    /// Out-of-range values are rejected as a logged no-op; a failure to bind
    /// the new port falls back to the default port rather than surfacing an
    /// error to the caller.
    pub async fn set_port(&self, port: u32) {
        if port == 0 || port > u32::from(u16::MAX) {
            rlog!("relay: ignoring invalid port {port}");
            return;
        }
        self.start(Some(port as u16)).await;
    }

    /// Close every peer, close the listener, publish `{running: false}`.
    ///
    /// Also cancels a pending fallback retry, publishing `{running: false}`
    /// so the last observed status is never a stale bind error.  Stopping an
    /// already-stopped server with nothing pending is a no-op.
    pub async fn stop(&self) {
        let (was_running, had_pending) = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.bound_port = None;
            let had_pending = std::mem::take(&mut inner.fallback_pending);
            let was_running = match inner.shutdown.take() {
                Some(shutdown) => {
                    let _ = shutdown.send(());
                    true
                }
                None => false,
            };
            (was_running, had_pending)
        };
        self.state.clear_peers().await;
        if was_running || had_pending {
            self.status.publish(&ServerStatus::stopped());
            rlog!("relay: stopped");
        }
    }

    fn start_on(
        &self,
        port: u16,
        generation: u64,
        fallback_on_failure: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        if port != 0 && probe_port(port).await {
            if !self.is_current(generation).await {
                return;
            }
            rlog!("relay: port {port} in use");
            self.status
                .publish(&ServerStatus::error(port, format!("port {port} in use")));
            if fallback_on_failure {
                self.schedule_fallback(generation).await;
            }
            return;
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(error) => {
                if !self.is_current(generation).await {
                    return;
                }
                // Probe passed but bind lost the race, or some other local
                // failure; surfaced once, never a crash.
                rlog!("relay: failed to bind port {port}: {error}");
                self.status
                    .publish(&ServerStatus::error(port, error.to_string()));
                if fallback_on_failure {
                    self.schedule_fallback(generation).await;
                }
                return;
            }
        };

        let bound = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            // Probing and binding ran outside the lock, so a newer
            // start/set_port/stop may have won in the meantime.  Re-check
            // under the lock before installing: a stale listener is dropped
            // here instead of usurping the current one.
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                rlog!("relay: discarding superseded listener on port {bound}");
                return;
            }
            inner.shutdown = Some(shutdown_tx);
            inner.bound_port = Some(bound);
            inner.configured_port = bound;
        }

        // Status goes out before the accept loop spins up.
        self.status.publish(&ServerStatus::running(bound));
        rlog!("relay: listening on port {bound}");

        let app = app(self.state.clone());
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(error) = server.await {
                rlog!("relay: server error: {error}");
            }
        });
        })
    }

    /// One delayed retry on the fallback port.  Superseded, not doubled, by
    /// any intervening `start`/`set_port`/`stop`.
    async fn schedule_fallback(&self, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.fallback_pending = true;
        }
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(server.config.retry_delay).await;
            {
                let mut inner = server.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.fallback_pending = false;
            }
            rlog!(
                "relay: retrying on default port {}",
                server.config.fallback_port
            );
            server
                .start_on(server.config.fallback_port, generation, false)
                .await;
        });
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.generation == generation
    }
}

/// Whether `port` is occupied by another listener.
///
/// The check binds and immediately releases the port, so it never leaves a
/// stray listener behind.  A busy port is re-checked a few times to let our
/// own just-closed listener finish releasing it.
async fn probe_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    for attempt in 0..PROBE_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                return false;
            }
            Err(_) if attempt + 1 < PROBE_ATTEMPTS => {
                tokio::time::sleep(PROBE_RETRY_INTERVAL).await;
            }
            Err(_) => {}
        }
    }
    true
}
