//! The build server process
//!
//! # Lifecycle
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | Stopped | not bound |
//! | Starting | binding the listener |
//! | Listening | accepting connections, one task each |
//! | ShuttingDown | no longer accepting, draining in-flight builds |
//!
//! The server shuts down on a `Stop` request, on SIGINT/SIGTERM, or once it
//! has been idle for `server.idle_timeout_secs` with no request in flight.

use crate::build::BuildService;
use crate::config::schema::ServerConfig;
use crate::error::{KilnError, KilnResult};
use crate::events::{EventLog, EventType};
use crate::server::protocol::{read_frame, write_frame, Pong, Request, Response};
use crate::server::registry::{Registry, ServerInstance};
use chrono::{DateTime, Utc};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Server lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Stopped,
    Starting,
    Listening,
    ShuttingDown,
}

/// Interval at which the idle monitor and drain loop re-check state
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bind the loopback listener for `port` (0 picks a free port)
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}

/// Shared state of a running server
struct ServerState {
    service: BuildService,
    config: ServerConfig,
    port: u16,
    started_at: DateTime<Utc>,
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
    stop: watch::Sender<bool>,
}

impl ServerState {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn pong(&self) -> Pong {
        Pong {
            pid: std::process::id(),
            port: self.port,
            started_at: self.started_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Decrements the in-flight counter when a request finishes
struct InFlightGuard<'a>(&'a ServerState);

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a ServerState) -> Self {
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        state.touch();
        Self(state)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

/// A build server bound to a port
pub struct BuildServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    registry: Registry,
    events: EventLog,
    compiler: String,
    phase: watch::Sender<ServerPhase>,
}

impl BuildServer {
    /// Wrap an already-bound listener
    pub fn new(
        listener: TcpListener,
        service: BuildService,
        config: ServerConfig,
        registry: Registry,
        events: EventLog,
        compiler: String,
    ) -> KilnResult<Self> {
        let port = listener
            .local_addr()
            .map_err(|e| KilnError::io("reading listener address", e))?
            .port();
        let (stop, _) = watch::channel(false);
        let (phase, _) = watch::channel(ServerPhase::Starting);

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                service,
                config,
                port,
                started_at: Utc::now(),
                in_flight: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
                stop,
            }),
            registry,
            events,
            compiler,
            phase,
        })
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    /// Watch the lifecycle phase
    pub fn phase(&self) -> watch::Receiver<ServerPhase> {
        self.phase.subscribe()
    }

    /// Handle that asks the server to shut down
    pub fn stop_handle(&self) -> watch::Sender<bool> {
        self.state.stop.clone()
    }

    /// Serve until stopped, then drain and deregister
    pub async fn run(self) -> KilnResult<()> {
        let state = Arc::clone(&self.state);
        let pid = std::process::id();

        self.registry
            .register(ServerInstance {
                pid,
                port: state.port,
                started_at: state.started_at,
                compiler: self.compiler.clone(),
                idle_timeout_secs: state.config.idle_timeout_secs,
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await?;
        self.events
            .log(
                EventType::ServerStarted,
                serde_json::json!({"port": state.port, "pid": pid}),
            )
            .await;

        self.phase.send_replace(ServerPhase::Listening);
        info!("Build server listening on 127.0.0.1:{}", state.port);

        let reason = self.accept_loop().await;
        info!("Build server shutting down ({})", reason);
        self.phase.send_replace(ServerPhase::ShuttingDown);
        drop(self.listener);

        let drain = Duration::from_millis(state.config.drain_timeout_ms);
        let deadline = Instant::now() + drain;
        while state.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        let abandoned = state.in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!("{} request(s) still in flight after drain timeout", abandoned);
        }

        if let Err(e) = self.registry.deregister(state.port, pid).await {
            warn!("Failed to deregister server: {}", e);
        }
        self.events
            .log(
                EventType::ServerStopped,
                serde_json::json!({"port": state.port, "pid": pid, "reason": reason}),
            )
            .await;
        self.phase.send_replace(ServerPhase::Stopped);
        Ok(())
    }

    /// Accept connections until a stop condition, returning its description
    async fn accept_loop(&self) -> &'static str {
        let mut stop = self.state.stop.subscribe();
        let idle_limit = Duration::from_secs(self.state.config.idle_timeout_secs);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        self.state.touch();
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move { handle_connection(state, stream).await });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return "stop requested";
                    }
                }
                _ = &mut shutdown => return "signal",
                _ = ticker.tick() => {
                    if !idle_limit.is_zero()
                        && self.state.in_flight.load(Ordering::SeqCst) == 0
                        && self.state.idle_for() >= idle_limit
                    {
                        return "idle timeout";
                    }
                }
            }
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let request = match read_frame::<_, Request>(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            debug!("Rejecting frame: {}", e);
            let response = Response::Error {
                message: e.to_string(),
            };
            let _ = write_frame(&mut write, &response).await;
            return;
        }
    };

    let response = match request {
        Request::Ping => {
            state.touch();
            Response::Pong(state.pong())
        }
        Request::Build(request) => {
            let _guard = InFlightGuard::enter(&state);
            Response::Built(state.service.build(&request).await)
        }
        Request::Stop => {
            state.stop.send_replace(true);
            Response::Stopping
        }
    };

    if let Err(e) = write_frame(&mut write, &response).await {
        debug!("Client went away before the response: {}", e);
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut term) = signal(SignalKind::terminate()) else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
