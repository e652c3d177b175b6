//! Server lifecycle operations used by the CLI
//!
//! `start` spawns `kiln server listen` as a detached child whose stderr goes
//! to `{state_dir}/server-<port>.log`, then waits for it to answer `Ping`.

use crate::build::BuildService;
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use crate::events::EventLog;
use crate::server::client::Client;
use crate::server::daemon::{bind, BuildServer};
use crate::server::protocol::Pong;
use crate::server::registry::{kill_pid, Registry, ServerInstance};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Delay between readiness probes
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Result of `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new server was spawned and answered
    Started(Pong),
    /// A server was already listening on the port
    AlreadyRunning(Pong),
}

impl StartOutcome {
    pub fn pong(&self) -> &Pong {
        match self {
            Self::Started(pong) | Self::AlreadyRunning(pong) => pong,
        }
    }
}

/// Result of `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was listening on the port
    NotRunning,
    /// The server shut down after a `Stop` request
    Stopped,
    /// The server did not exit in time and was killed
    Killed,
}

/// Starts, stops and lists build servers
pub struct ServerControl {
    config: Config,
    registry: Registry,
    /// Config file forwarded to spawned servers
    config_path: Option<PathBuf>,
}

impl ServerControl {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            registry: Registry::default(),
            config_path,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Port from the argument or configuration
    pub fn port(&self, port: Option<u16>) -> u16 {
        port.unwrap_or(self.config.server.port)
    }

    /// `Some` when a server answers on `port`
    pub async fn ping(&self, port: u16) -> Option<Pong> {
        Client::new(port).ping().await.ok()
    }

    /// Ensure a server is listening on `port`, spawning one if needed
    pub async fn start(&self, port: u16) -> KilnResult<StartOutcome> {
        if let Some(pong) = self.ping(port).await {
            debug!("Server already running on port {} (pid {})", port, pong.pid);
            return Ok(StartOutcome::AlreadyRunning(pong));
        }

        ConfigManager::ensure_state_dirs().await?;
        let log_path = ConfigManager::server_log_path(port);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| KilnError::io(format!("opening {}", log_path.display()), e))?;

        let exe = std::env::current_exe()
            .map_err(|e| KilnError::io("locating the kiln executable", e))?;
        let mut command = Command::new(&exe);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .args(["server", "listen", "--port", &port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| KilnError::command_failed(exe.display().to_string(), e))?;
        info!("Spawned build server pid {:?} on port {}", child.id(), port);

        let timeout = Duration::from_millis(self.config.server.start_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pong) = self.ping(port).await {
                return Ok(if Some(pong.pid) == child.id() {
                    StartOutcome::Started(pong)
                } else {
                    StartOutcome::AlreadyRunning(pong)
                });
            }

            if let Ok(Some(status)) = child.try_wait() {
                // A concurrent start may have won the port
                if let Some(pong) = self.ping(port).await {
                    return Ok(StartOutcome::AlreadyRunning(pong));
                }
                return Err(KilnError::ServerTransport {
                    port,
                    reason: format!(
                        "server exited with {} (see {})",
                        status,
                        log_path.display()
                    ),
                });
            }

            if Instant::now() >= deadline {
                return Err(KilnError::ServerStartTimeout {
                    port,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Stop the server on `port`, killing it if it does not exit in time
    pub async fn stop(&self, port: u16) -> KilnResult<StopOutcome> {
        let client = Client::new(port);
        let registered = self.registry.find(port).await?;

        if let Err(e) = client.stop().await {
            debug!("Stop request to port {} failed: {}", port, e);
            return match registered {
                Some(instance) => self.kill(instance).await,
                None => Ok(StopOutcome::NotRunning),
            };
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.server.stop_timeout_ms);
        while Instant::now() < deadline {
            if !client.is_listening().await {
                return Ok(StopOutcome::Stopped);
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        match registered {
            Some(instance) => self.kill(instance).await,
            None => Err(KilnError::ServerTransport {
                port,
                reason: "server did not stop and is not registered".to_string(),
            }),
        }
    }

    async fn kill(&self, instance: ServerInstance) -> KilnResult<StopOutcome> {
        if instance.pid == std::process::id() {
            return Err(KilnError::Internal(
                "refusing to kill the current process".to_string(),
            ));
        }
        warn!(
            "Killing unresponsive server pid {} on port {}",
            instance.pid, instance.port
        );
        kill_pid(instance.pid);
        self.registry.deregister(instance.port, instance.pid).await?;
        Ok(StopOutcome::Killed)
    }

    /// Stop then start
    pub async fn restart(&self, port: u16) -> KilnResult<StartOutcome> {
        self.stop(port).await?;
        self.start(port).await
    }

    /// Live registered servers
    pub async fn list(&self) -> KilnResult<Vec<ServerInstance>> {
        self.registry.list().await
    }

    /// Stop every registered server, returning how many were stopped
    pub async fn kill_all(&self) -> KilnResult<usize> {
        let mut stopped = 0;
        for instance in self.registry.list().await? {
            match self.stop(instance.port).await {
                Ok(StopOutcome::NotRunning) => {}
                Ok(_) => stopped += 1,
                Err(e) => warn!("Failed to stop server on port {}: {}", instance.port, e),
            }
        }
        Ok(stopped)
    }

    /// Serve in the foreground until stopped
    pub async fn listen(&self, port: u16) -> KilnResult<StartOutcome> {
        let listener = match bind(port).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return match self.ping(port).await {
                    Some(pong) => Ok(StartOutcome::AlreadyRunning(pong)),
                    None => Err(KilnError::ServerTransport {
                        port,
                        reason: "port in use by another program".to_string(),
                    }),
                };
            }
            Err(e) => {
                return Err(KilnError::ServerTransport {
                    port,
                    reason: e.to_string(),
                })
            }
        };

        let server = BuildServer::new(
            listener,
            BuildService::from_config(&self.config),
            self.config.server.clone(),
            self.registry.clone(),
            EventLog::new(self.config.general.event_log),
            self.config.compiler.program.clone(),
        )?;
        let pong = Pong {
            pid: std::process::id(),
            port: server.port(),
            started_at: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        server.run().await?;
        Ok(StartOutcome::Started(pong))
    }
}
