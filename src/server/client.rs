//! Client side of the build server protocol

use crate::build::{BuildRequest, BuildResult};
use crate::error::{KilnError, KilnResult};
use crate::server::protocol::{read_frame, write_frame, Pong, Request, Response};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

/// How long to wait for the TCP handshake
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long control requests may take to answer
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to one server port on the loopback interface
#[derive(Debug, Clone, Copy)]
pub struct Client {
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn transport(&self, reason: impl ToString) -> KilnError {
        KilnError::ServerTransport {
            port: self.port,
            reason: reason.to_string(),
        }
    }

    /// Send one request and wait for its response
    async fn request(&self, request: &Request, timeout: Option<Duration>) -> KilnResult<Response> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| self.transport("connect timed out"))?
            .map_err(|e| self.transport(e))?;

        let exchange = async {
            let (read, mut write) = stream.into_split();
            write_frame(&mut write, request).await?;
            let mut reader = BufReader::new(read);
            read_frame::<_, Response>(&mut reader).await
        };

        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| self.transport("no response"))?,
            None => exchange.await,
        };

        match response {
            Ok(Some(Response::Error { message })) => Err(KilnError::ServerProtocol(message)),
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(self.transport("connection closed without response")),
            Err(KilnError::Io { source, .. }) => Err(self.transport(source)),
            Err(e) => Err(e),
        }
    }

    /// Identify the server; `Err` when nothing answers on the port
    pub async fn ping(&self) -> KilnResult<Pong> {
        match self.request(&Request::Ping, Some(CONTROL_TIMEOUT)).await? {
            Response::Pong(pong) => Ok(pong),
            other => Err(unexpected(&other)),
        }
    }

    /// Whether a kiln server answers on the port
    pub async fn is_listening(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Build on the server. Waits as long as the build takes.
    pub async fn build(&self, request: &BuildRequest) -> KilnResult<BuildResult> {
        debug!("Sending build of {} to port {}", request.script.display(), self.port);
        match self.request(&Request::Build(request.clone()), None).await? {
            Response::Built(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the server to shut down
    pub async fn stop(&self) -> KilnResult<()> {
        match self.request(&Request::Stop, Some(CONTROL_TIMEOUT)).await? {
            Response::Stopping => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> KilnError {
    KilnError::ServerProtocol(format!("unexpected response: {:?}", response))
}
