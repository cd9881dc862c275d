use crate::backend::{IoBackend, IoError, IoSnapshot};
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{
    CommandHandler, CommandStats, SessionAction, KILL_FAREWELL, MAX_COMMAND_SIZE, QUIT_FAREWELL,
};
use crate::scheduler::{RateSelector, Ticker, TickerStats};
use crate::telemetry::TelemetryEncoder;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: u32 = 5;

/// Failures that stop the whole server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("IO backend failed to initialise: {0}")]
    Backend(#[from] IoError),
    #[error("failed to listen on {addr}: {source}")]
    TcpBind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("failed to bind telemetry socket on {addr}: {source}")]
    UdpBind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(io::Error),
}

/// Failures that end a single session; the server goes back to accepting.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer closed the connection")]
    Disconnected,
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

#[derive(Debug)]
pub enum SessionEnd {
    Quit,
    Killed,
    Disconnected,
    Dropped(SessionError),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerStats {
    pub sessions: u64,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub scan_errors: u64,
    pub commands: CommandStats,
    pub ticker: TickerStats,
}

/// One accepted control connection.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    telemetry_dest: SocketAddr,
    rx: [u8; MAX_COMMAND_SIZE],
}

impl Session {
    /// Telemetry goes to the peer's IP on `telemetry_port`, independent of the
    /// peer's TCP port.
    pub fn new(stream: TcpStream, peer: SocketAddr, telemetry_port: u16) -> Self {
        Self {
            stream,
            peer,
            telemetry_dest: SocketAddr::new(peer.ip(), telemetry_port),
            rx: [0; MAX_COMMAND_SIZE],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn telemetry_dest(&self) -> SocketAddr {
        self.telemetry_dest
    }

    /// Attempt exactly one non-blocking read.
    ///
    /// Whatever a single read returns is one command; nothing is carried over
    /// to the next call.
    pub fn poll_command(&mut self) -> nb::Result<&[u8], SessionError> {
        match self.stream.try_read(&mut self.rx) {
            Ok(0) => Err(nb::Error::Other(SessionError::Disconnected)),
            Ok(len) => Ok(&self.rx[..len]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(SessionError::Read(e))),
        }
    }

    pub async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), SessionError> {
        match tokio::time::timeout(timeout, self.stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Write(e)),
            Err(_) => Err(SessionError::WriteTimeout(timeout)),
        }
    }
}

/// Single-client control server.
///
/// Accepts one connection at a time and, for as long as it lasts, runs the
/// tick loop: sleep to the next deadline, scan the backend, send one telemetry
/// packet to the peer, then poll the connection once for a command.
pub struct Server<B: IoBackend> {
    config: ServerConfig,
    listener: TcpListener,
    telemetry: UdpSocket,
    backend: B,
    encoder: TelemetryEncoder,
    handler: CommandHandler,
    rates: RateSelector,
    ticker: Ticker,
    snapshot: IoSnapshot,
    stats: ServerStats,
    send_failing: bool,
    scan_failing: bool,
}

impl<B: IoBackend> Server<B> {
    /// Initialise the backend and bind both sockets.
    ///
    /// The tick deadline is seeded here, once, and carried across sessions.
    pub async fn bind(config: ServerConfig, mut backend: B) -> Result<Self, ServerError> {
        config.validate()?;
        let rates = config.rate_selector()?;
        backend.init()?;

        let tcp_addr = config.tcp_addr();
        let listener = match bind_listener(tcp_addr) {
            Ok(listener) => listener,
            Err(source) => {
                backend.close();
                return Err(ServerError::TcpBind {
                    addr: tcp_addr,
                    source,
                });
            }
        };

        let udp_addr = config.udp_local_addr();
        let telemetry = match UdpSocket::bind(udp_addr).await {
            Ok(socket) => socket,
            Err(source) => {
                backend.close();
                return Err(ServerError::UdpBind {
                    addr: udp_addr,
                    source,
                });
            }
        };

        let ticker = match Ticker::precise() {
            Ok(ticker) => ticker,
            Err(e) => {
                warn!(error = %e, "high-resolution timer unavailable, using millisecond timer");
                Ticker::new()
            }
        };

        info!(
            tcp = %listener.local_addr().unwrap_or(tcp_addr),
            udp = %telemetry.local_addr().unwrap_or(udp_addr),
            telemetry_port = config.udp_remote_port,
            rate = rates.rate(),
            precise_timer = ticker.is_precise(),
            "server bound"
        );

        Ok(Self {
            config,
            listener,
            telemetry,
            backend,
            encoder: TelemetryEncoder::new(),
            handler: CommandHandler::new(),
            rates,
            ticker,
            snapshot: IoSnapshot::default(),
            stats: ServerStats::default(),
            send_failing: false,
            scan_failing: false,
        })
    }

    /// Serve sessions until a client sends the kill command.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        loop {
            if let SessionEnd::Killed = self.serve_one().await? {
                let summary = serde_json::to_string(&self.stats()).unwrap_or_default();
                info!(%summary, "server stopped");
                return Ok(());
            }
        }
    }

    /// Accept one client and serve it until the session ends.
    pub async fn serve_one(&mut self) -> Result<SessionEnd, ServerError> {
        info!("waiting for client");
        let (stream, peer) = self.listener.accept().await.map_err(ServerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle");
        }

        let mut session = Session::new(stream, peer, self.config.udp_remote_port);
        self.stats.sessions += 1;
        if self.config.resync_on_accept {
            self.ticker.resync();
        }
        info!(
            %peer,
            telemetry = %session.telemetry_dest(),
            rate = self.rates.rate(),
            "client connected"
        );

        let end = self.drive(&mut session).await;
        match &end {
            SessionEnd::Quit => info!(%peer, "client quit"),
            SessionEnd::Killed => info!(%peer, "kill requested"),
            SessionEnd::Disconnected => info!(%peer, "client disconnected"),
            SessionEnd::Dropped(e) => warn!(%peer, error = %e, "session dropped"),
        }
        Ok(end)
    }

    async fn drive(&mut self, session: &mut Session) -> SessionEnd {
        let write_timeout = self.config.write_timeout();
        loop {
            let action = loop {
                self.tick(session.telemetry_dest()).await;
                match session.poll_command() {
                    Ok(input) => {
                        break self.handler.handle(
                            input,
                            &mut self.backend,
                            &mut self.rates,
                            &mut self.snapshot,
                        )
                    }
                    Err(nb::Error::WouldBlock) => {}
                    Err(nb::Error::Other(SessionError::Disconnected)) => {
                        return SessionEnd::Disconnected
                    }
                    Err(nb::Error::Other(e)) => return SessionEnd::Dropped(e),
                }
            };

            let response = self.handler.response();
            if !response.is_empty() {
                if let Err(e) = session.send(response, write_timeout).await {
                    return SessionEnd::Dropped(e);
                }
            }

            match action {
                SessionAction::Continue => {}
                SessionAction::EndSession => {
                    info!(peer = %session.peer(), "dropping connection");
                    let linger = self.config.quit_linger();
                    farewell(session, QUIT_FAREWELL, linger, write_timeout).await;
                    return SessionEnd::Quit;
                }
                SessionAction::Terminate => {
                    info!(peer = %session.peer(), "killing process");
                    let linger = self.config.kill_linger();
                    farewell(session, KILL_FAREWELL, linger, write_timeout).await;
                    return SessionEnd::Killed;
                }
            }
        }
    }

    async fn tick(&mut self, destination: SocketAddr) {
        self.ticker.tick(&self.rates).await;

        match self.backend.scan() {
            Ok(snapshot) => {
                self.snapshot = snapshot;
                self.scan_failing = false;
            }
            Err(e) => {
                self.stats.scan_errors += 1;
                if !self.scan_failing {
                    warn!(error = %e, "IO scan failed, sending previous snapshot");
                }
                self.scan_failing = true;
            }
        }

        let frame = self.encoder.encode(&self.snapshot);
        match self.telemetry.send_to(&frame, destination).await {
            Ok(_) => {
                self.stats.packets_sent += 1;
                if self.send_failing {
                    info!(%destination, "telemetry send recovered");
                }
                self.send_failing = false;
            }
            Err(e) => {
                self.stats.send_errors += 1;
                if self.send_failing {
                    debug!(%destination, error = %e, "telemetry send failed");
                } else {
                    warn!(%destination, error = %e, "telemetry send failed");
                }
                self.send_failing = true;
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn telemetry_addr(&self) -> io::Result<SocketAddr> {
        self.telemetry.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rates(&self) -> &RateSelector {
        &self.rates
    }

    pub fn snapshot(&self) -> IoSnapshot {
        self.snapshot
    }

    pub fn sequence(&self) -> u16 {
        self.encoder.sequence()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            commands: self.handler.stats(),
            ticker: self.ticker.stats(),
            ..self.stats
        }
    }
}

impl<B: IoBackend> Drop for Server<B> {
    fn drop(&mut self) {
        self.backend.close();
    }
}

async fn farewell(session: &mut Session, message: &str, linger: Duration, timeout: Duration) {
    if let Err(e) = session.send(message.as_bytes(), timeout).await {
        debug!(error = %e, "farewell not delivered");
    }
    // Give the peer time to drain the socket before it is closed
    tokio::time::sleep(linger).await;
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (client, accepted, peer)
    }

    #[tokio::test]
    async fn test_session_addresses() {
        let (client, accepted, peer) = connected_pair().await;
        let session = Session::new(accepted, peer, 4000);

        assert_eq!(session.peer(), client.local_addr().unwrap());
        assert_eq!(session.telemetry_dest(), SocketAddr::new(peer.ip(), 4000));
        assert_ne!(session.telemetry_dest().port(), peer.port());
    }

    #[tokio::test]
    async fn test_poll_command_returns_one_read() {
        let (mut client, accepted, peer) = connected_pair().await;
        let mut session = Session::new(accepted, peer, 4000);

        assert!(matches!(session.poll_command(), Err(nb::Error::WouldBlock)));

        client.write_all(b"rd\r\n").await.unwrap();
        session.stream.readable().await.unwrap();
        assert_eq!(session.poll_command().unwrap(), b"rd\r\n");

        session.send(b"5\r\n", Duration::from_secs(1)).await.unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"5\r\n");

        drop(client);
        session.stream.readable().await.unwrap();
        assert!(matches!(
            session.poll_command(),
            Err(nb::Error::Other(SessionError::Disconnected))
        ));
    }
}
