//! Bridge event loop: one task multiplexing the listener, the client socket, the
//! notify handle and the wake channel.
//!
//! Each iteration waits on all live members (in this priority: shutdown, listener,
//! client, notify handle, wake, scan end), handles the one that fired, then
//! delivers the pending wake notice if it can.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, LinkError};
use crate::scan::ScanMonitor;
use crate::shutdown::Shutdown;
use crate::state::ConnectionState;
use crate::transport::Transport;
use crate::wake::{wake_channel, WakeReceiver};

/// Resolve the configured host (IPv4) and listen with a backlog of one.
pub async fn bind_listener(config: &BridgeConfig) -> Result<TcpListener, BridgeError> {
    let target = config.listen_addr();
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| BridgeError::Config(format!("cannot resolve {target}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| BridgeError::Config(format!("no IPv4 address for {target}")))?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1)?;
    info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

enum Event {
    Shutdown,
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Client(io::Result<usize>),
    Notify(io::Result<usize>),
    Wake(u64),
    ScanEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Bridge<T: Transport> {
    config: Arc<BridgeConfig>,
    conn: ConnectionManager<T>,
    scan: ScanMonitor<T>,
    wake: WakeReceiver,
    shutdown: Shutdown,
    /// The one TCP session, if any.
    client: Option<TcpStream>,
    /// Set after a wake-triggered reconnect; cleared once the marker reaches a client.
    wake_notice_armed: bool,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: Arc<T>, config: BridgeConfig, shutdown: Shutdown) -> Self {
        let config = Arc::new(config);
        let (wake_tx, wake_rx) = wake_channel();
        Self {
            conn: ConnectionManager::new(transport.clone(), config.clone(), shutdown.clone()),
            scan: ScanMonitor::new(transport, config.clone(), wake_tx),
            config,
            wake: wake_rx,
            shutdown,
            client: None,
            wake_notice_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    #[cfg(test)]
    pub(crate) fn wake_sender(&self) -> crate::wake::WakeSender {
        self.scan.wake_sender()
    }

    /// Bring the link up, serve until shutdown or a fatal error, then release everything.
    pub async fn run(mut self, listener: TcpListener) -> Result<(), BridgeError> {
        let result = match self.bring_up().await {
            Ok(Flow::Continue) => self.serve(&listener).await,
            Ok(Flow::Exit) => Ok(()),
            Err(e) => Err(e),
        };
        self.teardown(listener).await;
        result
    }

    async fn bring_up(&mut self) -> Result<Flow, BridgeError> {
        match self.conn.connect().await {
            Ok(()) => Ok(Flow::Continue),
            Err(LinkError::Cancelled) => {
                info!("startup cancelled");
                Ok(Flow::Exit)
            }
            Err(e) if self.config.reconnect => {
                warn!(error = %e, "initial connect failed; retrying");
                self.reconnect_link().await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn serve(&mut self, listener: &TcpListener) -> Result<(), BridgeError> {
        let mut client_buf = Vec::new();
        let mut notify_buf = Vec::new();
        loop {
            if self.shutdown.is_triggered() {
                info!("interrupted");
                return Ok(());
            }
            let mtu = usize::from(self.conn.mtu());
            client_buf.resize(mtu, 0);
            notify_buf.resize(mtu, 0);

            let event = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => Event::Shutdown,
                res = listener.accept() => Event::Accept(res),
                res = read_some(self.client.as_mut(), &mut client_buf) => Event::Client(res),
                res = read_some(self.conn.notify_reader(), &mut notify_buf) => Event::Notify(res),
                n = self.wake.wait() => Event::Wake(n),
                _ = self.scan.ended() => Event::ScanEnded,
            };

            let flow = match event {
                Event::Shutdown => {
                    info!("interrupted");
                    Flow::Exit
                }
                Event::Accept(res) => self.on_accept(res)?,
                Event::Client(res) => self.on_client_read(res, &client_buf).await?,
                Event::Notify(res) => self.on_notify_read(res, &notify_buf).await?,
                Event::Wake(n) => self.on_wake(n).await?,
                Event::ScanEnded => {
                    self.on_scan_ended().await;
                    Flow::Continue
                }
            };
            if flow == Flow::Exit {
                return Ok(());
            }
            self.deliver_wake_notice().await?;
        }
    }

    fn on_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) -> Result<Flow, BridgeError> {
        let (stream, peer) = match res {
            Ok(accepted) => accepted,
            Err(e) if is_transient_accept_error(&e) => {
                debug!(error = %e, "accept interrupted");
                return Ok(Flow::Continue);
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                return Err(e.into());
            }
        };
        if self.client.is_some() {
            info!(%peer, "rejecting connection: a client is already attached");
            drop(stream);
            return Ok(Flow::Continue);
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "could not set TCP_NODELAY");
        }
        info!(%peer, "client connected");
        self.client = Some(stream);
        Ok(Flow::Continue)
    }

    async fn on_client_read(
        &mut self,
        res: io::Result<usize>,
        buf: &[u8],
    ) -> Result<Flow, BridgeError> {
        let n = match res {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
            Err(e) => {
                error!(error = %e, "client read failed");
                return Err(e.into());
            }
        };
        if n == 0 {
            info!("client disconnected");
            self.client = None;
            return Ok(Flow::Continue);
        }
        debug!(bytes = n, "client -> peripheral");
        self.forward_to_peripheral(&buf[..n]).await
    }

    async fn forward_to_peripheral(&mut self, payload: &[u8]) -> Result<Flow, BridgeError> {
        if !self.conn.state().is_ready() {
            // Someone is typing: bring the link up now rather than waiting for a wake.
            self.scan.stop(self.conn.state_mut()).await;
            info!("client data while link is down; reconnecting");
            if self.reconnect_link().await? == Flow::Exit {
                return Ok(Flow::Exit);
            }
        }
        let err = match self.conn.write_channel(payload).await {
            Ok(()) => return Ok(Flow::Continue),
            Err(e) => e,
        };
        warn!(error = %err, "peripheral write failed");
        if !self.config.reconnect {
            error!("reconnect disabled; giving up");
            return Err(BridgeError::WriteFailed(err));
        }
        if self.reconnect_link().await? == Flow::Exit {
            return Ok(Flow::Exit);
        }
        if let Err(e) = self.conn.write_channel(payload).await {
            error!(error = %e, "peripheral write failed after reconnect");
            return Err(BridgeError::WriteFailed(e));
        }
        Ok(Flow::Continue)
    }

    async fn on_notify_read(
        &mut self,
        res: io::Result<usize>,
        buf: &[u8],
    ) -> Result<Flow, BridgeError> {
        let n = match res {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
            Err(e) if is_link_loss(&e) => {
                debug!(error = %e, "notify handle reset");
                0
            }
            Err(e) => {
                error!(error = %e, "notify read failed");
                return Err(e.into());
            }
        };
        if n == 0 {
            self.on_link_dropped().await;
            return Ok(Flow::Continue);
        }
        let Some(client) = self.client.as_mut() else {
            debug!(bytes = n, "no client attached; dropping peripheral data");
            return Ok(Flow::Continue);
        };
        debug!(bytes = n, "peripheral -> client");
        let written = client.write(&buf[..n]).await.map_err(|e| {
            error!(error = %e, "client write failed");
            BridgeError::IoFatal(e)
        })?;
        if written < n {
            warn!(written, expected = n, "short write to client");
        }
        Ok(Flow::Continue)
    }

    async fn on_link_dropped(&mut self) {
        warn!("peripheral link dropped");
        self.conn.mark_link_dropped();
        if self.wake.is_pending() {
            debug!("wake already pending; skipping scan");
            return;
        }
        if let Err(e) = self.scan.start(self.conn.state_mut()).await {
            warn!(error = %e, "could not start wake scan");
        }
    }

    /// The property subscription went away under a running scan: start a fresh one.
    async fn on_scan_ended(&mut self) {
        warn!("wake scan lost its subscription; restarting");
        self.scan.stop(self.conn.state_mut()).await;
        if self.wake.is_pending() || self.conn.state().is_ready() {
            return;
        }
        if let Err(e) = self.scan.start(self.conn.state_mut()).await {
            warn!(error = %e, "could not restart wake scan");
        }
    }

    async fn on_wake(&mut self, coalesced: u64) -> Result<Flow, BridgeError> {
        info!(coalesced, "wake requested by peripheral");
        self.scan.stop(self.conn.state_mut()).await;
        if self.conn.state().is_ready() {
            debug!("link already up; wake ignored");
            return Ok(Flow::Continue);
        }
        if self.reconnect_link().await? == Flow::Exit {
            return Ok(Flow::Exit);
        }
        self.wake_notice_armed = true;
        Ok(Flow::Continue)
    }

    async fn reconnect_link(&mut self) -> Result<Flow, BridgeError> {
        match self.conn.reconnect().await {
            Ok(()) => Ok(Flow::Continue),
            Err(LinkError::Cancelled) => {
                info!("reconnect cancelled");
                Ok(Flow::Exit)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deliver_wake_notice(&mut self) -> Result<(), BridgeError> {
        if !self.wake_notice_armed || !self.conn.state().is_ready() {
            return Ok(());
        }
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        client
            .write_all(&self.config.wake_notice)
            .await
            .map_err(|e| {
                error!(error = %e, "wake notice write failed");
                BridgeError::IoFatal(e)
            })?;
        self.wake_notice_armed = false;
        debug!("wake notice sent");
        Ok(())
    }

    async fn teardown(&mut self, listener: TcpListener) {
        self.conn.close_notify();
        if let Some(mut client) = self.client.take() {
            let _ = client.shutdown().await;
            debug!("client socket closed");
        }
        drop(listener);
        self.scan.stop(self.conn.state_mut()).await;
        if self.config.keep_connected {
            info!("leaving peripheral connected");
        } else if self.conn.is_transport_connected() {
            if let Err(e) = self.conn.disconnect().await {
                warn!(error = %e, "peripheral disconnect failed");
            }
        }
    }
}

/// Read from an optional member; a missing member never becomes ready.
async fn read_some<R: AsyncRead + Unpin>(reader: Option<&mut R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

fn is_link_loss(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}
