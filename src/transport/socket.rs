//! Socket transport over TCP and Unix domain sockets.
//!
//! The listener binds an endpoint and spawns an accept loop. Each accepted
//! connection gets two tasks:
//! - read task: decodes frames from the socket → [`ListenerEvent::Packet`]
//! - write task: drains encoded frames from the [`PeerLink`] → socket
//!
//! A framing or packet decode error ends the connection; the broker sees
//! [`ListenerEvent::Closed`] with the reason.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::constants::{ACCEPT_RETRY_DELAY, READ_BUFFER_SIZE};
use crate::protocol::framing::{encode_frame, FrameDecoder};
use crate::protocol::Packet;

use super::{recv_with_timeout, Channel, ClientId, Endpoint, ListenerEvent, PeerLink, TransportError};

// ─── Shared read/write loops ───────────────────────────────────────────────

/// Read frames until EOF or error, handing each packet to `emit`.
///
/// Stops early when `emit` returns `false`. Returns the close reason for
/// abnormal termination.
async fn read_frames<R, F>(label: &str, mut reader: R, mut emit: F) -> Option<String>
where
    R: AsyncRead + Unpin,
    F: FnMut(Packet) -> bool,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if decoder.has_partial() {
                    return Some("connection closed mid-frame".to_string());
                }
                return None;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(packets) => {
                    for packet in packets {
                        if !emit(packet) {
                            return None;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Socket] Dropping {label}: {e}");
                    return Some(e.to_string());
                }
            },
            Err(e) => {
                log::debug!("[Socket] Read error on {label}: {e}");
                return Some(e.to_string());
            }
        }
    }
}

/// Write queued frames until the sender side is dropped.
async fn write_frames<W>(label: String, mut writer: W, mut frames: UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            log::debug!("[Socket] Write error on {label}: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ─── Listener ──────────────────────────────────────────────────────────────

/// Broker-side socket listener.
#[derive(Debug)]
pub struct SocketListener {
    endpoint: Endpoint,
    socket_path: Option<PathBuf>,
    accept_handle: JoinHandle<()>,
}

impl SocketListener {
    /// Bind `endpoint` and start accepting connections.
    ///
    /// TCP port 0 binds an ephemeral port; [`SocketListener::endpoint`]
    /// reports the bound address. Stale Unix socket files are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the endpoint is
    /// not a socket endpoint.
    pub async fn bind(
        endpoint: &Endpoint,
        events: UnboundedSender<ListenerEvent>,
    ) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!("bind tcp://{addr}: {e}"))
                })?;
                let bound = Endpoint::Tcp(listener.local_addr()?.to_string());
                log::info!("[Socket] Listening on {bound}");
                let accept_handle = tokio::spawn(accept_tcp(listener, events));
                Ok(Self { endpoint: bound, socket_path: None, accept_handle })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let listener = bind_unix(path)?;
                log::info!("[Socket] Listening on {endpoint}");
                let accept_handle = tokio::spawn(accept_unix(listener, events));
                Ok(Self {
                    endpoint: endpoint.clone(),
                    socket_path: Some(path.clone()),
                    accept_handle,
                })
            }
            other => Err(TransportError::InvalidEndpoint(format!("{other} is not a socket endpoint"))),
        }
    }

    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting and remove the socket file, if any.
    ///
    /// Established connections are owned by the broker and close when it
    /// drops their links.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("[Socket] Could not remove {}: {e}", path.display());
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<UnixListener, TransportError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| {
            TransportError::ConnectionFailed(format!("remove stale socket {}: {e}", path.display()))
        })?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path).map_err(|e| {
        TransportError::ConnectionFailed(format!("bind {}: {e}", path.display()))
    })?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

/// Spawn the read/write tasks for one accepted stream and announce it.
fn spawn_connection<R, W>(
    client: ClientId,
    reader: R,
    writer: W,
    events: &UnboundedSender<ListenerEvent>,
) -> bool
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    // Packets must not reach the broker before the Accepted event does.
    let (start_tx, start_rx) = oneshot::channel::<()>();

    let read_client = client.clone();
    let read_events = events.clone();
    let read_handle = tokio::spawn(async move {
        if start_rx.await.is_err() {
            return;
        }
        let label = read_client.to_string();
        let reason = read_frames(&label, reader, |packet| {
            read_events
                .send(ListenerEvent::Packet { client: read_client.clone(), packet })
                .is_ok()
        })
        .await;
        log::info!("[Socket] Client disconnected: {read_client}");
        let _ = read_events.send(ListenerEvent::Closed { client: read_client, reason });
    });

    tokio::spawn(write_frames(client.to_string(), writer, frame_rx));

    let link = PeerLink::socket(frame_tx, read_handle.abort_handle());
    if events.send(ListenerEvent::Accepted { client, link }).is_err() {
        return false;
    }
    let _ = start_tx.send(());
    true
}

async fn accept_tcp(listener: TcpListener, events: UnboundedSender<ListenerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let client = ClientId::generate("tcp");
                log::info!("[Socket] Client connected: {client} from {addr}");
                let (reader, writer) = stream.into_split();
                if !spawn_connection(client, reader, writer, &events) {
                    log::warn!("[Socket] Broker event channel closed, stopping accept loop");
                    break;
                }
            }
            Err(e) => {
                log::error!("[Socket] Accept error: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(unix)]
async fn accept_unix(listener: UnixListener, events: UnboundedSender<ListenerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let client = ClientId::generate("ipc");
                log::info!("[Socket] Client connected: {client}");
                let (reader, writer) = stream.into_split();
                if !spawn_connection(client, reader, writer, &events) {
                    log::warn!("[Socket] Broker event channel closed, stopping accept loop");
                    break;
                }
            }
            Err(e) => {
                log::error!("[Socket] Accept error: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

// ─── Client channel ────────────────────────────────────────────────────────

/// Client side of a socket connection.
pub struct SocketChannel {
    peer: String,
    frame_tx: Option<UnboundedSender<Vec<u8>>>,
    rx: UnboundedReceiver<Result<Packet, TransportError>>,
    read_handle: JoinHandle<()>,
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SocketChannel {
    /// Connect to a TCP or Unix socket endpoint.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionFailed`] if nothing is listening.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let failed = |e: std::io::Error| TransportError::ConnectionFailed(format!("{endpoint}: {e}"));
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await.map_err(failed)?;
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                Ok(Self::spawn(endpoint.to_string(), reader, writer))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(failed)?;
                let (reader, writer) = stream.into_split();
                Ok(Self::spawn(endpoint.to_string(), reader, writer))
            }
            other => Err(TransportError::InvalidEndpoint(format!("{other} is not a socket endpoint"))),
        }
    }

    fn spawn<R, W>(peer: String, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (packet_tx, rx) = mpsc::unbounded_channel::<Result<Packet, TransportError>>();

        let label = peer.clone();
        let read_handle = tokio::spawn(async move {
            let reason = read_frames(&label, reader, |packet| packet_tx.send(Ok(packet)).is_ok()).await;
            if let Some(reason) = reason {
                let _ = packet_tx.send(Err(TransportError::Io(reason)));
            }
        });
        tokio::spawn(write_frames(peer.clone(), writer, frame_rx));

        Self { peer, frame_tx: Some(frame_tx), rx, read_handle }
    }
}

#[async_trait]
impl Channel for SocketChannel {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let tx = self.frame_tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(encode_frame(&packet)?).map_err(|_closed| TransportError::Closed)
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, TransportError> {
        match recv_with_timeout(timeout, self.rx.recv()).await? {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.frame_tx = None;
        self.read_handle.abort();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.read_handle.abort();
    }
}
