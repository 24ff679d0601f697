//! Binary stream boundary for continuous media/analysis feeds.
//!
//! A separate listener, fully decoupled from the envelope/RPC path. Each
//! transport frame is length-prefixed (`[u32 BE]`), and its payload has
//! the shape:
//!
//! ```text
//! TYPE SEP NAME SEP INDEX SEP PAYLOAD
//! ```
//!
//! where `SEP` is the two-byte marker `0x10 0x17`. Frames are dispatched
//! by TYPE to a per-type listener registered at startup; malformed frames
//! and unregistered types are logged and skipped, never fatal.

use anyhow::Result;
use bytes::Bytes;
use courier_core::config::StreamConfig;
use courier_core::{Envelope, RpcRelay};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// One parsed stream frame.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Frame type, selects the listener.
    pub kind: String,
    /// Stream name (e.g. a channel or file identity).
    pub name: String,
    /// Chunk index within the stream.
    pub index: u64,
    /// Raw chunk bytes; may itself contain separator bytes.
    pub payload: Bytes,
}

impl StreamFrame {
    /// Encode into the on-wire field layout (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let sep = StreamConfig::SEPARATOR;
        let mut out = Vec::with_capacity(
            self.kind.len() + self.name.len() + 24 + self.payload.len(),
        );
        out.extend_from_slice(self.kind.as_bytes());
        out.extend_from_slice(&sep);
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&sep);
        out.extend_from_slice(self.index.to_string().as_bytes());
        out.extend_from_slice(&sep);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse the field layout. The first three fields are separator-free
    /// by construction; everything after the third separator is payload,
    /// separator bytes included.
    pub fn parse(raw: &[u8]) -> Option<StreamFrame> {
        let sep = StreamConfig::SEPARATOR;
        let mut fields: Vec<&[u8]> = Vec::with_capacity(3);
        let mut rest = raw;

        for _ in 0..3 {
            let at = rest
                .windows(2)
                .position(|window| window == sep)?;
            fields.push(&rest[..at]);
            rest = &rest[at + 2..];
        }

        let kind = std::str::from_utf8(fields[0]).ok()?;
        let name = std::str::from_utf8(fields[1]).ok()?;
        let index: u64 = std::str::from_utf8(fields[2]).ok()?.parse().ok()?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }

        Some(StreamFrame {
            kind: kind.to_string(),
            name: name.to_string(),
            index,
            payload: Bytes::copy_from_slice(rest),
        })
    }
}

/// Per-type stream consumer.
#[async_trait::async_trait]
pub trait StreamListener: Send + Sync + 'static {
    async fn on_stream(&self, peer: SocketAddr, frame: StreamFrame);
}

/// TYPE → listener registry, populated once at startup.
#[derive(Default)]
pub struct StreamRegistry {
    listeners: HashMap<String, Arc<dyn StreamListener>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, listener: Arc<dyn StreamListener>) {
        self.listeners.insert(kind.into(), listener);
    }

    fn listener(&self, kind: &str) -> Option<Arc<dyn StreamListener>> {
        self.listeners.get(kind).cloned()
    }
}

/// Default listener: forwards a per-frame chunk notice to a backend
/// service over the relay. The raw payload stays on the gateway side.
pub struct RelayStreamListener {
    relay: Arc<RpcRelay>,
    service: String,
}

impl RelayStreamListener {
    pub fn new(relay: Arc<RpcRelay>, service: impl Into<String>) -> Self {
        Self {
            relay,
            service: service.into(),
        }
    }
}

#[async_trait::async_trait]
impl StreamListener for RelayStreamListener {
    async fn on_stream(&self, peer: SocketAddr, frame: StreamFrame) {
        let notice = Envelope::event(
            "StreamChunk",
            json!({
                "kind": frame.kind,
                "name": frame.name,
                "index": frame.index,
                "size": frame.payload.len(),
                "peer": peer.to_string(),
            }),
        );
        self.relay.transmit_async(&self.service, notice).await;
    }
}

/// Handle to a running stream server. Dropping shuts down the server.
pub struct StreamServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl StreamServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for StreamServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Stream server accepting raw binary feeds.
pub struct StreamServer;

impl StreamServer {
    pub async fn start(addr: &str, registry: StreamRegistry) -> Result<StreamServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let registry = Arc::new(registry);

        info!("stream server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(StreamServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<StreamRegistry>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("stream server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let registry = registry.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                debug!("stream connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    peer_addr,
                                    &registry,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("stream connection {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("stream accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        registry: &StreamRegistry,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, _writer) = stream.split();

        loop {
            let raw = tokio::select! {
                result = Self::read_frame(&mut reader) => {
                    match result? {
                        Some(raw) => raw,
                        None => return Ok(()), // clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let frame = match StreamFrame::parse(&raw) {
                Some(frame) => frame,
                None => {
                    warn!("malformed stream frame from {} skipped", peer);
                    continue;
                }
            };

            match registry.listener(&frame.kind) {
                Some(listener) => listener.on_stream(peer, frame).await,
                None => {
                    warn!("no listener for stream type '{}', frame dropped", frame.kind);
                }
            }
        }
    }

    async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > StreamConfig::MAX_FRAME_SIZE {
            anyhow::bail!("stream frame size {} exceeds maximum", len);
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

/// Write one frame with its length prefix (client side; used by feeders
/// and tests).
pub async fn write_stream_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &StreamFrame,
) -> Result<()> {
    let raw = frame.encode();
    writer.write_all(&(raw.len() as u32).to_be_bytes()).await?;
    writer.write_all(&raw).await?;
    writer.flush().await?;
    Ok(())
}
