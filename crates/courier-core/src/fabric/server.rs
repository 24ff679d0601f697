//! Fabric server: the backend-service side of a persistent connection.
//!
//! Accepts gateway connections, reads envelope frames, and hands each one
//! to a [`FabricDispatch`] together with a sink for the response. The
//! reader task never runs handler bodies; dispatch implementations must
//! move real work onto worker tasks (the task pipeline does exactly that),
//! so a slow handler never stalls a connection's inbound stream.
//!
//! # Thread safety
//!
//! Each connection gets one reader task and one writer task. The writer
//! drains an mpsc queue, so responses and pushes from many worker tasks
//! interleave safely on the one stream.

use super::protocol::{read_envelope, write_envelope};
use crate::config::FabricConfig;
use crate::envelope::Envelope;
use crate::{CourierError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Outbound envelope queue for one connection. Cheap to clone; worker
/// tasks hold clones to answer or push on the connection they came from.
#[derive(Clone)]
pub struct EnvelopeSink {
    tx: mpsc::Sender<Envelope>,
}

impl EnvelopeSink {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Queue an envelope for writing. Fails only when the connection has
    /// gone away.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| CourierError::ConnectionClosed {
                service: "peer".to_string(),
            })
    }
}

/// Dispatch seam for inbound envelopes.
///
/// Implementations must return promptly; anything slow belongs on a
/// spawned worker task holding the `responder`.
#[async_trait::async_trait]
pub trait FabricDispatch: Send + Sync + 'static {
    async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope);
}

/// Handle to a running fabric server. Dropping shuts down the server.
pub struct FabricServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    connections: Arc<Mutex<HashMap<u64, EnvelopeSink>>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl FabricServerHandle {
    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Push an unsolicited envelope to every live connection.
    ///
    /// Best-effort: a connection that disappeared mid-push is skipped.
    pub async fn push(&self, envelope: &Envelope) {
        let sinks: Vec<EnvelopeSink> = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.values().cloned().collect()
        };
        for sink in sinks {
            if sink.send(envelope.clone()).await.is_err() {
                debug!("push skipped a closed connection");
            }
        }
    }

    /// Shut down the server gracefully: stop accepting, then signal all
    /// connection tasks to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for FabricServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Fabric server that listens for gateway connections.
pub struct FabricServer;

impl FabricServer {
    /// Start the server on `addr` (port 0 picks a free port).
    pub async fn start<D: FabricDispatch>(
        addr: &str,
        dispatch: Arc<D>,
    ) -> Result<FabricServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("fabric server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let connections: Arc<Mutex<HashMap<u64, EnvelopeSink>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            connections.clone(),
        ));

        Ok(FabricServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: FabricDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        connections: Arc<Mutex<HashMap<u64, EnvelopeSink>>>,
    ) {
        let next_conn_id = AtomicU64::new(1);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("fabric server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let connections = connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("fabric connection {} from {}", conn_id, peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    conn_id,
                                    &*dispatch,
                                    &connections,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("fabric connection {} ended: {}", conn_id, e);
                                }
                                let mut map =
                                    connections.lock().unwrap_or_else(|e| e.into_inner());
                                map.remove(&conn_id);
                            });
                        }
                        Err(e) => {
                            error!("fabric accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: FabricDispatch>(
        stream: TcpStream,
        conn_id: u64,
        dispatch: &D,
        connections: &Mutex<HashMap<u64, EnvelopeSink>>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let (write_tx, mut write_rx) = mpsc::channel::<Envelope>(FabricConfig::WRITE_QUEUE_DEPTH);
        let sink = EnvelopeSink::new(write_tx);
        {
            let mut map = connections.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(conn_id, sink.clone());
        }

        // Writer task: sole owner of the write half.
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = write_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!("fabric write failed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            let envelope = tokio::select! {
                result = read_envelope(&mut reader) => {
                    match result {
                        Ok(Some(envelope)) => envelope,
                        Ok(None) => break Ok(()), // clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(());
                }
            };

            dispatch.dispatch(sink.clone(), envelope).await;
        };

        // Dropping the sink map entry and our clone ends the writer task.
        {
            let mut map = connections.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&conn_id);
        }
        drop(sink);
        writer_task.abort();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConnection;
    use crate::StateCode;
    use serde_json::json;

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for EchoDispatch {
        async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope) {
            let response = Envelope::respond(&envelope, StateCode::Ok, envelope.data.clone());
            let _ = responder.send(response).await;
        }
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let mut handle = FabricServer::start("127.0.0.1:0", Arc::new(EchoDispatch))
            .await
            .unwrap();
        assert!(handle.addr().port() > 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn echo_roundtrip_over_tcp() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(EchoDispatch))
            .await
            .unwrap();

        let conn = FabricConnection::connect("echo", handle.addr()).await.unwrap();
        let request = Envelope::request("Echo", json!({"v": 5}));
        let response = conn
            .call(request, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.data["v"], 5);
        assert_eq!(response.state_code(), Some(StateCode::Ok));
    }
}
