//! Fabric connection: the gateway side of a persistent channel to one
//! named backend service.
//!
//! A connection owns a reader task and a writer task. The reader routes
//! each inbound envelope by correlation id to the matching pending call;
//! envelopes with no pending waiter and no correlation are unsolicited
//! pushes; a non-zero correlation with no waiter is a stale response from
//! an abandoned (timed-out) call and is dropped, never misdelivered.
//!
//! # Thread safety
//!
//! `call` and `send` take `&self` and are safe from any number of
//! concurrent worker tasks; the writer task serializes frames.

use super::protocol::{read_envelope, write_envelope};
use crate::config::FabricConfig;
use crate::envelope::Envelope;
use crate::{CourierError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

/// A live connection to one named backend service.
#[derive(Debug)]
pub struct FabricConnection {
    service: String,
    addr: SocketAddr,
    write_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
    next_correlation: AtomicU64,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl FabricConnection {
    /// Connect to a backend service's fabric server.
    pub async fn connect(service: impl Into<String>, addr: SocketAddr) -> Result<Self> {
        let service = service.into();
        let stream = tokio::time::timeout(FabricConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CourierError::ServiceUnreachable {
                service: service.clone(),
            })?
            .map_err(|_| CourierError::ServiceUnreachable {
                service: service.clone(),
            })?;

        debug!("fabric connected to service '{}' at {}", service, addr);

        let (mut reader, mut writer) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (write_tx, mut write_rx) = mpsc::channel::<Envelope>(FabricConfig::WRITE_QUEUE_DEPTH);
        let (push_tx, push_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = write_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!("fabric write failed: {}", e);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_service = service.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_envelope(&mut reader).await {
                    Ok(Some(envelope)) => {
                        Self::route_inbound(&reader_service, &reader_pending, &push_tx, envelope);
                    }
                    Ok(None) => {
                        debug!("service '{}' closed the connection", reader_service);
                        break;
                    }
                    Err(e) => {
                        warn!("fabric read from '{}' failed: {}", reader_service, e);
                        break;
                    }
                }
            }
            // Wake every pending caller with a closed channel.
            let mut map = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
            map.clear();
        });

        Ok(Self {
            service,
            addr,
            write_tx,
            pending,
            next_correlation: AtomicU64::new(1),
            push_rx: Mutex::new(Some(push_rx)),
            reader_task,
            writer_task,
        })
    }

    fn route_inbound(
        service: &str,
        pending: &PendingMap,
        push_tx: &mpsc::UnboundedSender<Envelope>,
        envelope: Envelope,
    ) {
        if envelope.correlation != 0 {
            let waiter = {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&envelope.correlation)
            };
            match waiter {
                Some(tx) => {
                    // Waiter may have timed out between removal and send;
                    // a failed send is the same stale case.
                    let _ = tx.send(envelope);
                }
                None => {
                    warn!(
                        "stale response from '{}' (action '{}', correlation {}) dropped",
                        service, envelope.action, envelope.correlation
                    );
                }
            }
            return;
        }

        if push_tx.send(envelope).is_err() {
            debug!("push from '{}' dropped: no push consumer", service);
        }
    }

    /// The service this connection is bound to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Take the unsolicited-push receiver. Yields `Some` exactly once.
    pub fn take_pushes(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        let mut slot = self.push_rx.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    /// Issue a bounded-wait call: send `envelope` and await the response
    /// bearing the assigned correlation id.
    ///
    /// The pending entry is removed on every exit path, so a late response
    /// after timeout is recognized as stale by the reader and dropped.
    pub async fn call(&self, mut envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        envelope.correlation = correlation;

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(correlation, tx);
        }

        if self.write_tx.send(envelope).await.is_err() {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&correlation);
            return Err(CourierError::ConnectionClosed {
                service: self.service.clone(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Reader task ended; connection is gone.
                Err(CourierError::ConnectionClosed {
                    service: self.service.clone(),
                })
            }
            Err(_) => {
                let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&correlation);
                Err(CourierError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget send. No delivery guarantee is reported back.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.write_tx
            .send(envelope)
            .await
            .map_err(|_| CourierError::ConnectionClosed {
                service: self.service.clone(),
            })
    }
}

impl Drop for FabricConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{EnvelopeSink, FabricDispatch, FabricServer};
    use crate::StateCode;
    use serde_json::json;
    use std::time::Instant;

    /// Never answers; the mute-service case.
    struct MuteDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for MuteDispatch {
        async fn dispatch(&self, _responder: EnvelopeSink, _envelope: Envelope) {}
    }

    /// Answers after a delay longer than the caller's patience.
    struct SlowDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for SlowDispatch {
        async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let response = Envelope::respond(&envelope, StateCode::Ok, json!({}));
                let _ = responder.send(response).await;
            });
        }
    }

    #[tokio::test]
    async fn call_times_out_against_mute_service() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(MuteDispatch))
            .await
            .unwrap();
        let conn = FabricConnection::connect("mute", handle.addr()).await.unwrap();

        let started = Instant::now();
        let err = conn
            .call(Envelope::request("Ping", json!({})), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout(_)));
        // 200ms plus scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn late_response_is_dropped_as_stale() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(SlowDispatch))
            .await
            .unwrap();
        let conn = FabricConnection::connect("slow", handle.addr()).await.unwrap();

        let err = conn
            .call(Envelope::request("Ping", json!({})), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout(_)));

        // The late response arrives while a fresh call is pending with a
        // different correlation id; it must not be misdelivered.
        let response = conn
            .call(Envelope::request("Ping", json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.state_code(), Some(StateCode::Ok));
    }

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for EchoDispatch {
        async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope) {
            let response = Envelope::respond(&envelope, StateCode::Ok, envelope.data.clone());
            let _ = responder.send(response).await;
        }
    }

    #[tokio::test]
    async fn server_push_reaches_the_push_receiver() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(MuteDispatch))
            .await
            .unwrap();
        let conn = FabricConnection::connect("events", handle.addr()).await.unwrap();
        let mut pushes = conn.take_pushes().unwrap();
        // The receiver is yielded exactly once.
        assert!(conn.take_pushes().is_none());

        // The server registers the connection on its own task; repeat the
        // push until the first copy lands.
        let event = Envelope::event("MessagePushed", json!({"id": 7}));
        let mut received = None;
        for _ in 0..50 {
            handle.push(&event).await;
            if let Ok(Some(envelope)) =
                tokio::time::timeout(Duration::from_millis(100), pushes.recv()).await
            {
                received = Some(envelope);
                break;
            }
        }
        let received = received.expect("push never arrived");
        assert_eq!(received.action, "MessagePushed");
        assert_eq!(received.correlation, 0);
        assert_eq!(received.data["id"], 7);
    }

    #[tokio::test]
    async fn push_with_no_consumer_does_not_disturb_calls() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(EchoDispatch))
            .await
            .unwrap();
        let conn = FabricConnection::connect("events", handle.addr()).await.unwrap();
        drop(conn.take_pushes().unwrap());

        // A call first, so the connection is registered server-side.
        let response = conn
            .call(Envelope::request("Ping", json!({"seq": 1})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.data["seq"], 1);

        // With the receiver gone, the push is dropped at the reader.
        handle.push(&Envelope::event("MessagePushed", json!({}))).await;

        // Correlated traffic is unaffected.
        let response = conn
            .call(Envelope::request("Ping", json!({"seq": 2})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.state_code(), Some(StateCode::Ok));
        assert_eq!(response.data["seq"], 2);
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_unreachable() {
        // Bind-then-drop to find a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = FabricConnection::connect("ghost", addr).await.unwrap_err();
        assert!(matches!(err, CourierError::ServiceUnreachable { .. }));
    }
}
