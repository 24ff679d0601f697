//! RPC relay: bounded-wait and fire-and-forget sends to named backend
//! services over the connection fabric.
//!
//! `transmit_sync` is the workhorse of every gateway request handler. Its
//! contract is deliberately blunt: the caller gets `Some(response)` or
//! `None`, and timeout, unreachable service, and malformed response all
//! collapse into `None`. The causes are distinguishable only in the logs.
//! Retry is the caller's business; the relay never retries.
//!
//! `transmit_sync` suspends only the calling worker task. The fabric's
//! reader and writer tasks are never blocked by a pending call.

use crate::envelope::Envelope;
use crate::fabric::FabricConnection;
use crate::{CourierError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Relay over named fabric connections.
///
/// Connections are attached at startup; the relay itself holds no retry
/// or reconnect policy.
#[derive(Default)]
pub struct RpcRelay {
    connections: RwLock<HashMap<String, Arc<FabricConnection>>>,
}

impl RpcRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an established connection under its service name.
    pub fn attach(&self, connection: FabricConnection) {
        let mut map = self.connections.write().unwrap_or_else(|e| e.into_inner());
        map.insert(connection.service().to_string(), Arc::new(connection));
    }

    /// Connect to `addr` and attach under `service`.
    pub async fn connect(&self, service: &str, addr: SocketAddr) -> Result<()> {
        let connection = FabricConnection::connect(service, addr).await?;
        self.attach(connection);
        Ok(())
    }

    /// Detach a service connection (shutdown path).
    pub fn detach(&self, service: &str) {
        let mut map = self.connections.write().unwrap_or_else(|e| e.into_inner());
        map.remove(service);
    }

    fn connection(&self, service: &str) -> Option<Arc<FabricConnection>> {
        let map = self.connections.read().unwrap_or_else(|e| e.into_inner());
        map.get(service).cloned()
    }

    /// Send `request` to `service` and wait up to `timeout` for the
    /// correlated response.
    ///
    /// Returns `None` uniformly for timeout, unknown/unreachable service,
    /// and malformed or lost responses. Callers must not try to tell these
    /// apart without the logs.
    pub async fn transmit_sync(
        &self,
        service: &str,
        request: Envelope,
        timeout: Duration,
    ) -> Option<Envelope> {
        let connection = match self.connection(service) {
            Some(c) => c,
            None => {
                error!("transmit_sync: no connection for service '{}'", service);
                return None;
            }
        };

        let action = request.action.clone();
        match connection.call(request, timeout).await {
            Ok(response) => Some(response),
            Err(CourierError::Timeout(_)) => {
                error!(
                    "transmit_sync: service '{}' timed out after {:?} (action '{}')",
                    service, timeout, action
                );
                None
            }
            Err(e) => {
                error!(
                    "transmit_sync: service '{}' failed (action '{}'): {}",
                    service, action, e
                );
                None
            }
        }
    }

    /// Fire-and-forget send. No delivery guarantee; a send onto a dead
    /// connection is logged and swallowed.
    pub async fn transmit_async(&self, service: &str, request: Envelope) {
        let connection = match self.connection(service) {
            Some(c) => c,
            None => {
                warn!("transmit_async: no connection for service '{}'", service);
                return;
            }
        };
        if let Err(e) = connection.send(request).await {
            warn!("transmit_async to '{}' failed: {}", service, e);
        } else {
            debug!("transmit_async queued for '{}'", service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{EnvelopeSink, FabricDispatch, FabricServer};
    use crate::StateCode;
    use serde_json::json;
    use std::time::Instant;

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for EchoDispatch {
        async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope) {
            let response = Envelope::respond(&envelope, StateCode::Ok, envelope.data.clone());
            let _ = responder.send(response).await;
        }
    }

    struct MuteDispatch;

    #[async_trait::async_trait]
    impl FabricDispatch for MuteDispatch {
        async fn dispatch(&self, _responder: EnvelopeSink, _envelope: Envelope) {}
    }

    #[tokio::test]
    async fn sync_roundtrip() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(EchoDispatch))
            .await
            .unwrap();
        let relay = RpcRelay::new();
        relay.connect("contacts", handle.addr()).await.unwrap();

        let response = relay
            .transmit_sync(
                "contacts",
                Envelope::request("GetContact", json!({"contactId": 42})),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(response.data["contactId"], 42);
    }

    #[tokio::test]
    async fn timeout_returns_none_within_bound() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(MuteDispatch))
            .await
            .unwrap();
        let relay = RpcRelay::new();
        relay.connect("risk", handle.addr()).await.unwrap();

        for _ in 0..3 {
            let started = Instant::now();
            let response = relay
                .transmit_sync(
                    "risk",
                    Envelope::request("GetContactRisk", json!({"contactId": 42})),
                    Duration::from_millis(200),
                )
                .await;
            assert!(response.is_none());
            assert!(started.elapsed() < Duration::from_millis(800));
        }
    }

    #[tokio::test]
    async fn unknown_service_returns_none() {
        let relay = RpcRelay::new();
        let response = relay
            .transmit_sync(
                "nowhere",
                Envelope::request("Ping", json!({})),
                Duration::from_millis(100),
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_responses() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(EchoDispatch))
            .await
            .unwrap();
        let relay = Arc::new(RpcRelay::new());
        relay.connect("echo", handle.addr()).await.unwrap();

        let mut joins = Vec::new();
        for i in 0..32u64 {
            let relay = relay.clone();
            joins.push(tokio::spawn(async move {
                let response = relay
                    .transmit_sync(
                        "echo",
                        Envelope::request("Echo", json!({"i": i})),
                        Duration::from_secs(2),
                    )
                    .await
                    .unwrap();
                assert_eq!(response.data["i"], i);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn transmit_async_does_not_error() {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(MuteDispatch))
            .await
            .unwrap();
        let relay = RpcRelay::new();
        relay.connect("mute", handle.addr()).await.unwrap();

        relay
            .transmit_async("mute", Envelope::request("Notify", json!({})))
            .await;
        // Unknown service is also a silent no-op.
        relay
            .transmit_async("nowhere", Envelope::request("Notify", json!({})))
            .await;
    }
}
