//! Presence/pubsub fabric: maps logical recipient identities to live
//! device connections and fans events out to them.
//!
//! This is presence metadata, not a broker: no persistence, no
//! acknowledgements, no replay, no cross-identity ordering. A device sink
//! is registered when the device connects and removed when it disconnects
//! or times out; publishing to an identity with no devices is a silent
//! no-op.

use crate::envelope::Envelope;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One live device connection able to receive pushed envelopes.
///
/// The gateway implements this over client connections; tests implement
/// recording sinks.
#[async_trait::async_trait]
pub trait DeviceSink: Send + Sync + 'static {
    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

type SinkMap = HashMap<String, HashMap<String, Arc<dyn DeviceSink>>>;

/// Identity → connected devices registry with best-effort fan-out.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct PresenceFabric {
    sinks: Arc<Mutex<SinkMap>>,
}

impl PresenceFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `identity` (device connect).
    pub fn subscribe(
        &self,
        identity: impl Into<String>,
        device: impl Into<String>,
        sink: Arc<dyn DeviceSink>,
    ) {
        let identity = identity.into();
        let device = device.into();
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.entry(identity).or_default().insert(device, sink);
    }

    /// Remove a device (disconnect or timeout). Removing an unknown
    /// device is a no-op.
    pub fn unsubscribe(&self, identity: &str, device: &str) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(devices) = sinks.get_mut(identity) {
            devices.remove(device);
            if devices.is_empty() {
                sinks.remove(identity);
            }
        }
    }

    /// Number of devices currently connected under `identity`.
    pub fn device_count(&self, identity: &str) -> usize {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.get(identity).map_or(0, HashMap::len)
    }

    /// Deliver `envelope` to every device connected under `identity`:
    /// unspecified order, at-most-once per device, best-effort. A failed
    /// delivery is logged and dropped, never surfaced to the publisher.
    /// Zero connected devices is a silent no-op.
    pub async fn publish(&self, identity: &str, envelope: &Envelope) {
        let targets: Vec<(String, Arc<dyn DeviceSink>)> = {
            let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            match sinks.get(identity) {
                Some(devices) => devices
                    .iter()
                    .map(|(device, sink)| (device.clone(), sink.clone()))
                    .collect(),
                None => return,
            }
        };

        if targets.is_empty() {
            return;
        }
        debug!(
            "publishing '{}' to {} device(s) of '{}'",
            envelope.action,
            targets.len(),
            identity
        );

        for (device, sink) in targets {
            if let Err(e) = sink.deliver(envelope.clone()).await {
                warn!(
                    "delivery of '{}' to device '{}' of '{}' dropped: {}",
                    envelope.action, device, identity, e
                );
            }
        }
    }

    /// Republish one envelope to each identity in turn, setting the
    /// per-iteration destination on the envelope first.
    ///
    /// Delivery is awaited per iteration and sinks receive their own
    /// clone, so reusing the one envelope value across iterations is safe.
    pub async fn publish_broadcast<I, S>(&self, mut envelope: Envelope, identities: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for identity in identities {
            let identity = identity.as_ref();
            envelope.set_destination(identity);
            self.publish(identity, &envelope).await;
        }
    }
}
