//! Backend service unit: pipeline, cache, presence fabric, and the
//! built-in action handlers.
//!
//! Business services register their own handlers on top of these; the
//! built-ins cover liveness (`Ping`), plain cache access (`GetValue`,
//! `PutValue`), transactional read-modify-write (`Increment`), and event
//! fan-out (`Broadcast`).

use courier_core::{
    ActionHandler, CoordinationCache, CourierError, Envelope, PresenceFabric, Result, StateCode,
    TaskPipeline,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// One backend service unit's shared moving parts.
pub struct BackendService {
    pub name: String,
    pub pipeline: TaskPipeline,
    pub cache: CoordinationCache,
    pub presence: PresenceFabric,
}

impl BackendService {
    /// Build a service unit with the built-in handlers registered.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let pipeline = TaskPipeline::new();
        let cache = CoordinationCache::new(name.clone());
        let presence = PresenceFabric::new();

        pipeline.register("Ping", Arc::new(PingHandler));
        pipeline.register(
            "GetValue",
            Arc::new(GetValueHandler {
                cache: cache.clone(),
            }),
        );
        pipeline.register(
            "PutValue",
            Arc::new(PutValueHandler {
                cache: cache.clone(),
            }),
        );
        pipeline.register(
            "Increment",
            Arc::new(IncrementHandler {
                cache: cache.clone(),
            }),
        );
        pipeline.register(
            "Broadcast",
            Arc::new(BroadcastHandler {
                presence: presence.clone(),
            }),
        );
        pipeline.register(
            "StreamChunk",
            Arc::new(StreamChunkHandler {
                cache: cache.clone(),
            }),
        );

        Self {
            name,
            pipeline,
            cache,
            presence,
        }
    }
}

fn require_str<'a>(data: &'a Value, field: &str) -> Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CourierError::Validation {
            field: field.to_string(),
            message: "missing or not a string".to_string(),
        })
}

/// Liveness check; echoes the payload back.
struct PingHandler;

#[async_trait::async_trait]
impl ActionHandler for PingHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let response = Envelope::respond(&envelope, StateCode::Ok, envelope.data.clone());
        Ok(Some(response))
    }
}

/// Plain cache read. A miss answers `Ok` with a null value; a miss is
/// not a fault.
struct GetValueHandler {
    cache: CoordinationCache,
}

#[async_trait::async_trait]
impl ActionHandler for GetValueHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let key = match require_str(&envelope.data, "key") {
            Ok(key) => key,
            Err(_) => {
                return Ok(Some(Envelope::respond(
                    &envelope,
                    StateCode::InvalidParameter,
                    json!({}),
                )))
            }
        };
        let value = self.cache.get(key).unwrap_or(Value::Null);
        let response = Envelope::respond(&envelope, StateCode::Ok, json!({"value": value}));
        Ok(Some(response))
    }
}

/// Plain last-writer-wins cache write.
struct PutValueHandler {
    cache: CoordinationCache,
}

#[async_trait::async_trait]
impl ActionHandler for PutValueHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let key = match require_str(&envelope.data, "key") {
            Ok(key) => key.to_string(),
            Err(_) => {
                return Ok(Some(Envelope::respond(
                    &envelope,
                    StateCode::InvalidParameter,
                    json!({}),
                )))
            }
        };
        let value = envelope.data.get("value").cloned().unwrap_or(Value::Null);
        self.cache.put(key, value);
        Ok(Some(Envelope::respond(&envelope, StateCode::Ok, json!({}))))
    }
}

/// Transactional read-modify-write through the per-key critical section.
struct IncrementHandler {
    cache: CoordinationCache,
}

#[async_trait::async_trait]
impl ActionHandler for IncrementHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let key = match require_str(&envelope.data, "key") {
            Ok(key) => key.to_string(),
            Err(_) => {
                return Ok(Some(Envelope::respond(
                    &envelope,
                    StateCode::InvalidParameter,
                    json!({}),
                )))
            }
        };
        let delta = envelope.data.get("delta").and_then(Value::as_i64).unwrap_or(1);

        let updated = self
            .cache
            .execute(&key, |txn| async move {
                let current = txn.get().and_then(|v| v.as_i64()).unwrap_or(0);
                let updated = current + delta;
                txn.put(json!(updated));
                updated
            })
            .await?;

        let response = Envelope::respond(&envelope, StateCode::Ok, json!({"value": updated}));
        Ok(Some(response))
    }
}

/// Fan one event out to a list of recipient identities.
struct BroadcastHandler {
    presence: PresenceFabric,
}

#[async_trait::async_trait]
impl ActionHandler for BroadcastHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let identities: Vec<String> = envelope
            .data
            .get("identities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if identities.is_empty() {
            return Ok(Some(Envelope::respond(
                &envelope,
                StateCode::InvalidParameter,
                json!({}),
            )));
        }

        let action = require_str(&envelope.data, "event").unwrap_or("Event").to_string();
        let payload = envelope.data.get("payload").cloned().unwrap_or(Value::Null);

        let event = Envelope::event(action, payload);
        self.presence.publish_broadcast(event, &identities).await;

        let response = Envelope::respond(
            &envelope,
            StateCode::Ok,
            json!({"recipients": identities.len()}),
        );
        Ok(Some(response))
    }
}

/// Tracks per-stream chunk progress pushed up from the gateway's stream
/// boundary. Fire-and-forget: no response expected.
struct StreamChunkHandler {
    cache: CoordinationCache,
}

#[async_trait::async_trait]
impl ActionHandler for StreamChunkHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let name = require_str(&envelope.data, "name")?;
        self.cache
            .put(format!("stream:{}", name), envelope.data.clone());
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{DeviceSink, FabricServer, RpcRelay};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn started(service: BackendService) -> (RpcRelay, courier_core::FabricServerHandle) {
        let handle = FabricServer::start("127.0.0.1:0", Arc::new(service.pipeline.clone()))
            .await
            .unwrap();
        let relay = RpcRelay::new();
        relay.connect("unit", handle.addr()).await.unwrap();
        (relay, handle)
    }

    async fn call(relay: &RpcRelay, action: &str, data: Value) -> Envelope {
        relay
            .transmit_sync("unit", Envelope::request(action, data), Duration::from_secs(2))
            .await
            .expect("backend answered")
    }

    #[tokio::test]
    async fn ping_answers_ok() {
        let (relay, _handle) = started(BackendService::new("test")).await;
        let response = call(&relay, "Ping", json!({"seq": 1})).await;
        assert_eq!(response.state_code(), Some(StateCode::Ok));
        assert_eq!(response.data["seq"], 1);
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (relay, _handle) = started(BackendService::new("test")).await;

        let put = call(
            &relay,
            "PutValue",
            json!({"key": "c-1", "value": {"name": "alice"}}),
        )
        .await;
        assert_eq!(put.state_code(), Some(StateCode::Ok));

        let get = call(&relay, "GetValue", json!({"key": "c-1"})).await;
        assert_eq!(get.state_code(), Some(StateCode::Ok));
        assert_eq!(get.data["value"]["name"], "alice");

        // A miss is Ok with null, not a fault.
        let miss = call(&relay, "GetValue", json!({"key": "nope"})).await;
        assert_eq!(miss.state_code(), Some(StateCode::Ok));
        assert!(miss.data["value"].is_null());
    }

    #[tokio::test]
    async fn missing_key_is_invalid_parameter() {
        let (relay, _handle) = started(BackendService::new("test")).await;
        let response = call(&relay, "GetValue", json!({})).await;
        assert_eq!(response.state_code(), Some(StateCode::InvalidParameter));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_increments_through_the_full_stack() {
        let service = BackendService::new("test");
        let cache = service.cache.clone();
        let (relay, _handle) = started(service).await;
        let relay = Arc::new(relay);

        let mut joins = Vec::new();
        for _ in 0..50 {
            let relay = relay.clone();
            joins.push(tokio::spawn(async move {
                let response = call(&relay, "Increment", json!({"key": "counter1"})).await;
                assert_eq!(response.state_code(), Some(StateCode::Ok));
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(cache.get("counter1").unwrap(), json!(50));
    }

    #[tokio::test]
    async fn stream_chunk_notices_update_progress() {
        let service = BackendService::new("test");
        let cache = service.cache.clone();
        let (relay, _handle) = started(service).await;

        relay
            .transmit_async(
                "unit",
                Envelope::event(
                    "StreamChunk",
                    json!({"kind": "audio", "name": "call-3", "index": 8, "size": 512}),
                ),
            )
            .await;

        // Fire-and-forget, so poll until the write lands.
        let mut progress = None;
        for _ in 0..50 {
            if let Some(value) = cache.get("stream:call-3") {
                progress = Some(value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let progress = progress.expect("chunk notice never arrived");
        assert_eq!(progress["index"], 8);
        assert_eq!(progress["kind"], "audio");
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Envelope>>,
    }

    #[async_trait::async_trait]
    impl DeviceSink for RecordingSink {
        async fn deliver(&self, envelope: Envelope) -> Result<()> {
            self.received.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_subscribed_devices() {
        let service = BackendService::new("test");
        let sink = Arc::new(RecordingSink::default());
        service.presence.subscribe("user-1", "phone", sink.clone());
        let (relay, _handle) = started(service).await;

        let response = call(
            &relay,
            "Broadcast",
            json!({
                "event": "NoticeUpdated",
                "identities": ["user-1", "user-2"],
                "payload": {"noticeId": 4}
            }),
        )
        .await;
        assert_eq!(response.state_code(), Some(StateCode::Ok));
        assert_eq!(response.data["recipients"], 2);

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].action, "NoticeUpdated");
        assert_eq!(received[0].destination(), Some("user-1"));
    }
}
