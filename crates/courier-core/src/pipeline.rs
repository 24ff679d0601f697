//! Task execution pipeline: recyclable execution contexts and the action
//! handler registry.
//!
//! The fabric reader hands every inbound envelope to the pipeline, which
//! binds it to a pooled [`TaskSlot`] and runs the registered handler on a
//! spawned worker task. Handler work, including a handler blocked inside
//! `transmit_sync`, therefore never stalls inbound I/O.
//!
//! Handler failures are contained per task: an error (or a panic) is
//! logged, a `Failure` response is written when one is expected, and the
//! slot is released either way. The pipeline never crashes over a bad
//! handler.

use crate::config::PipelineConfig;
use crate::envelope::{Envelope, StateCode};
use crate::fabric::{EnvelopeSink, FabricDispatch};
use crate::Result;
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Handler for one named action.
///
/// Returning `Ok(Some(envelope))` answers the caller; `Ok(None)` is valid
/// for fire-and-forget events. Errors are contained by the pipeline.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>>;
}

/// A pooled execution context bound to at most one in-flight event.
///
/// A slot is either Free (sitting in the pool, no bound event) or Bound
/// (owned by exactly one dispatch task). Rebinding clears every trace of
/// the previous event before the new one is attached.
#[derive(Debug)]
pub struct TaskSlot {
    action: String,
    event: Option<Envelope>,
    sync: bool,
    bound_at: Instant,
}

impl TaskSlot {
    fn free() -> Self {
        Self {
            action: String::new(),
            event: None,
            sync: false,
            bound_at: Instant::now(),
        }
    }

    fn bind(&mut self, envelope: Envelope) {
        self.action = envelope.action.clone();
        self.sync = envelope.correlation != 0;
        self.bound_at = Instant::now();
        self.event = Some(envelope);
    }

    fn clear(&mut self) {
        self.action.clear();
        self.event = None;
        self.sync = false;
    }

    /// The bound action name.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Whether the bound event expects a correlated response.
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Take the bound event for handling. The slot stays Bound (owned by
    /// the dispatch task) until released.
    pub fn take_event(&mut self) -> Option<Envelope> {
        self.event.take()
    }

    /// Time since the event was bound.
    pub fn elapsed(&self) -> Duration {
        self.bound_at.elapsed()
    }
}

/// Free-slot pool. Bounded: beyond the cap, released slots are dropped.
struct SlotPool {
    free: Mutex<Vec<TaskSlot>>,
}

impl SlotPool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    fn borrow(&self, envelope: Envelope) -> TaskSlot {
        let mut slot = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop().unwrap_or_else(TaskSlot::free)
        };
        slot.bind(envelope);
        slot
    }

    fn release(&self, mut slot: TaskSlot) {
        slot.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < PipelineConfig::MAX_POOLED_SLOTS {
            free.push(slot);
        }
    }
}

/// Per-action handling time statistics.
#[derive(Debug, Clone, Default)]
pub struct ActionTiming {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl ActionTiming {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        if elapsed > self.max {
            self.max = elapsed;
        }
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

struct PipelineInner {
    pool: SlotPool,
    registry: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    timings: Mutex<HashMap<String, ActionTiming>>,
}

/// The pipeline: slot pool + startup-populated handler registry.
///
/// Cheap to clone; clones share the pool, registry, and timing stats.
#[derive(Clone)]
pub struct TaskPipeline {
    inner: Arc<PipelineInner>,
}

impl TaskPipeline {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                pool: SlotPool::new(),
                registry: RwLock::new(HashMap::new()),
                timings: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a handler for `action`. Called once per action at startup;
    /// dispatch looks handlers up in O(1).
    pub fn register(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action = action.into();
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if registry.insert(action.clone(), handler).is_some() {
            warn!("handler for action '{}' replaced", action);
        }
    }

    fn handler(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.get(action).cloned()
    }

    /// Snapshot of per-action handling times.
    pub fn timings(&self) -> HashMap<String, ActionTiming> {
        let timings = self.inner.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings.clone()
    }

    /// Bind `envelope` to a slot and run its handler on a worker task.
    pub fn spawn_task(&self, responder: EnvelopeSink, envelope: Envelope) {
        let request = envelope.clone();
        let mut slot = self.inner.pool.borrow(envelope);

        let handler = match self.handler(&request.action) {
            Some(h) => h,
            None => {
                warn!("no handler registered for action '{}'", request.action);
                self.inner.pool.release(slot);
                if request.correlation != 0 {
                    let response = Envelope::respond(&request, StateCode::NotFound, json!({}));
                    tokio::spawn(async move {
                        let _ = responder.send(response).await;
                    });
                }
                return;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let event = slot.take_event().unwrap_or_else(|| request.clone());

            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;

            match outcome {
                Ok(Ok(Some(response))) => {
                    if responder.send(response).await.is_err() {
                        debug!("response for '{}' dropped: connection gone", request.action);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!("handler for '{}' failed: {}", request.action, e);
                    if slot.is_sync() {
                        let response = Envelope::respond(&request, StateCode::Failure, json!({}));
                        let _ = responder.send(response).await;
                    }
                }
                Err(_) => {
                    error!("handler for '{}' panicked", request.action);
                    if slot.is_sync() {
                        let response = Envelope::respond(&request, StateCode::Failure, json!({}));
                        let _ = responder.send(response).await;
                    }
                }
            }

            let mut timings = inner.timings.lock().unwrap_or_else(|e| e.into_inner());
            timings
                .entry(request.action.clone())
                .or_default()
                .record(slot.elapsed());
            drop(timings);
            inner.pool.release(slot);
        });
    }
}

impl Default for TaskPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FabricDispatch for TaskPipeline {
    async fn dispatch(&self, responder: EnvelopeSink, envelope: Envelope) {
        self.spawn_task(responder, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CourierError;
    use tokio::sync::mpsc;

    fn sink() -> (EnvelopeSink, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        (EnvelopeSink::new(tx), rx)
    }

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ActionHandler for EchoHandler {
        async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
            let response = Envelope::respond(&envelope, StateCode::Ok, envelope.data.clone());
            Ok(Some(response))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl ActionHandler for FailingHandler {
        async fn handle(&self, _envelope: Envelope) -> Result<Option<Envelope>> {
            Err(CourierError::Other("boom".to_string()))
        }
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl ActionHandler for PanickingHandler {
        async fn handle(&self, _envelope: Envelope) -> Result<Option<Envelope>> {
            panic!("handler bug");
        }
    }

    fn request(action: &str, correlation: u64) -> Envelope {
        let mut envelope = Envelope::request(action, json!({"x": 1}));
        envelope.correlation = correlation;
        envelope
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        let pipeline = Arc::new(TaskPipeline::new());
        pipeline.register("Echo", Arc::new(EchoHandler));

        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder, request("Echo", 3));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.correlation, 3);
        assert_eq!(response.state_code(), Some(StateCode::Ok));
    }

    #[tokio::test]
    async fn unknown_action_answers_not_found() {
        let pipeline = Arc::new(TaskPipeline::new());
        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder, request("Nope", 4));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.state_code(), Some(StateCode::NotFound));
    }

    #[tokio::test]
    async fn handler_error_is_contained_and_answered() {
        let pipeline = Arc::new(TaskPipeline::new());
        pipeline.register("Bad", Arc::new(FailingHandler));

        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder, request("Bad", 5));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.state_code(), Some(StateCode::Failure));

        // The pipeline keeps working after a failure.
        pipeline.register("Echo", Arc::new(EchoHandler));
        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder, request("Echo", 6));
        assert_eq!(rx.recv().await.unwrap().state_code(), Some(StateCode::Ok));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let pipeline = Arc::new(TaskPipeline::new());
        pipeline.register("Crash", Arc::new(PanickingHandler));

        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder, request("Crash", 7));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.state_code(), Some(StateCode::Failure));
    }

    #[tokio::test]
    async fn slot_reuse_never_leaks_prior_event() {
        let pool = SlotPool::new();

        let mut first = pool.borrow(request("First", 1));
        assert_eq!(first.action(), "First");
        assert!(first.is_sync());
        let _ = first.take_event();
        pool.release(first);

        // Same underlying slot, fresh binding: nothing of "First" remains.
        let slot = pool.borrow(request("Second", 0));
        assert_eq!(slot.action(), "Second");
        assert!(!slot.is_sync());
        let event = slot.event.as_ref().unwrap();
        assert_eq!(event.action, "Second");
    }

    #[tokio::test]
    async fn timings_are_recorded_per_action() {
        let pipeline = Arc::new(TaskPipeline::new());
        pipeline.register("Echo", Arc::new(EchoHandler));

        let (responder, mut rx) = sink();
        pipeline.spawn_task(responder.clone(), request("Echo", 8));
        let _ = rx.recv().await.unwrap();
        pipeline.spawn_task(responder, request("Echo", 9));
        let _ = rx.recv().await.unwrap();

        let timings = pipeline.timings();
        let echo = timings.get("Echo").unwrap();
        assert_eq!(echo.count, 2);
        assert!(echo.max >= echo.average());
    }
}
