//! Courier core - cross-node coordination and relay for the Courier
//! messaging backend.
//!
//! Gateway nodes wrap client requests in a protocol [`Envelope`] and drive
//! them through the [`RpcRelay`] to named backend services over the
//! connection fabric; a backend's [`TaskPipeline`] runs the registered
//! handler off the I/O tasks, optionally mutating shared state through the
//! [`CoordinationCache`] and pushing events to connected devices through
//! the [`PresenceFabric`]. The [`CooldownController`] gates request
//! admission before relay dispatch.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{Envelope, RpcRelay};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run(relay: RpcRelay) {
//! let request = Envelope::request("GetContact", json!({"contactId": 42}));
//! match relay.transmit_sync("contacts", request, Duration::from_secs(5)).await {
//!     Some(response) => println!("state: {:?}", response.state_code()),
//!     None => println!("timeout or unreachable; see logs"),
//! }
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod cooldown;
pub mod envelope;
pub mod error;
pub mod fabric;
pub mod pipeline;
pub mod presence;
pub mod relay;

// Re-export commonly used types
pub use cache::{CacheEntry, CoordinationCache, KeyTransaction};
pub use cooldown::CooldownController;
pub use envelope::{Envelope, StateCode, PARAM_DESTINATION, PARAM_TOKEN};
pub use error::{CourierError, Result};
pub use fabric::{
    EnvelopeSink, FabricConnection, FabricDispatch, FabricServer, FabricServerHandle,
};
pub use pipeline::{ActionHandler, ActionTiming, TaskPipeline, TaskSlot};
pub use presence::{DeviceSink, PresenceFabric};
pub use relay::RpcRelay;
