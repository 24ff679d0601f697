//! The protocol envelope: the unit of request/response and fire-and-forget
//! traffic between gateway nodes and backend services.
//!
//! An envelope is a named action, a correlation id, a structured JSON
//! payload, and a small string map of side-channel parameters (caller
//! token, broadcast destination). Envelopes are immutable once sent: the
//! fabric serializes a snapshot, so later mutation of a local value never
//! affects a frame already on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Side-channel parameter key for the caller's opaque auth token.
pub const PARAM_TOKEN: &str = "token";

/// Side-channel parameter key for the broadcast destination identity.
pub const PARAM_DESTINATION: &str = "destination";

/// Response state codes carried in `data["code"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    Ok = 0,
    InvalidParameter = 5,
    Failure = 9,
    NoToken = 12,
    Unauthorized = 13,
    NotFound = 14,
}

impl StateCode {
    /// Parse a numeric code; unknown values map to `Failure`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => StateCode::Ok,
            5 => StateCode::InvalidParameter,
            12 => StateCode::NoToken,
            13 => StateCode::Unauthorized,
            14 => StateCode::NotFound,
            _ => StateCode::Failure,
        }
    }
}

/// A named-action message with payload and correlation identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Action name, e.g. `"GetContact"`.
    pub action: String,
    /// Correlation id tying a response to its pending call. Zero for
    /// unsolicited pushes.
    pub correlation: u64,
    /// Business payload.
    #[serde(default)]
    pub data: Value,
    /// Side-channel parameters (auth token, destination, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl Envelope {
    /// Create a request envelope. The correlation id is assigned by the
    /// connection at send time; callers leave it zero.
    pub fn request(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            correlation: 0,
            data,
            params: HashMap::new(),
        }
    }

    /// Create a response to `request`, copying its correlation id and
    /// stamping the state code into the payload.
    pub fn respond(request: &Envelope, state: StateCode, data: Value) -> Self {
        let mut envelope = Self {
            action: request.action.clone(),
            correlation: request.correlation,
            data,
            params: HashMap::new(),
        };
        envelope.set_state(state);
        envelope
    }

    /// Create an unsolicited push event (no pending waiter).
    pub fn event(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            correlation: 0,
            data,
            params: HashMap::new(),
        }
    }

    /// Stamp a state code into `data["code"]`.
    pub fn set_state(&mut self, state: StateCode) {
        if !self.data.is_object() {
            self.data = json!({});
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert("code".to_string(), json!(state as i64));
        }
    }

    /// Read the state code from `data["code"]`, if present.
    pub fn state_code(&self) -> Option<StateCode> {
        self.data
            .get("code")
            .and_then(Value::as_i64)
            .map(StateCode::from_code)
    }

    /// The caller token from the side-channel parameters.
    pub fn token(&self) -> Option<&str> {
        self.params.get(PARAM_TOKEN).map(String::as_str)
    }

    /// Attach the caller token.
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.params.insert(PARAM_TOKEN.to_string(), token.into());
    }

    /// The broadcast destination identity, if set.
    pub fn destination(&self) -> Option<&str> {
        self.params.get(PARAM_DESTINATION).map(String::as_str)
    }

    /// Set the broadcast destination identity (overwritten per iteration
    /// by `publish_broadcast`).
    pub fn set_destination(&mut self, identity: impl Into<String>) {
        self.params
            .insert(PARAM_DESTINATION.to_string(), identity.into());
    }
}
