//! Per-action route configuration.
//!
//! Looked up once per request: relay timeout, admission cooling window,
//! and whether the action requires a caller token. Populated at startup;
//! unknown actions fall back to the defaults.

use courier_core::config::{CooldownConfig, RelayConfig};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for one action route.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Bounded-wait timeout handed to `transmit_sync`.
    pub timeout: Duration,
    /// Cooling window for the admission gate; `None` disables the gate.
    pub cooling: Option<Duration>,
    /// Whether a missing token is rejected before relay dispatch.
    pub require_token: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            timeout: RelayConfig::DEFAULT_TIMEOUT,
            cooling: None,
            require_token: true,
        }
    }
}

/// Action name → route configuration, populated once at startup.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteConfig>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Later registrations win.
    pub fn register(&mut self, action: impl Into<String>, config: RouteConfig) {
        let action = action.into();
        let timeout = config
            .timeout
            .clamp(RelayConfig::MIN_TIMEOUT, RelayConfig::MAX_TIMEOUT);
        self.routes.insert(action, RouteConfig { timeout, ..config });
    }

    /// Look up the route for `action`, falling back to defaults.
    pub fn route(&self, action: &str) -> RouteConfig {
        self.routes.get(action).cloned().unwrap_or_default()
    }

    /// The standard gateway table: quick lookups are tight, long-running
    /// report/AIGC style operations get generous bounds, and bursty
    /// endpoints carry a cooling window.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(
            "Ping",
            RouteConfig {
                timeout: Duration::from_secs(3),
                cooling: None,
                require_token: false,
            },
        );
        table.register(
            "SignIn",
            RouteConfig {
                timeout: Duration::from_secs(5),
                cooling: Some(Duration::from_millis(500)),
                require_token: false,
            },
        );
        table.register(
            "SendMessage",
            RouteConfig {
                timeout: Duration::from_secs(10),
                cooling: Some(CooldownConfig::DEFAULT_COOLING),
                require_token: true,
            },
        );
        table.register(
            "PullMessages",
            RouteConfig {
                timeout: Duration::from_secs(10),
                cooling: Some(Duration::from_millis(200)),
                require_token: true,
            },
        );
        table.register(
            "GetContactRisk",
            RouteConfig {
                timeout: Duration::from_secs(5),
                cooling: None,
                require_token: true,
            },
        );
        table.register(
            "GenerateReport",
            RouteConfig {
                timeout: Duration::from_secs(120),
                cooling: Some(Duration::from_secs(2)),
                require_token: true,
            },
        );
        table
    }
}
