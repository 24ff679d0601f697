//! Cooldown controller: per-key sliding-debounce admission guard.
//!
//! Every `admit` call, admitted or not, shifts the key's last-call
//! timestamp into the previous slot and stamps the current time; admission
//! is granted iff the gap between the two most recent timestamps reaches
//! the cooling duration. Because rejected calls also renew the window,
//! sustained rapid-fire callers stay rejected indefinitely: this is a
//! sliding debounce, not a token bucket, and the behavior is load-bearing
//! for existing callers. Do not "fix" it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Timestamp window for one key. Updated on every admission check
/// regardless of outcome.
#[derive(Debug, Clone, Copy)]
struct CooldownWindow {
    previous: Option<Instant>,
    latest: Instant,
}

/// Per-key sliding-debounce guard shared by request handlers.
#[derive(Default)]
pub struct CooldownController {
    windows: Mutex<HashMap<String, CooldownWindow>>,
}

impl CooldownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check admission for `key`. The first sighting of a key is always
    /// admitted; afterwards a call is admitted iff at least `cooling` has
    /// passed since the previous call — including previous rejected ones.
    pub fn admit(&self, key: &str, cooling: Duration) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let admitted = match windows.get_mut(key) {
            Some(window) => {
                // Shift before comparing, on every path.
                let previous = std::mem::replace(&mut window.latest, now);
                window.previous = Some(previous);
                now.duration_since(previous) >= cooling
            }
            None => {
                windows.insert(
                    key.to_string(),
                    CooldownWindow {
                        previous: None,
                        latest: now,
                    },
                );
                true
            }
        };

        if !admitted {
            debug!("cooldown rejected '{}' (window {:?})", key, cooling);
        }
        admitted
    }

    /// The two most recent recorded call times for `key`, oldest first.
    /// Observability helper; both slots update on every `admit`.
    pub fn window(&self, key: &str) -> Option<(Option<Instant>, Instant)> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.get(key).map(|w| (w.previous, w.latest))
    }

    /// Drop the window for `key` (e.g. on sign-out), so the next call is
    /// treated as a first sighting.
    pub fn reset(&self, key: &str) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLING: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn second_call_inside_window_is_rejected() {
        let controller = CooldownController::new();
        assert!(controller.admit("k", COOLING));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!controller.admit("k", COOLING));
    }

    #[tokio::test(start_paused = true)]
    async fn call_after_full_window_is_admitted() {
        let controller = CooldownController::new();
        assert!(controller.admit("k", COOLING));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!controller.admit("k", COOLING));
        // A full window after the *second* call (which renewed it).
        tokio::time::advance(COOLING).await;
        assert!(controller.admit("k", COOLING));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_renew_the_window() {
        let controller = CooldownController::new();
        assert!(controller.admit("k", COOLING));

        // Keep hammering every 600ms: each rejected call resets the
        // window, so admission never comes despite >1000ms since the
        // last *admitted* call.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(600)).await;
            assert!(!controller.admit("k", COOLING));
        }

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(controller.admit("k", COOLING));
    }

    #[tokio::test(start_paused = true)]
    async fn window_shifts_on_rejected_calls_too() {
        let controller = CooldownController::new();
        assert!(controller.admit("k", COOLING));
        let (_, first) = controller.window("k").unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!controller.admit("k", COOLING));
        let (previous, latest) = controller.window("k").unwrap();
        assert_eq!(previous, Some(first));
        assert_eq!(latest - first, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let controller = CooldownController::new();
        assert!(controller.admit("a", COOLING));
        assert!(controller.admit("b", COOLING));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!controller.admit("a", COOLING));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_the_window() {
        let controller = CooldownController::new();
        assert!(controller.admit("k", COOLING));
        tokio::time::advance(Duration::from_millis(10)).await;
        controller.reset("k");
        assert!(controller.admit("k", COOLING));
    }
}
