use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::avatar::AvatarCache;
use crate::ledger::Ledger;
use crate::relay::CommandRelay;

/// Failed or successful, every login attempt counts against the window.
pub const LOGIN_ATTEMPTS: u32 = 10;
pub const LOGIN_WINDOW: Duration = Duration::from_secs(60);
/// How often windows that have run out are dropped.
pub const THROTTLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Window {
    attempts: u32,
    started: Instant,
}

/// Fixed-window login throttle keyed by case-folded username.
pub struct LoginThrottle {
    windows: DashMap<String, Window>,
    max_attempts: u32,
    window: Duration,
}

impl LoginThrottle {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Records an attempt for `username`; false once the window is used up.
    pub fn allow(&self, username: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(username.trim().to_lowercase())
            .or_insert(Window {
                attempts: 0,
                started: now,
            });
        if now.duration_since(entry.started) >= self.window {
            entry.attempts = 0;
            entry.started = now;
        }
        if entry.attempts >= self.max_attempts {
            return false;
        }
        entry.attempts += 1;
        true
    }

    /// Drop windows that have run out; they would reset on next use anyway.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.windows.retain(|_, w| now.duration_since(w.started) < self.window);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let throttle = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(THROTTLE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                throttle.sweep();
            }
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub ledger: Ledger,
    /// Commands to the game server; a test double in tests
    pub relay: Arc<dyn CommandRelay>,
    pub avatars: AvatarCache,
    /// JWT signing secret
    pub jwt_secret: String,
    pub login_throttle: Arc<LoginThrottle>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        jwt_secret: String,
        relay: Arc<dyn CommandRelay>,
        avatars: AvatarCache,
    ) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            db,
            relay,
            avatars,
            jwt_secret,
            login_throttle: Arc::new(LoginThrottle::new(LOGIN_ATTEMPTS, LOGIN_WINDOW)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_blocks_after_limit_per_username() {
        let throttle = LoginThrottle::new(2, LOGIN_WINDOW);
        assert!(throttle.allow("alice"));
        assert!(throttle.allow(" Alice "));
        assert!(!throttle.allow("ALICE"));
        assert!(throttle.allow("bob"));
    }

    #[test]
    fn throttle_window_resets_and_sweeps() {
        let throttle = LoginThrottle::new(1, Duration::from_millis(30));
        assert!(throttle.allow("alice"));
        assert!(!throttle.allow("alice"));

        // A sweep inside the window keeps the count
        throttle.sweep();
        assert!(!throttle.allow("alice"));

        std::thread::sleep(Duration::from_millis(40));
        throttle.sweep();
        assert!(throttle.windows.is_empty());
        assert!(throttle.allow("alice"));
    }
}
