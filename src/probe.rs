//! Throttled activity signalling from remote-channel traffic.
//!
//! An interactive shell produces continuous low-level traffic without the
//! orchestration code ever making an explicit "mark activity" call; without
//! this hook a user sitting in a shell would look idle and get stopped out
//! from under them. The channel invokes [`ActivityPinger::ping`] on every
//! delivered chunk; the pinger throttles to one store write per rolling
//! window and dispatches it off the read path, so delivery is never blocked
//! and store contention stays bounded under high-throughput transfers.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::store::Store;

/// Minimum spacing between dispatched activity writes.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

/// Fire-and-forget activity signaller bound to one instance.
pub struct ActivityPinger {
    db_path: PathBuf,
    native_id: String,
    window: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl ActivityPinger {
    #[must_use]
    pub fn new(db_path: &Path, native_id: &str) -> Self {
        Self::with_window(db_path, native_id, THROTTLE_WINDOW)
    }

    #[must_use]
    pub fn with_window(db_path: &Path, native_id: &str, window: Duration) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            native_id: native_id.to_string(),
            window,
            last_fired: Mutex::new(None),
        }
    }

    /// Signal activity. Safe to call arbitrarily often; calls inside the
    /// throttle window are dropped. Returns whether a write was dispatched.
    ///
    /// The write runs on a short-lived background task with its own store
    /// handle. Failures are logged and swallowed — a lost ping is harmless
    /// given the store's upsert semantics.
    pub fn ping(&self) -> bool {
        if !self.should_fire() {
            return false;
        }
        let path = self.db_path.clone();
        let native_id = self.native_id.clone();
        tokio::task::spawn_blocking(move || match Store::open(&path) {
            Ok(store) => {
                if let Err(e) = store.record_activity(&native_id) {
                    tracing::debug!(error = %e, native_id, "activity write failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "activity store unavailable"),
        });
        true
    }

    /// Last-fired timestamp guard. At most one accepted call per window.
    fn should_fire(&self) -> bool {
        let mut last = self
            .last_fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(fired) if fired.elapsed() < self.window => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn throttle_rejects_calls_inside_the_window() {
        let dir = TempDir::new().expect("tempdir");
        let pinger = ActivityPinger::with_window(
            &dir.path().join("state.db"),
            "i-1",
            Duration::from_secs(3600),
        );
        assert!(pinger.should_fire());
        assert!(!pinger.should_fire());
        assert!(!pinger.should_fire());
    }

    #[test]
    fn throttle_reopens_after_the_window() {
        let dir = TempDir::new().expect("tempdir");
        let pinger = ActivityPinger::with_window(
            &dir.path().join("state.db"),
            "i-1",
            Duration::ZERO,
        );
        assert!(pinger.should_fire());
        assert!(pinger.should_fire());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_writes_activity_off_the_calling_path() {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("state.db");
        let pinger = ActivityPinger::new(&db_path, "i-1");
        assert!(pinger.ping());

        // The write is fire-and-forget; poll for it with a bounded wait.
        let store = Store::open(&db_path).expect("open store");
        for _ in 0..100 {
            if store.activity_row_count("i-1") == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("activity write never landed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rapid_pings_collapse_to_one_dispatch() {
        let dir = TempDir::new().expect("tempdir");
        let pinger = ActivityPinger::new(&dir.path().join("state.db"), "i-1");
        let dispatched: usize = (0..50).map(|_| usize::from(pinger.ping())).sum();
        assert_eq!(dispatched, 1);
    }
}
