//! Activity and runtime tracking store.
//!
//! Two SQLite tables: `instance_activity` holds the last-interacted timestamp
//! per native id (upserted on every observed interaction), `instance_runtime`
//! holds start/stop session intervals for cost reporting. The connection runs
//! in autocommit mode — every statement is a single atomic upsert/insert/
//! update, so concurrent writers (orchestrator, probe tasks, reaper) need no
//! cross-statement coordination. Timestamps always come from SQLite's own
//! clock, never from callers, so `last_interacted` is monotonic per id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instance_runtime (
    native_id TEXT,
    start DATETIME,
    stop DATETIME
);
CREATE INDEX IF NOT EXISTS idx_runtime_native_id ON instance_runtime(native_id);
CREATE TABLE IF NOT EXISTS instance_activity (
    native_id TEXT PRIMARY KEY,
    last_interacted DATETIME
);";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle transition kinds recorded against the runtime table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
}

/// Handle on the activity/runtime database. Cheap to open; background
/// probe tasks open their own handle on the same path.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening store {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT).context("setting busy timeout")?;
        conn.execute_batch(SCHEMA).context("applying store schema")?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert the last-interacted timestamp for `native_id` to now.
    ///
    /// Idempotent and safe under concurrent callers; lost or duplicate calls
    /// are harmless.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure (fatal to the invoking command).
    pub fn record_activity(&self, native_id: &str) -> Result<()> {
        tracing::debug!(native_id, "activity");
        self.conn
            .execute(
                "INSERT INTO instance_activity (native_id, last_interacted)
                 VALUES (?1, datetime('now'))
                 ON CONFLICT (native_id) DO UPDATE SET last_interacted = datetime('now')",
                params![native_id],
            )
            .context("recording activity")?;
        Ok(())
    }

    /// Record a lifecycle transition. `Start` opens a new runtime interval;
    /// `Stop` closes the most recent open one (no-op if none is open).
    /// Both also count as activity.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn record_transition(&self, native_id: &str, transition: Transition) -> Result<()> {
        self.record_activity(native_id)?;
        match transition {
            Transition::Start => {
                // A crash between a start and its stop can leave an interval
                // open; close any such stragglers first so at most one
                // interval per id is ever open.
                self.close_open_intervals(native_id, false)?;
                self.conn
                    .execute(
                        "INSERT INTO instance_runtime (native_id, start)
                         VALUES (?1, datetime('now'))",
                        params![native_id],
                    )
                    .context("opening runtime interval")?;
            }
            Transition::Stop => {
                self.close_open_intervals(native_id, true)?;
            }
        }
        Ok(())
    }

    fn close_open_intervals(&self, native_id: &str, latest_only: bool) -> Result<()> {
        let sql = if latest_only {
            "UPDATE instance_runtime SET stop = datetime('now')
             WHERE rowid = (SELECT rowid FROM instance_runtime
                            WHERE native_id = ?1 AND stop IS NULL
                            ORDER BY start DESC, rowid DESC LIMIT 1)"
        } else {
            "UPDATE instance_runtime SET stop = datetime('now')
             WHERE native_id = ?1 AND stop IS NULL"
        };
        self.conn
            .execute(sql, params![native_id])
            .context("closing runtime interval")?;
        Ok(())
    }

    /// Ids whose last activity is older than `threshold` (strictly: an id is
    /// idle iff `now - last_interacted > threshold`; the boundary case is
    /// excluded).
    ///
    /// State-blind by design — an id returned here may already be stopped.
    /// Callers must re-check provider state before acting (the reaper
    /// re-resolves each id filtered to running instances).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn idle_ids(&self, threshold: Duration) -> Result<Vec<String>> {
        let modifier = format!("-{} seconds", threshold.as_secs());
        let mut stmt = self
            .conn
            .prepare(
                "SELECT native_id FROM instance_activity
                 WHERE last_interacted < datetime('now', ?1)",
            )
            .context("preparing idle query")?;
        let rows = stmt
            .query_map(params![modifier], |row| row.get(0))
            .context("querying idle ids")?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("reading idle ids")
    }

    /// Cumulative runtime per id in seconds, open intervals counted up to
    /// now. Non-decreasing in wall-clock time while an interval is open.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn runtime_by_id(&self) -> Result<Vec<(String, f64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT native_id,
                        sum((julianday(coalesce(stop, datetime('now')))
                             - julianday(start)) * 86400.0)
                 FROM instance_runtime
                 GROUP BY native_id",
            )
            .context("preparing runtime query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("querying runtime")?;
        rows.collect::<rusqlite::Result<Vec<(String, f64)>>>()
            .context("reading runtime")
    }

    #[cfg(test)]
    pub(crate) fn open_interval_count(&self, native_id: &str) -> i64 {
        self.conn
            .query_row(
                "SELECT count(*) FROM instance_runtime WHERE native_id = ?1 AND stop IS NULL",
                params![native_id],
                |row| row.get(0),
            )
            .expect("count open intervals")
    }

    #[cfg(test)]
    pub(crate) fn activity_row_count(&self, native_id: &str) -> i64 {
        self.conn
            .query_row(
                "SELECT count(*) FROM instance_activity WHERE native_id = ?1",
                params![native_id],
                |row| row.get(0),
            )
            .expect("count activity rows")
    }

    /// Shift an activity timestamp into the past (test clock control).
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, native_id: &str, seconds: u64) {
        self.conn
            .execute(
                "UPDATE instance_activity
                 SET last_interacted = datetime('now', ?2)
                 WHERE native_id = ?1",
                params![native_id, format!("-{seconds} seconds")],
            )
            .expect("backdate activity");
    }

    #[cfg(test)]
    pub(crate) fn insert_interval(
        &self,
        native_id: &str,
        start_seconds_ago: u64,
        stop_seconds_ago: Option<u64>,
    ) {
        let start = format!("-{start_seconds_ago} seconds");
        match stop_seconds_ago {
            Some(stop) => self.conn.execute(
                "INSERT INTO instance_runtime (native_id, start, stop)
                 VALUES (?1, datetime('now', ?2), datetime('now', ?3))",
                params![native_id, start, format!("-{stop} seconds")],
            ),
            None => self.conn.execute(
                "INSERT INTO instance_runtime (native_id, start)
                 VALUES (?1, datetime('now', ?2))",
                params![native_id, start],
            ),
        }
        .expect("insert interval");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("state.db")).expect("open store")
    }

    #[test]
    fn record_activity_is_an_upsert() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        for _ in 0..5 {
            store.record_activity("i-1").expect("activity");
        }
        assert_eq!(store.activity_row_count("i-1"), 1);
    }

    #[test]
    fn start_opens_exactly_one_interval() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Start).expect("start");
        assert_eq!(store.open_interval_count("i-1"), 1);
    }

    #[test]
    fn stop_closes_the_open_interval() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Start).expect("start");
        store.record_transition("i-1", Transition::Stop).expect("stop");
        assert_eq!(store.open_interval_count("i-1"), 0);
    }

    #[test]
    fn stop_without_open_interval_is_a_noop() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Stop).expect("stop");
        assert_eq!(store.open_interval_count("i-1"), 0);
    }

    #[test]
    fn double_start_never_leaves_two_open_intervals() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Start).expect("start");
        store.record_transition("i-1", Transition::Start).expect("start");
        assert_eq!(store.open_interval_count("i-1"), 1);
    }

    #[test]
    fn transitions_count_as_activity() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Start).expect("start");
        assert_eq!(store.activity_row_count("i-1"), 1);
    }

    #[test]
    fn intervals_are_tracked_per_id() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_transition("i-1", Transition::Start).expect("start");
        store.record_transition("i-2", Transition::Start).expect("start");
        store.record_transition("i-1", Transition::Stop).expect("stop");
        assert_eq!(store.open_interval_count("i-1"), 0);
        assert_eq!(store.open_interval_count("i-2"), 1);
    }

    #[test]
    fn idle_ids_returns_stale_entries_only() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.record_activity("stale").expect("activity");
        store.backdate_activity("stale", 200);
        store.record_activity("fresh").expect("activity");

        let idle = store.idle_ids(Duration::from_secs(100)).expect("idle");
        assert_eq!(idle, vec!["stale".to_string()]);
    }

    #[test]
    fn idle_ids_excludes_entries_inside_the_threshold() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        // 90s old against a 100s threshold: inside the window even after
        // generous test scheduling slack.
        store.record_activity("recent").expect("activity");
        store.backdate_activity("recent", 90);
        let idle = store.idle_ids(Duration::from_secs(100)).expect("idle");
        assert!(idle.is_empty());
    }

    #[test]
    fn runtime_sums_closed_intervals() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.insert_interval("i-1", 3600, Some(1800));
        store.insert_interval("i-1", 1000, Some(400));
        let runtime = store.runtime_by_id().expect("runtime");
        assert_eq!(runtime.len(), 1);
        let (id, secs) = &runtime[0];
        assert_eq!(id, "i-1");
        // 1800 + 600 seconds, with slack for julianday rounding.
        assert!((secs - 2400.0).abs() < 5.0, "got {secs}");
    }

    #[test]
    fn runtime_counts_open_intervals_up_to_now() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.insert_interval("i-1", 600, None);
        let runtime = store.runtime_by_id().expect("runtime");
        let (_, secs) = &runtime[0];
        assert!(*secs >= 595.0 && *secs < 700.0, "got {secs}");
    }

    #[test]
    fn runtime_is_constant_once_closed() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store.insert_interval("i-1", 3600, Some(600));
        let first = store.runtime_by_id().expect("runtime")[0].1;
        let second = store.runtime_by_id().expect("runtime")[0].1;
        assert!((first - second).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_activity_writers_share_one_row() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.db");
        // Open once up front so the schema exists before the writers race.
        let store = Store::open(&path).expect("open store");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = Store::open(&path).expect("open store");
                    for _ in 0..10 {
                        store.record_activity("i-x").expect("activity");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        assert_eq!(store.activity_row_count("i-x"), 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        /// Any interleaving of start/stop transitions leaves at most one
        /// open interval per id.
        #[test]
        fn prop_at_most_one_open_interval(ops in proptest::collection::vec(any::<bool>(), 0..20)) {
            let dir = TempDir::new().expect("tempdir");
            let store = Store::open(&dir.path().join("state.db")).expect("open store");
            for is_start in ops {
                let transition = if is_start { Transition::Start } else { Transition::Stop };
                store.record_transition("i-1", transition).expect("transition");
                prop_assert!(store.open_interval_count("i-1") <= 1);
            }
        }

        /// Repeated activity recording always leaves exactly one row.
        #[test]
        fn prop_activity_upsert_single_row(n in 1usize..15) {
            let dir = TempDir::new().expect("tempdir");
            let store = Store::open(&dir.path().join("state.db")).expect("open store");
            for _ in 0..n {
                store.record_activity("i-1").expect("activity");
            }
            prop_assert_eq!(store.activity_row_count("i-1"), 1);
        }
    }
}
