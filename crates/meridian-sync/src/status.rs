//! Status and table-event reporting shared by both backends.
//!
//! Table events are throttled per table (leading and trailing edge, at most
//! one per throttle interval). Every change moves a connected session to
//! `Syncing`; after a quiet period with no further change it settles on
//! `Synced`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meridian_shared::{SyncStatus, TableName};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SyncConfig;

#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Inner>,
}

struct Inner {
    status: watch::Sender<SyncStatus>,
    tables: broadcast::Sender<TableName>,
    throttle: Duration,
    debounce: Duration,
    timers: Mutex<Timers>,
}

#[derive(Default)]
struct Timers {
    last_emit: HashMap<TableName, Instant>,
    trailing: HashMap<TableName, JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
}

impl StatusReporter {
    pub fn new(throttle: Duration, debounce: Duration) -> Self {
        let (status, _) = watch::channel(SyncStatus::Unconnected);
        let (tables, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                status,
                tables,
                throttle,
                debounce,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.throttle, config.debounce)
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_tables(&self) -> broadcast::Receiver<TableName> {
        self.inner.tables.subscribe()
    }

    pub fn set_status(&self, status: SyncStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(status = %status, "sync status changed");
        }
    }

    /// Records of `table` changed, in either direction.
    pub fn table_changed(&self, table: TableName) {
        self.emit_throttled(table);
        self.begin_syncing();
    }

    /// Enter `Syncing` (when connected) and restart the quiet-period timer.
    pub fn begin_syncing(&self) {
        if !self.status().is_connected() {
            return;
        }
        self.set_status(SyncStatus::Syncing);

        let reporter = self.clone();
        let quiet = self.inner.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            reporter.settle();
        });

        if let Some(previous) = self.timers().settle.replace(task) {
            previous.abort();
        }
    }

    /// Cancel pending timers, e.g. on disconnect.
    pub fn reset(&self) {
        let mut timers = self.timers();
        if let Some(task) = timers.settle.take() {
            task.abort();
        }
        for (_, task) in timers.trailing.drain() {
            task.abort();
        }
        timers.last_emit.clear();
    }

    fn settle(&self) {
        self.inner.status.send_if_modified(|current| {
            if *current != SyncStatus::Syncing {
                return false;
            }
            *current = SyncStatus::Synced;
            true
        });
        debug!("sync settled");
    }

    fn emit_throttled(&self, table: TableName) {
        let now = Instant::now();
        let mut timers = self.timers();

        let due = match timers.last_emit.get(&table) {
            Some(last) => *last + self.inner.throttle,
            None => now,
        };
        if due <= now {
            timers.last_emit.insert(table, now);
            let _ = self.inner.tables.send(table);
            return;
        }

        if timers.trailing.get(&table).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let reporter = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            reporter.timers().last_emit.insert(table, Instant::now());
            let _ = reporter.inner.tables.send(table);
        });
        timers.trailing.insert(table, task);
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> StatusReporter {
        StatusReporter::new(Duration::from_secs(1), Duration::from_secs(2))
    }

    async fn drain(rx: &mut broadcast::Receiver<TableName>) -> Vec<TableName> {
        let mut seen = Vec::new();
        while let Ok(table) = rx.try_recv() {
            seen.push(table);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn table_events_are_throttled_with_trailing_edge() {
        let reporter = reporter();
        let mut rx = reporter.subscribe_tables();

        for _ in 0..5 {
            reporter.table_changed(TableName::Messages);
        }
        reporter.table_changed(TableName::Topics);
        assert_eq!(drain(&mut rx).await, vec![TableName::Messages, TableName::Topics]);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(drain(&mut rx).await, vec![TableName::Messages]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn syncing_settles_after_quiet_period() {
        let reporter = reporter();
        reporter.set_status(SyncStatus::Ready);

        reporter.table_changed(TableName::Sessions);
        assert_eq!(reporter.status(), SyncStatus::Syncing);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        reporter.table_changed(TableName::Sessions);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(reporter.status(), SyncStatus::Syncing);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(reporter.status(), SyncStatus::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn changes_while_unconnected_do_not_fake_progress() {
        let reporter = reporter();
        reporter.table_changed(TableName::Topics);
        assert_eq!(reporter.status(), SyncStatus::Unconnected);

        reporter.set_status(SyncStatus::Ready);
        reporter.begin_syncing();
        reporter.set_status(SyncStatus::Unconnected);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reporter.status(), SyncStatus::Unconnected);
    }
}
