//! Drain loop and trigger wiring.
//!
//! The engine is the only component that talks to the remote store. All
//! trigger sources (post-enqueue, connectivity restored, background sync)
//! converge on [`SyncEngine::attempt_drain`]; an atomic in-flight guard makes
//! redundant concurrent firing harmless.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::patch;
use crate::queue::{OpKind, OpLog, PendingOp};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::RecordStore;

/// Tuning knobs for the drain loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retryable attempts allowed per operation before it is dropped.
    pub max_retries: u32,
    /// Rows fetched per `dequeue_batch` call.
    pub batch_size: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            batch_size: 50,
        }
    }
}

/// Why an operation was permanently dropped from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The remote rejected the operation as semantically invalid.
    Terminal(String),
    /// The retry bound was reached after repeated retryable failures.
    RetriesExhausted { attempts: u32 },
}

/// Terminal-failure side channel: invoked for every operation the engine
/// permanently drops, so the UI layer can surface "this change could not be
/// saved". Called while a drain is in flight; a re-entrant
/// [`SyncEngine::attempt_drain`] coalesces, local reads proceed normally.
pub trait FailureListener {
    fn on_dropped(&self, op: &PendingOp, reason: &DropReason);
}

/// Platform background-sync hook, keyed per table name. The host is expected
/// to call [`SyncEngine::attempt_drain`] when a registered wakeup fires.
pub trait BackgroundScheduler {
    fn register(&self, table: &str);
}

/// Scheduler for hosts without a background-sync facility.
pub struct NoScheduler;

impl BackgroundScheduler for NoScheduler {
    fn register(&self, _table: &str) {}
}

/// Per-table outcome counts for one drain invocation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableDrain {
    pub confirmed: u32,
    pub retried: u32,
    pub dropped: u32,
}

/// Summary of one drain invocation, consumed by observability/UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// True when another drain was already in flight and this call coalesced.
    pub skipped: bool,
    pub tables: BTreeMap<String, TableDrain>,
}

impl DrainReport {
    fn coalesced() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.tables
            .values()
            .all(|t| t.confirmed == 0 && t.retried == 0 && t.dropped == 0)
    }

    pub fn total_confirmed(&self) -> u32 {
        self.tables.values().map(|t| t.confirmed).sum()
    }

    pub fn total_retried(&self) -> u32 {
        self.tables.values().map(|t| t.retried).sum()
    }

    pub fn total_dropped(&self) -> u32 {
        self.tables.values().map(|t| t.dropped).sum()
    }
}

/// Offline-first sync engine: optimistic local writes feed a durable
/// FIFO-per-table operation log that is drained against the remote store
/// whenever a trigger fires.
///
/// The engine starts out believing it is online; hosts with a connectivity
/// observer should feed transitions through
/// [`SyncEngine::notify_connectivity`].
pub struct SyncEngine<R: RemoteStore> {
    conn: Mutex<Connection>,
    remote: R,
    scheduler: Box<dyn BackgroundScheduler + Send + Sync>,
    listener: Option<Box<dyn FailureListener + Send + Sync>>,
    online: AtomicBool,
    draining: AtomicBool,
    config: SyncConfig,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>, remote: R, config: SyncConfig) -> Result<Self, SyncError> {
        Self::from_conn(Connection::open(path)?, remote, config)
    }

    /// In-memory engine; nothing survives drop. Intended for tests.
    pub fn open_in_memory(remote: R, config: SyncConfig) -> Result<Self, SyncError> {
        Self::from_conn(Connection::open_in_memory()?, remote, config)
    }

    fn from_conn(conn: Connection, remote: R, config: SyncConfig) -> Result<Self, SyncError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        RecordStore::init_schema(&conn)?;
        OpLog::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            remote,
            scheduler: Box::new(NoScheduler),
            listener: None,
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            config,
        })
    }

    /// Install a platform background-sync hook.
    pub fn with_scheduler(
        mut self,
        scheduler: impl BackgroundScheduler + Send + Sync + 'static,
    ) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Install the terminal-failure listener.
    pub fn with_failure_listener(
        mut self,
        listener: impl FailureListener + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::State("connection mutex poisoned"))
    }

    /// Run `f` with the connection locked. Drain code goes through this for
    /// each storage step so the lock is never held across a remote call and
    /// local reads and writes stay responsive mid-drain.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, SyncError>) -> Result<T, SyncError> {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Last locally written body for a record. Never blocks on the network.
    pub fn record(&self, table: &str, id: &str) -> Result<Option<serde_json::Value>, SyncError> {
        let conn = self.lock_conn()?;
        RecordStore::new(&conn).get(table, id)
    }

    /// All locally known records of one entity type; used to hydrate UI.
    pub fn records(&self, table: &str) -> Result<Vec<(String, serde_json::Value)>, SyncError> {
        let conn = self.lock_conn()?;
        RecordStore::new(&conn).list(table)
    }

    /// Queued entries for one table.
    pub fn pending_count(&self, table: &str) -> Result<i64, SyncError> {
        let conn = self.lock_conn()?;
        OpLog::new(&conn).pending_count(table)
    }

    /// Optimistically create a record locally and queue the remote insert.
    ///
    /// The local write and the enqueue commit in one transaction, so a reader
    /// observing the enqueue also observes the optimistic value, and a crash
    /// cannot separate the two.
    pub fn stage_create(
        &self,
        table: &str,
        id: &str,
        record: &serde_json::Value,
    ) -> Result<i64, SyncError> {
        let (op_id, queue_was_empty) = {
            let conn = self.lock_conn()?;
            let tx = conn.unchecked_transaction()?;
            RecordStore::new(&tx).put(table, id, record)?;
            let log = OpLog::new(&tx);
            let queue_was_empty = log.pending_count(table)? == 0;
            let op_id = log.enqueue(OpKind::Create, table, id, Some(record))?;
            tx.commit()?;
            (op_id, queue_was_empty)
        };
        self.after_enqueue(table, queue_was_empty);
        Ok(op_id)
    }

    /// Optimistically patch a record locally and queue the remote update.
    /// The patch is shallow-merged into the stored body, if one exists.
    pub fn stage_update(
        &self,
        table: &str,
        id: &str,
        patch_body: &serde_json::Value,
    ) -> Result<i64, SyncError> {
        let (op_id, queue_was_empty) = {
            let conn = self.lock_conn()?;
            let tx = conn.unchecked_transaction()?;
            let store = RecordStore::new(&tx);
            if let Some(current) = store.get(table, id)? {
                store.put(table, id, &patch::apply(&current, patch_body))?;
            }
            let log = OpLog::new(&tx);
            let queue_was_empty = log.pending_count(table)? == 0;
            let op_id = log.enqueue(OpKind::Update, table, id, Some(patch_body))?;
            tx.commit()?;
            (op_id, queue_was_empty)
        };
        self.after_enqueue(table, queue_was_empty);
        Ok(op_id)
    }

    /// Optimistically remove a record locally and queue the remote delete.
    /// Valid even when no local copy exists.
    pub fn stage_delete(&self, table: &str, id: &str) -> Result<i64, SyncError> {
        let (op_id, queue_was_empty) = {
            let conn = self.lock_conn()?;
            let tx = conn.unchecked_transaction()?;
            RecordStore::new(&tx).delete(table, id)?;
            let log = OpLog::new(&tx);
            let queue_was_empty = log.pending_count(table)? == 0;
            let op_id = log.enqueue(OpKind::Delete, table, id, None)?;
            tx.commit()?;
            (op_id, queue_was_empty)
        };
        self.after_enqueue(table, queue_was_empty);
        Ok(op_id)
    }

    /// Post-enqueue trigger: drain right away while online, otherwise ask the
    /// platform to wake us for this table, once per table with pending work.
    ///
    /// By the time this runs the staged operation is already durable, so a
    /// failure of the opportunistic drain is logged rather than returned as
    /// the staging result.
    fn after_enqueue(&self, table: &str, queue_was_empty: bool) {
        if self.is_online() {
            match self.attempt_drain() {
                Ok(report) => debug!(table, skipped = report.skipped, "post-enqueue drain"),
                Err(err) => warn!(table, error = %err, "post-enqueue drain failed"),
            }
        } else if queue_was_empty {
            self.scheduler.register(table);
        }
    }

    /// Connectivity-restored trigger. Only the offline-to-online edge drains;
    /// every call updates the engine's belief about connectivity.
    pub fn notify_connectivity(&self, online: bool) -> Result<Option<DrainReport>, SyncError> {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            info!("connectivity restored, draining");
            return self.attempt_drain().map(Some);
        }
        Ok(None)
    }

    /// Attempt one drain pass. Idempotent and cheap on an empty queue, and
    /// safe to call redundantly from any trigger: if a drain is already in
    /// flight the call returns a `skipped` report without touching the log.
    pub fn attempt_drain(&self) -> Result<DrainReport, SyncError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in flight, coalescing");
            return Ok(DrainReport::coalesced());
        }
        let result = self.drain();
        self.draining.store(false, Ordering::Release);
        result
    }

    fn drain(&self) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();

        let tables = self.with_conn(|c| OpLog::new(c).tables_with_pending())?;
        if tables.is_empty() {
            return Ok(report);
        }

        for table in tables {
            let stats = self.drain_table(&table)?;
            if stats.retried > 0 {
                // Work is left behind; ask the platform for another shot.
                self.scheduler.register(&table);
            }
            report.tables.insert(table, stats);
        }

        info!(
            confirmed = report.total_confirmed(),
            retried = report.total_retried(),
            dropped = report.total_dropped(),
            "drain complete"
        );
        Ok(report)
    }

    fn drain_table(&self, table: &str) -> Result<TableDrain, SyncError> {
        let mut stats = TableDrain::default();
        'table: loop {
            let batch =
                self.with_conn(|c| OpLog::new(c).dequeue_batch(table, self.config.batch_size))?;
            if batch.is_empty() {
                break;
            }
            for op in &batch {
                // An op can come back already sitting at the bound if a
                // previous process died between the counter increment and the
                // removal; it gets no further attempt.
                if op.retry_count >= self.config.max_retries {
                    self.with_conn(|c| OpLog::new(c).ack(op.op_id))?;
                    stats.dropped += 1;
                    warn!(table, op_id = op.op_id, attempts = op.retry_count, "retries exhausted, dropping operation");
                    self.notify_dropped(
                        op,
                        &DropReason::RetriesExhausted {
                            attempts: op.retry_count,
                        },
                    );
                    continue;
                }
                // The in-flight guard keeps this the only drain, so the
                // connection lock is released around the remote call.
                match self.apply_remote(op) {
                    Ok(()) => {
                        self.with_conn(|c| OpLog::new(c).ack(op.op_id))?;
                        stats.confirmed += 1;
                    }
                    Err(RemoteError::Retryable(msg)) => {
                        // The increment and the removal at the bound must land
                        // in one transaction.
                        let attempts = self.with_conn(|c| {
                            let tx = c.unchecked_transaction()?;
                            let log = OpLog::new(&tx);
                            let attempts = log.mark_failed(op.op_id)?;
                            if attempts >= self.config.max_retries {
                                log.ack(op.op_id)?;
                            }
                            tx.commit()?;
                            Ok(attempts)
                        })?;
                        if attempts >= self.config.max_retries {
                            stats.dropped += 1;
                            warn!(table, op_id = op.op_id, attempts, "retries exhausted, dropping operation");
                            self.notify_dropped(op, &DropReason::RetriesExhausted { attempts });
                        } else {
                            stats.retried += 1;
                            warn!(table, op_id = op.op_id, attempts, error = %msg, "retryable failure, stalling table");
                            // A later op must not apply ahead of this one.
                            break 'table;
                        }
                    }
                    Err(RemoteError::Terminal(msg)) => {
                        self.with_conn(|c| OpLog::new(c).ack(op.op_id))?;
                        stats.dropped += 1;
                        warn!(table, op_id = op.op_id, error = %msg, "terminal failure, dropping operation");
                        self.notify_dropped(op, &DropReason::Terminal(msg));
                    }
                }
            }
        }
        Ok(stats)
    }

    fn apply_remote(&self, op: &PendingOp) -> Result<(), RemoteError> {
        match op.kind {
            OpKind::Create => {
                let record = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| RemoteError::terminal("create op without payload"))?;
                let remote_id = self.remote.insert(&op.table, record)?;
                debug!(table = %op.table, record_id = %op.record_id, remote_id = %remote_id, "insert confirmed");
                Ok(())
            }
            OpKind::Update => {
                let patch_body = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| RemoteError::terminal("update op without payload"))?;
                self.remote.update(&op.table, &op.record_id, patch_body)
            }
            OpKind::Delete => self.remote.delete(&op.table, &op.record_id),
        }
    }

    fn notify_dropped(&self, op: &PendingOp, reason: &DropReason) {
        if let Some(listener) = &self.listener {
            listener.on_dropped(op, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteId;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Insert(String, String),
        Update(String, String),
        Delete(String, String),
    }

    /// Remote double that records calls and can be scripted to fail per
    /// record id, one error per attempt.
    #[derive(Default, Clone)]
    struct FakeRemote {
        calls: Arc<StdMutex<Vec<Call>>>,
        failures: Arc<StdMutex<HashMap<String, VecDeque<RemoteError>>>>,
    }

    impl FakeRemote {
        fn script_failures(&self, record_id: &str, errs: Vec<RemoteError>) {
            self.failures
                .lock()
                .unwrap()
                .insert(record_id.to_string(), errs.into());
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome(&self, record_id: &str) -> Result<(), RemoteError> {
            let mut failures = self.failures.lock().unwrap();
            if let Some(q) = failures.get_mut(record_id) {
                if let Some(err) = q.pop_front() {
                    return Err(err);
                }
            }
            Ok(())
        }
    }

    impl RemoteStore for FakeRemote {
        fn insert(&self, table: &str, record: &serde_json::Value) -> Result<RemoteId, RemoteError> {
            let id = record
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.calls
                .lock()
                .unwrap()
                .push(Call::Insert(table.to_string(), id.clone()));
            self.outcome(&id).map(|_| id)
        }

        fn update(&self, table: &str, id: &str, _patch: &serde_json::Value) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Update(table.to_string(), id.to_string()));
            self.outcome(id)
        }

        fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Delete(table.to_string(), id.to_string()));
            self.outcome(id)
        }
    }

    #[derive(Default, Clone)]
    struct DropCollector {
        dropped: Arc<StdMutex<Vec<(i64, DropReason)>>>,
    }

    impl FailureListener for DropCollector {
        fn on_dropped(&self, op: &PendingOp, reason: &DropReason) {
            self.dropped.lock().unwrap().push((op.op_id, reason.clone()));
        }
    }

    #[derive(Default, Clone)]
    struct RecordingScheduler {
        registered: Arc<StdMutex<Vec<String>>>,
    }

    impl BackgroundScheduler for RecordingScheduler {
        fn register(&self, table: &str) {
            self.registered.lock().unwrap().push(table.to_string());
        }
    }

    fn engine(remote: FakeRemote) -> SyncEngine<FakeRemote> {
        SyncEngine::open_in_memory(remote, SyncConfig::default()).unwrap()
    }

    #[test]
    fn empty_drain_is_a_noop() {
        let eng = engine(FakeRemote::default());
        let report = eng.attempt_drain().unwrap();
        assert!(!report.skipped);
        assert!(report.tables.is_empty());
        assert!(report.is_noop());
    }

    #[test]
    fn stage_create_applies_optimistically_and_drains() {
        let remote = FakeRemote::default();
        let eng = engine(remote.clone());

        eng.stage_create("tasks", "t1", &json!({"id": "t1", "title": "X"}))
            .unwrap();

        assert_eq!(
            eng.record("tasks", "t1").unwrap(),
            Some(json!({"id": "t1", "title": "X"}))
        );
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
        assert_eq!(remote.calls(), vec![Call::Insert("tasks".into(), "t1".into())]);
    }

    #[test]
    fn staging_offline_defers_and_registers() {
        let remote = FakeRemote::default();
        let scheduler = RecordingScheduler::default();
        let eng = engine(remote.clone()).with_scheduler(scheduler.clone());

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();
        eng.stage_delete("rules", "r1").unwrap();

        assert!(remote.calls().is_empty());
        assert_eq!(eng.pending_count("tasks").unwrap(), 1);
        assert_eq!(eng.pending_count("rules").unwrap(), 1);
        assert_eq!(
            scheduler.registered.lock().unwrap().clone(),
            vec!["tasks".to_string(), "rules".to_string()]
        );
    }

    #[test]
    fn online_edge_drains_queued_work() {
        let remote = FakeRemote::default();
        let eng = engine(remote.clone());

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();

        // Still offline: no edge.
        assert!(eng.notify_connectivity(false).unwrap().is_none());

        let report = eng.notify_connectivity(true).unwrap().expect("edge drain");
        assert_eq!(report.total_confirmed(), 1);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);

        // Already online: no second drain.
        assert!(eng.notify_connectivity(true).unwrap().is_none());
    }

    #[test]
    fn optimistic_reads_reflect_staged_state_while_offline() {
        let eng = engine(FakeRemote::default());
        eng.notify_connectivity(false).unwrap();

        eng.stage_create("tasks", "t1", &json!({"id": "t1", "title": "X", "done": false}))
            .unwrap();
        eng.stage_update("tasks", "t1", &json!({"title": "Y"})).unwrap();

        assert_eq!(
            eng.record("tasks", "t1").unwrap(),
            Some(json!({"id": "t1", "title": "Y", "done": false}))
        );

        eng.stage_delete("tasks", "t1").unwrap();
        assert_eq!(eng.record("tasks", "t1").unwrap(), None);
        assert_eq!(eng.pending_count("tasks").unwrap(), 3);
    }

    #[test]
    fn retryable_failure_is_dropped_after_exactly_max_retries() {
        let remote = FakeRemote::default();
        remote.script_failures(
            "t1",
            vec![
                RemoteError::retryable("503"),
                RemoteError::retryable("503"),
                RemoteError::retryable("503"),
                RemoteError::retryable("503"),
            ],
        );
        let collector = DropCollector::default();
        let eng = SyncEngine::open_in_memory(
            remote.clone(),
            SyncConfig {
                max_retries: 3,
                ..Default::default()
            },
        )
        .unwrap()
        .with_failure_listener(collector.clone());

        eng.notify_connectivity(false).unwrap();
        let op_id = eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();

        for _ in 0..3 {
            eng.attempt_drain().unwrap();
        }

        // Exactly max_retries attempts, then dropped with a signal.
        assert_eq!(remote.calls().len(), 3);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
        assert_eq!(
            collector.dropped.lock().unwrap().clone(),
            vec![(op_id, DropReason::RetriesExhausted { attempts: 3 })]
        );

        // Never a further attempt.
        eng.attempt_drain().unwrap();
        assert_eq!(remote.calls().len(), 3);
    }

    #[test]
    fn terminal_failure_drops_on_first_attempt() {
        let remote = FakeRemote::default();
        remote.script_failures("t1", vec![RemoteError::terminal("validation rejected")]);
        let collector = DropCollector::default();
        let eng = engine(remote.clone()).with_failure_listener(collector.clone());

        eng.notify_connectivity(false).unwrap();
        let op_id = eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();
        let report = eng.attempt_drain().unwrap();

        assert_eq!(remote.calls().len(), 1);
        assert_eq!(report.tables["tasks"].dropped, 1);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
        assert_eq!(
            collector.dropped.lock().unwrap().clone(),
            vec![(op_id, DropReason::Terminal("validation rejected".into()))]
        );
    }

    #[test]
    fn terminal_drop_does_not_stall_later_ops() {
        let remote = FakeRemote::default();
        remote.script_failures("t1", vec![RemoteError::terminal("rejected")]);
        let eng = engine(remote.clone());

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();
        eng.stage_create("tasks", "t2", &json!({"id": "t2"})).unwrap();

        let report = eng.attempt_drain().unwrap();
        assert_eq!(report.tables["tasks"].dropped, 1);
        assert_eq!(report.tables["tasks"].confirmed, 1);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
    }

    #[test]
    fn stalled_table_does_not_block_other_tables() {
        let remote = FakeRemote::default();
        remote.script_failures("t1", vec![RemoteError::retryable("offline")]);
        let scheduler = RecordingScheduler::default();
        let eng = engine(remote.clone()).with_scheduler(scheduler.clone());

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();
        eng.stage_create("tasks", "t2", &json!({"id": "t2"})).unwrap();
        eng.stage_create("rules", "r1", &json!({"id": "r1"})).unwrap();
        scheduler.registered.lock().unwrap().clear();

        let report = eng.attempt_drain().unwrap();

        // "tasks" stalls on t1; t2 is not attempted out of turn.
        assert_eq!(report.tables["tasks"].retried, 1);
        assert_eq!(report.tables["tasks"].confirmed, 0);
        assert_eq!(report.tables["rules"].confirmed, 1);
        assert!(!remote.calls().contains(&Call::Insert("tasks".into(), "t2".into())));
        assert_eq!(eng.pending_count("tasks").unwrap(), 2);
        assert_eq!(eng.pending_count("rules").unwrap(), 0);

        // The stalled table asked for a background wakeup.
        assert_eq!(scheduler.registered.lock().unwrap().clone(), vec!["tasks".to_string()]);
    }

    /// Remote whose insert parks until released, to hold a drain mid-call.
    struct BlockingRemote {
        entered_tx: StdMutex<mpsc::Sender<()>>,
        release_rx: StdMutex<mpsc::Receiver<()>>,
    }

    impl RemoteStore for BlockingRemote {
        fn insert(&self, _table: &str, record: &serde_json::Value) -> Result<RemoteId, RemoteError> {
            self.entered_tx.lock().unwrap().send(()).unwrap();
            self.release_rx.lock().unwrap().recv().unwrap();
            Ok(record
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        }
        fn update(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<(), RemoteError> {
            Ok(())
        }
        fn delete(&self, _: &str, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn blocking_engine() -> (Arc<SyncEngine<BlockingRemote>>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let eng = Arc::new(
            SyncEngine::open_in_memory(
                BlockingRemote {
                    entered_tx: StdMutex::new(entered_tx),
                    release_rx: StdMutex::new(release_rx),
                },
                SyncConfig::default(),
            )
            .unwrap(),
        );
        (eng, entered_rx, release_tx)
    }

    #[test]
    fn overlapping_drains_coalesce() {
        let (eng, entered_rx, release_tx) = blocking_engine();

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();

        let worker = {
            let eng = Arc::clone(&eng);
            std::thread::spawn(move || eng.attempt_drain().unwrap())
        };

        // Wait until the worker is inside the remote call, then race it.
        entered_rx.recv().unwrap();
        let report = eng.attempt_drain().unwrap();
        assert!(report.skipped);

        release_tx.send(()).unwrap();
        let worker_report = worker.join().unwrap();
        assert_eq!(worker_report.total_confirmed(), 1);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
    }

    #[test]
    fn local_state_stays_accessible_while_drain_is_in_remote_call() {
        let (eng, entered_rx, release_tx) = blocking_engine();

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1", "title": "X"}))
            .unwrap();

        let worker = {
            let eng = Arc::clone(&eng);
            std::thread::spawn(move || eng.attempt_drain().unwrap())
        };
        entered_rx.recv().unwrap();

        // The drain is parked inside the remote call; reads, counts, and
        // further staging must all complete without waiting for it.
        assert_eq!(
            eng.record("tasks", "t1").unwrap(),
            Some(json!({"id": "t1", "title": "X"}))
        );
        assert_eq!(eng.pending_count("tasks").unwrap(), 1);
        eng.stage_create("rules", "r1", &json!({"id": "r1"})).unwrap();

        release_tx.send(()).unwrap();
        let worker_report = worker.join().unwrap();
        assert_eq!(worker_report.total_confirmed(), 1);
        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
        // "rules" was staged after the drain snapshotted its table list.
        assert_eq!(eng.pending_count("rules").unwrap(), 1);
    }

    #[test]
    fn offline_staging_registers_once_per_table() {
        let scheduler = RecordingScheduler::default();
        let eng = engine(FakeRemote::default()).with_scheduler(scheduler.clone());

        eng.notify_connectivity(false).unwrap();
        eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();
        eng.stage_update("tasks", "t1", &json!({"title": "Y"})).unwrap();
        eng.stage_delete("tasks", "t1").unwrap();
        eng.stage_create("rules", "r1", &json!({"id": "r1"})).unwrap();

        // One wakeup request per table with pending work, not per op.
        assert_eq!(
            scheduler.registered.lock().unwrap().clone(),
            vec!["tasks".to_string(), "rules".to_string()]
        );
    }

    #[test]
    fn stage_reports_the_op_id_even_when_the_drain_drops_it() {
        let remote = FakeRemote::default();
        remote.script_failures("t1", vec![RemoteError::terminal("rejected")]);
        let collector = DropCollector::default();
        let eng = engine(remote.clone()).with_failure_listener(collector.clone());

        // Online: the post-enqueue drain runs inline and drops the op, but
        // staging itself committed and its result says so.
        let op_id = eng.stage_create("tasks", "t1", &json!({"id": "t1"})).unwrap();

        assert_eq!(eng.pending_count("tasks").unwrap(), 0);
        assert_eq!(
            collector.dropped.lock().unwrap().clone(),
            vec![(op_id, DropReason::Terminal("rejected".into()))]
        );
    }
}
