// ABOUTME: Debounced autosave actor that coalesces state changes into serialized durable writes.
// ABOUTME: Owns an explicit phase, an owned timer deadline, and at most one in-flight write task.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::{CodecError, SaveStatus, encode};
use hearth_store::{DurableStore, StoreError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Errors reported by autosave operations.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("write task failed: {0}")]
    TaskFailed(String),

    #[error("autosave scheduler has shut down")]
    Closed,
}

/// Scheduler phases. `Saving` means one write is in flight;
/// `SavingWithPending` means newer data arrived during that write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Scheduled,
    Saving,
    SavingWithPending,
}

/// Point-in-time view of the scheduler, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    /// Data waiting for the next write (not the data currently in flight).
    pub pending: Option<Value>,
    /// Some submitted data has not been durably written yet.
    pub is_dirty: bool,
    pub is_saving: bool,
    pub timer_armed: bool,
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flushed {
    /// Pending data was written before the call returned.
    Written,
    /// There was nothing to write.
    Clean,
    /// A write was already in flight; any pending data follows it.
    InFlight,
}

/// Encodes a payload as a snapshot and stores it under one key.
pub struct SnapshotWriter {
    store: Arc<dyn DurableStore>,
    key: String,
    version: u32,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn DurableStore>, key: impl Into<String>, version: u32) -> Self {
        Self {
            store,
            key: key.into(),
            version,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub async fn write(&self, payload: &Value) -> Result<(), SaveError> {
        let text = encode(self.version, payload)?;
        self.store.set(&self.key, &text).await?;
        Ok(())
    }
}

type FlushReply = oneshot::Sender<Result<Flushed, SaveError>>;

enum Command {
    MarkDirty(Value),
    Flush(FlushReply),
    Discard(oneshot::Sender<()>),
    Inspect(oneshot::Sender<SchedulerState>),
    Shutdown(FlushReply),
}

/// An in-flight write. The task hands the data back so a failed write can
/// keep it for a retry.
type WriteTask = JoinHandle<(Value, Result<(), SaveError>)>;

/// Handle to a running autosave scheduler. Dropping every handle tears the
/// scheduler down after a final write of any pending data.
#[derive(Clone)]
pub struct AutoSaveHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SaveStatus>,
}

impl AutoSaveHandle {
    /// Report new state. Cheap and non-blocking; bursts are coalesced.
    pub fn mark_dirty(&self, data: Value) -> Result<(), SaveError> {
        self.cmd_tx
            .send(Command::MarkDirty(data))
            .map_err(|_| SaveError::Closed)
    }

    /// Write scheduled data now instead of waiting for the debounce timer.
    /// Returns once the write has completed.
    pub async fn flush(&self) -> Result<Flushed, SaveError> {
        self.request(Command::Flush).await?
    }

    /// Drop pending data and cancel the timer. Waits for an in-flight write
    /// to finish first.
    pub async fn discard(&self) -> Result<(), SaveError> {
        self.request(Command::Discard).await
    }

    pub async fn state(&self) -> Result<SchedulerState, SaveError> {
        self.request(Command::Inspect).await
    }

    /// Finish any in-flight write, write pending data, and stop the
    /// scheduler. Later calls on any handle return `SaveError::Closed`.
    pub async fn shutdown(&self) -> Result<Flushed, SaveError> {
        self.request(Command::Shutdown).await?
    }

    pub fn status(&self) -> SaveStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.status_rx.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SaveError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| SaveError::Closed)?;
        rx.await.map_err(|_| SaveError::Closed)
    }
}

/// Spawn a scheduler writing through `writer` after `debounce` of quiet.
pub fn spawn(writer: SnapshotWriter, debounce: Duration) -> AutoSaveHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SaveStatus::Idle);

    let actor = AutoSaveActor {
        writer: Arc::new(writer),
        debounce,
        phase: SchedulerPhase::Idle,
        pending: None,
        dirty: false,
        deadline: None,
        in_flight: None,
        status_tx,
        cmd_rx,
    };
    tokio::spawn(actor.run());

    AutoSaveHandle { cmd_tx, status_rx }
}

struct AutoSaveActor {
    writer: Arc<SnapshotWriter>,
    debounce: Duration,
    phase: SchedulerPhase,
    pending: Option<Value>,
    dirty: bool,
    deadline: Option<Instant>,
    in_flight: Option<WriteTask>,
    status_tx: watch::Sender<SaveStatus>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl AutoSaveActor {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            // Completion and timer first, so a write never starts late
            // because commands kept arriving.
            tokio::select! {
                biased;
                result = wait_for(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_write_complete(result);
                }
                _ = sleep_until(deadline) => self.on_timer(),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                    None => {
                        let _ = self.teardown().await;
                        break;
                    }
                },
            }
        }
        tracing::debug!("autosave for {} stopped", self.writer.key());
    }

    /// Returns false once the scheduler should stop.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::MarkDirty(data) => self.mark_dirty(data),
            Command::Flush(reply) => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
            Command::Discard(reply) => {
                self.discard().await;
                let _ = reply.send(());
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.inspect());
            }
            Command::Shutdown(reply) => {
                let result = self.teardown().await;
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    fn mark_dirty(&mut self, data: Value) {
        self.pending = Some(data);
        self.dirty = true;
        self.phase = match self.phase {
            SchedulerPhase::Idle | SchedulerPhase::Scheduled => {
                self.arm_timer();
                SchedulerPhase::Scheduled
            }
            SchedulerPhase::Saving | SchedulerPhase::SavingWithPending => {
                SchedulerPhase::SavingWithPending
            }
        };
    }

    fn arm_timer(&mut self) {
        self.deadline = Some(Instant::now() + self.debounce);
    }

    fn on_timer(&mut self) {
        self.deadline = None;
        if self.phase == SchedulerPhase::Scheduled {
            self.start_write();
        }
    }

    fn start_write(&mut self) {
        let Some(data) = self.pending.take() else {
            self.phase = SchedulerPhase::Idle;
            return;
        };
        self.phase = SchedulerPhase::Saving;
        self.status_tx.send_replace(SaveStatus::Saving);

        let writer = Arc::clone(&self.writer);
        self.in_flight = Some(tokio::spawn(async move {
            let result = writer.write(&data).await;
            (data, result)
        }));
    }

    fn on_write_complete(&mut self, result: Result<(Value, Result<(), SaveError>), JoinError>) {
        match result {
            Ok((data, outcome)) => self.finish_write(Some(data), &outcome),
            Err(e) => {
                let outcome = Err(SaveError::TaskFailed(e.to_string()));
                self.finish_write(None, &outcome);
            }
        }
    }

    /// Settle the phase after a write. Data that arrived during the write is
    /// scheduled straight away; a failed write keeps its data unless newer
    /// data superseded it.
    fn finish_write(&mut self, written: Option<Value>, outcome: &Result<(), SaveError>) {
        let has_pending = self.pending.is_some();

        match outcome {
            Ok(()) => {
                tracing::debug!("autosaved {}", self.writer.key());
                self.status_tx.send_replace(SaveStatus::Saved);
            }
            Err(e) => {
                tracing::error!("autosave of {} failed: {}", self.writer.key(), e);
                self.status_tx.send_replace(SaveStatus::Error);
                if !has_pending {
                    self.pending = written;
                }
            }
        }

        if has_pending {
            self.phase = SchedulerPhase::Scheduled;
            self.arm_timer();
        } else {
            self.phase = SchedulerPhase::Idle;
        }
        self.dirty = self.pending.is_some();
    }

    async fn flush(&mut self) -> Result<Flushed, SaveError> {
        match self.phase {
            SchedulerPhase::Saving | SchedulerPhase::SavingWithPending => Ok(Flushed::InFlight),
            SchedulerPhase::Idle if self.pending.is_none() => Ok(Flushed::Clean),
            // Idle with data only happens after a failed write: retry it.
            SchedulerPhase::Idle | SchedulerPhase::Scheduled => {
                self.deadline = None;
                self.write_now().await
            }
        }
    }

    /// Write pending data inline; no command is processed until it is done.
    async fn write_now(&mut self) -> Result<Flushed, SaveError> {
        let Some(data) = self.pending.take() else {
            self.phase = SchedulerPhase::Idle;
            return Ok(Flushed::Clean);
        };
        self.phase = SchedulerPhase::Saving;
        self.status_tx.send_replace(SaveStatus::Saving);

        let outcome = self.writer.write(&data).await;
        self.finish_write(Some(data), &outcome);
        // Nothing new can have arrived, so there is no timer to keep.
        self.deadline = None;
        outcome.map(|()| Flushed::Written)
    }

    async fn discard(&mut self) {
        self.deadline = None;
        self.pending = None;
        if let Some(task) = self.in_flight.take() {
            let result = task.await;
            self.on_write_complete(result);
        }
        self.pending = None;
        self.dirty = false;
        self.deadline = None;
        self.phase = SchedulerPhase::Idle;
        self.status_tx.send_replace(SaveStatus::Idle);
    }

    /// Session teardown: let the in-flight write land, then write whatever
    /// is still pending. Leaves the scheduler `Idle`.
    async fn teardown(&mut self) -> Result<Flushed, SaveError> {
        if let Some(task) = self.in_flight.take() {
            let result = task.await;
            self.on_write_complete(result);
        }
        self.deadline = None;

        let result = if self.pending.is_some() {
            self.write_now().await
        } else {
            Ok(Flushed::Clean)
        };
        if let Err(e) = &result {
            tracing::error!(
                "final autosave of {} failed, unsaved changes are lost: {}",
                self.writer.key(),
                e
            );
        }

        self.phase = SchedulerPhase::Idle;
        self.deadline = None;
        result
    }

    fn inspect(&self) -> SchedulerState {
        SchedulerState {
            phase: self.phase,
            pending: self.pending.clone(),
            is_dirty: self.dirty,
            is_saving: matches!(
                self.phase,
                SchedulerPhase::Saving | SchedulerPhase::SavingWithPending
            ),
            timer_armed: self.deadline.is_some(),
        }
    }
}

async fn wait_for(task: &mut Option<WriteTask>) -> Result<(Value, Result<(), SaveError>), JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_core::decode;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    const DEBOUNCE: Duration = Duration::from_millis(100);

    /// Records successful writes. Can fail every write with a quota error,
    /// and can hold each write until a permit is released.
    #[derive(Default)]
    struct TestStore {
        writes: Mutex<Vec<(String, String)>>,
        full: AtomicBool,
        gate: Option<Arc<Semaphore>>,
    }

    impl TestStore {
        fn gated() -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let store = Self {
                gate: Some(gate.clone()),
                ..Default::default()
            };
            (Arc::new(store), gate)
        }

        fn payloads(&self) -> Vec<Value> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text)| decode(text).unwrap().payload)
                .collect()
        }
    }

    #[async_trait]
    impl DurableStore for TestStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.full.load(Ordering::SeqCst) {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    needed: value.len() as u64,
                    limit: Some(0),
                });
            }
            self.writes
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn start(store: Arc<TestStore>) -> AutoSaveHandle {
        spawn(SnapshotWriter::new(store, "app_state", 3), DEBOUNCE)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_writes_last_value_once() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        for i in 0..5 {
            handle.mark_dirty(json!({"n": i})).unwrap();
            sleep(DEBOUNCE / 4).await;
        }
        assert!(store.payloads().is_empty(), "nothing should be written mid-burst");

        sleep(DEBOUNCE * 2).await;
        assert_eq!(store.payloads(), vec![json!({"n": 4})]);
        assert_eq!(handle.status(), SaveStatus::Saved);

        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(!state.is_dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_write_separately() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        sleep(DEBOUNCE * 2).await;
        handle.mark_dirty(json!({"n": 2})).unwrap();
        sleep(DEBOUNCE * 2).await;

        assert_eq!(store.payloads(), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_use_the_configured_key_and_version() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"a": 1})).unwrap();
        handle.flush().await.unwrap();

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(writes[0].0, "app_state");
        assert_eq!(decode(&writes[0].1).unwrap().version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_scheduled_data_before_returning() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        let scheduled = handle.state().await.unwrap();
        assert_eq!(scheduled.phase, SchedulerPhase::Scheduled);
        assert!(scheduled.timer_armed);

        assert_eq!(handle.flush().await.unwrap(), Flushed::Written);
        assert_eq!(store.payloads(), vec![json!({"n": 1})]);

        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(!state.is_dirty);
        assert!(!state.timer_armed);

        // The cancelled timer must not produce a second write.
        sleep(DEBOUNCE * 3).await;
        assert_eq!(store.payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_when_clean_is_noop() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        assert_eq!(handle.flush().await.unwrap(), Flushed::Clean);
        assert!(store.payloads().is_empty());
        assert_eq!(handle.status(), SaveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn data_arriving_mid_write_is_written_after_it() {
        let (store, gate) = TestStore::gated();
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        sleep(DEBOUNCE + Duration::from_millis(10)).await;

        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Saving);
        assert!(state.is_saving && state.is_dirty);
        assert_eq!(handle.status(), SaveStatus::Saving);

        handle.mark_dirty(json!({"n": 2})).unwrap();
        handle.mark_dirty(json!({"n": 3})).unwrap();
        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::SavingWithPending);
        assert_eq!(state.pending, Some(json!({"n": 3})));

        // Flushing cannot start a second concurrent write.
        assert_eq!(handle.flush().await.unwrap(), Flushed::InFlight);

        gate.add_permits(1);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(store.payloads(), vec![json!({"n": 1})]);
        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Scheduled);
        assert!(state.timer_armed);

        gate.add_permits(1);
        sleep(DEBOUNCE + Duration::from_millis(10)).await;
        assert_eq!(store.payloads(), vec![json!({"n": 1}), json!({"n": 3})]);
        assert_eq!(handle.state().await.unwrap().phase, SchedulerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_keeps_data_dirty_until_flush_retries() {
        let store = Arc::new(TestStore::default());
        store.full.store(true, Ordering::SeqCst);
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        sleep(DEBOUNCE * 2).await;

        assert_eq!(handle.status(), SaveStatus::Error);
        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(state.is_dirty);
        assert_eq!(state.pending, Some(json!({"n": 1})));

        // Still full: flush reports the failure and keeps the data.
        let err = handle.flush().await.unwrap_err();
        assert!(matches!(err, SaveError::Store(StoreError::QuotaExceeded { .. })));
        assert!(handle.state().await.unwrap().is_dirty);

        store.full.store(false, Ordering::SeqCst);
        assert_eq!(handle.flush().await.unwrap(), Flushed::Written);
        assert_eq!(store.payloads(), vec![json!({"n": 1})]);
        assert_eq!(handle.status(), SaveStatus::Saved);
        assert!(!handle.state().await.unwrap().is_dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_retries_on_next_mark_dirty() {
        let store = Arc::new(TestStore::default());
        store.full.store(true, Ordering::SeqCst);
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        sleep(DEBOUNCE * 2).await;
        assert_eq!(handle.status(), SaveStatus::Error);

        store.full.store(false, Ordering::SeqCst);
        handle.mark_dirty(json!({"n": 2})).unwrap();
        sleep(DEBOUNCE * 2).await;

        assert_eq!(store.payloads(), vec![json!({"n": 2})]);
        assert_eq!(handle.status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_drops_pending_data() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        handle.discard().await.unwrap();
        sleep(DEBOUNCE * 2).await;

        assert!(store.payloads().is_empty());
        let state = handle.state().await.unwrap();
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(!state.is_dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_writes_pending_and_closes() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 1})).unwrap();
        assert_eq!(handle.shutdown().await.unwrap(), Flushed::Written);
        assert_eq!(store.payloads(), vec![json!({"n": 1})]);

        assert!(matches!(handle.mark_dirty(json!({})), Err(SaveError::Closed)));
        assert!(matches!(handle.flush().await, Err(SaveError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_writes_pending_data() {
        let store = Arc::new(TestStore::default());
        let handle = start(store.clone());

        handle.mark_dirty(json!({"n": 7})).unwrap();
        drop(handle);
        sleep(Duration::from_millis(1)).await;

        assert_eq!(store.payloads(), vec![json!({"n": 7})]);
    }
}
