//! Owner-scoped, TTL-bounded task records with a small state machine.
//!
//! ```text
//! working <-> input_required
//!    |
//!    +--> completed | failed | cancelled   (terminal, sticky)
//! ```
//!
//! Every mutation goes through one lock-protected entry point, so transitions for a given task
//! are serialized. Waiters are one-shot channels woken exactly once when the task turns terminal.

use crate::clock::Clock;
use crate::config::TaskConfig;
use crate::cursor;
use safefetch_core::{AbortReason, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const CANCELLED_MESSAGE: &str = "The task was cancelled by request.";
const MAX_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(skip)]
    pub owner_key: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub last_updated_at: u64,
    /// Milliseconds.
    pub ttl: u64,
    pub poll_interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl TaskRecord {
    fn expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateTaskOptions {
    pub ttl_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.status_message = Some(msg.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub type StatusListener = Arc<dyn Fn(&TaskRecord) + Send + Sync>;

struct Slot {
    record: TaskRecord,
    seq: u64,
    cancel: CancellationToken,
    waiters: Vec<(u64, oneshot::Sender<TaskRecord>)>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Slot>,
    next_seq: u64,
    next_waiter: u64,
}

impl Registry {
    /// Remove a record, stopping its work. Pending waiters see their channel close.
    fn evict(&mut self, id: &str) {
        if let Some(slot) = self.tasks.remove(id) {
            slot.cancel.cancel();
            tracing::debug!(task_id = %id, status = slot.record.status.as_str(), "task evicted");
        }
    }

    /// Live slot for `id`, evicting it first if its TTL has passed.
    fn live(&mut self, id: &str, now: u64) -> Option<&mut Slot> {
        if self.tasks.get(id).is_some_and(|s| s.record.expired_at(now)) {
            self.evict(id);
            return None;
        }
        self.tasks.get_mut(id)
    }
}

fn owner_matches(record: &TaskRecord, owner: Option<&str>) -> bool {
    owner.map_or(true, |o| o == record.owner_key)
}

pub struct TaskManager {
    registry: Mutex<Registry>,
    listeners: Mutex<Vec<StatusListener>>,
    clock: Arc<dyn Clock>,
    cfg: TaskConfig,
}

impl TaskManager {
    pub fn new(cfg: TaskConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            listeners: Mutex::new(Vec::new()),
            clock,
            cfg,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Observe every status change (push notifications). Panics are contained per listener.
    pub fn on_status(&self, listener: impl Fn(&TaskRecord) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    fn notify(&self, records: &[TaskRecord]) {
        if records.is_empty() {
            return;
        }
        let snapshot: Vec<StatusListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for rec in records {
            for l in &snapshot {
                if catch_unwind(AssertUnwindSafe(|| l(rec))).is_err() {
                    tracing::warn!(task_id = %rec.task_id, "task status listener panicked");
                }
            }
        }
    }

    pub fn create_task(
        &self,
        opts: CreateTaskOptions,
        initial_message: Option<String>,
        owner_key: &str,
    ) -> TaskRecord {
        let now = self.clock.now_ms();
        let record = TaskRecord {
            task_id: uuid::Uuid::new_v4().to_string(),
            owner_key: owner_key.to_string(),
            status: TaskStatus::Working,
            status_message: initial_message,
            created_at: now,
            last_updated_at: now,
            ttl: opts.ttl_ms.unwrap_or(self.cfg.default_ttl_ms),
            poll_interval: opts.poll_interval_ms.unwrap_or(self.cfg.poll_interval_ms),
            result: None,
            error: None,
        };
        let mut reg = self.lock();
        let seq = reg.next_seq;
        reg.next_seq += 1;
        reg.tasks.insert(
            record.task_id.clone(),
            Slot {
                record: record.clone(),
                seq,
                cancel: CancellationToken::new(),
                waiters: Vec::new(),
            },
        );
        drop(reg);
        tracing::debug!(task_id = %record.task_id, ttl_ms = record.ttl, "task created");
        record
    }

    pub fn get_task(&self, id: &str, owner: Option<&str>) -> Option<TaskRecord> {
        let now = self.clock.now_ms();
        let mut reg = self.lock();
        let slot = reg.live(id, now)?;
        owner_matches(&slot.record, owner).then(|| slot.record.clone())
    }

    /// Token the task's underlying work must observe; cancelled by `cancel_task` and eviction.
    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.lock().tasks.get(id).map(|s| s.cancel.clone())
    }

    /// Merge `update` into the record. Updates to a terminal task are ignored and the current
    /// record is returned unchanged.
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord> {
        let now = self.clock.now_ms();
        let record = {
            let mut reg = self.lock();
            let slot = reg
                .live(id, now)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            if slot.record.status.is_terminal() {
                tracing::debug!(
                    task_id = %id,
                    status = slot.record.status.as_str(),
                    "update ignored; task is terminal"
                );
                return Ok(slot.record.clone());
            }
            apply(slot, update, now);
            slot.record.clone()
        };
        self.notify(std::slice::from_ref(&record));
        Ok(record)
    }

    pub fn cancel_task(&self, id: &str, owner: Option<&str>) -> Result<TaskRecord> {
        let now = self.clock.now_ms();
        let record = {
            let mut reg = self.lock();
            let slot = reg
                .live(id, now)
                .filter(|s| owner_matches(&s.record, owner))
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            if slot.record.status.is_terminal() {
                return Err(Error::AlreadyTerminal(format!(
                    "task {id} is already {}",
                    slot.record.status.as_str()
                )));
            }
            apply(
                slot,
                TaskUpdate::status(TaskStatus::Cancelled).message(CANCELLED_MESSAGE),
                now,
            );
            slot.record.clone()
        };
        tracing::debug!(task_id = %id, "task cancelled");
        self.notify(std::slice::from_ref(&record));
        Ok(record)
    }

    /// Bulk-cancel an owner's live tasks; returns the records that were cancelled.
    pub fn cancel_tasks_by_owner(&self, owner: &str, message: &str) -> Vec<TaskRecord> {
        self.cancel_where(|r| r.owner_key == owner, message)
    }

    /// Cancel every live task (process shutdown).
    pub fn cancel_all(&self, message: &str) -> Vec<TaskRecord> {
        self.cancel_where(|_| true, message)
    }

    fn cancel_where(&self, pred: impl Fn(&TaskRecord) -> bool, message: &str) -> Vec<TaskRecord> {
        let now = self.clock.now_ms();
        let cancelled: Vec<TaskRecord> = {
            let mut reg = self.lock();
            let ids: Vec<String> = reg
                .tasks
                .values()
                .filter(|s| pred(&s.record))
                .map(|s| s.record.task_id.clone())
                .collect();
            let mut out = Vec::new();
            for id in ids {
                let Some(slot) = reg.live(&id, now) else { continue };
                if slot.record.status.is_terminal() {
                    continue;
                }
                apply(slot, TaskUpdate::status(TaskStatus::Cancelled).message(message), now);
                out.push(slot.record.clone());
            }
            out
        };
        if !cancelled.is_empty() {
            tracing::debug!(count = cancelled.len(), "tasks cancelled in bulk");
        }
        self.notify(&cancelled);
        cancelled
    }

    /// Wait until the task is terminal.
    ///
    /// Resolves to `Ok(None)` if the task is unknown, foreign, or its TTL runs out while
    /// waiting (it is evicted then). Fails with `Aborted(Cancelled)` if `cancel` fires first.
    pub async fn wait_for_terminal_task(
        &self,
        id: &str,
        owner: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<TaskRecord>> {
        let now = self.clock.now_ms();
        let (rx, waiter_id, remaining) = {
            let mut reg = self.lock();
            let waiter_id = reg.next_waiter;
            reg.next_waiter += 1;
            let Some(slot) = reg.live(id, now) else {
                return Ok(None);
            };
            if !owner_matches(&slot.record, owner) {
                return Ok(None);
            }
            if slot.record.status.is_terminal() {
                return Ok(Some(slot.record.clone()));
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push((waiter_id, tx));
            let deadline = slot.record.created_at.saturating_add(slot.record.ttl);
            (rx, waiter_id, Duration::from_millis(deadline.saturating_sub(now)))
        };

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        tokio::select! {
            biased;
            r = rx => Ok(r.ok()),
            _ = cancel.cancelled() => {
                self.drop_waiter(id, waiter_id);
                Err(Error::Aborted(AbortReason::Cancelled))
            }
            _ = tokio::time::sleep(remaining) => {
                let mut reg = self.lock();
                let still_open = reg
                    .tasks
                    .get(id)
                    .is_some_and(|s| !s.record.status.is_terminal());
                if still_open {
                    reg.evict(id);
                    tracing::debug!(task_id = %id, "task ttl elapsed while waiting");
                    Ok(None)
                } else {
                    Ok(reg.tasks.get(id).map(|s| s.record.clone()))
                }
            }
        }
    }

    fn drop_waiter(&self, id: &str, waiter_id: u64) {
        if let Some(slot) = self.lock().tasks.get_mut(id) {
            slot.waiters.retain(|(w, _)| *w != waiter_id);
        }
    }

    /// One page of an owner's tasks in creation order.
    pub fn list_tasks(
        &self,
        owner: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<TaskPage> {
        let offset = match cursor {
            Some(c) => cursor::decode(c)?,
            None => 0,
        };
        let limit = limit
            .unwrap_or(self.cfg.page_size)
            .clamp(1, MAX_PAGE_SIZE);
        let now = self.clock.now_ms();
        let mut reg = self.lock();
        evict_expired(&mut reg, now);
        let mut mine: Vec<&Slot> = reg
            .tasks
            .values()
            .filter(|s| s.record.owner_key == owner)
            .collect();
        mine.sort_by_key(|s| s.seq);
        let total = mine.len();
        let tasks: Vec<TaskRecord> = mine
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|s| s.record.clone())
            .collect();
        let end = offset.saturating_add(tasks.len());
        let next_cursor = (end < total && !tasks.is_empty()).then(|| cursor::encode(end));
        Ok(TaskPage { tasks, next_cursor })
    }

    /// Drop every expired record; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        evict_expired(&mut self.lock(), now)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic sweep until `stop` fires. Holds only a weak reference to the manager.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.cfg.sweep_interval_ms.max(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(mgr) = weak.upgrade() else { break };
                let removed = mgr.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "task sweep removed expired records");
                }
            }
        })
    }
}

fn apply(slot: &mut Slot, update: TaskUpdate, now: u64) {
    let rec = &mut slot.record;
    if let Some(s) = update.status {
        rec.status = s;
    }
    if update.status_message.is_some() {
        rec.status_message = update.status_message;
    }
    if update.result.is_some() {
        rec.result = update.result;
    }
    if update.error.is_some() {
        rec.error = update.error;
    }
    rec.last_updated_at = now;
    if rec.status == TaskStatus::Cancelled {
        slot.cancel.cancel();
    }
    if rec.status.is_terminal() {
        for (_, tx) in slot.waiters.drain(..) {
            // A receiver that already gave up is fine.
            let _ = tx.send(rec.clone());
        }
    }
}

fn evict_expired(reg: &mut Registry, now: u64) -> usize {
    let dead: Vec<String> = reg
        .tasks
        .values()
        .filter(|s| s.record.expired_at(now))
        .map(|s| s.record.task_id.clone())
        .collect();
    for id in &dead {
        reg.evict(id);
    }
    dead.len()
}
