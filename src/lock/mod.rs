// Conflict/Lock Manager (component E): registers backup/restore operations, assigns
// resource locks, resolves conflicts by priority/type, and merges compatible operations.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::LockConfig;
use crate::error::{DurabilityError, Result};
use crate::events::{DurabilityEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    AutoSave,
    Manual,
    Incremental,
    Full,
    Restoration,
}

impl OperationType {
    fn is_resource_intensive(self) -> bool {
        matches!(self, OperationType::Full | OperationType::Restoration)
    }

    /// Lock kind each operation type acquires on its required resources. `Restoration`
    /// is exclusive; everything else writes. `LockKind::Read` exists for the
    /// compatibility matrix but none of the five operation types produce it today.
    fn lock_kind(self) -> LockKind {
        match self {
            OperationType::Restoration => LockKind::Exclusive,
            _ => LockKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub session_id: String,
    pub op_type: OperationType,
    pub priority: Priority,
    pub required_resources: HashSet<String>,
    pub status: OperationStatus,
    pub conflicts_with: HashSet<String>,
}

impl Operation {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        op_type: OperationType,
        priority: Priority,
        required_resources: HashSet<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            op_type,
            priority,
            required_resources,
            status: OperationStatus::Pending,
            conflicts_with: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Read,
    Write,
    Exclusive,
}

fn compatible(a: LockKind, b: LockKind) -> bool {
    matches!((a, b), (LockKind::Read, LockKind::Read))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub operation_id: String,
    pub session_id: String,
    pub lock_kind: LockKind,
    pub acquired_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub operation_id: String,
    pub conflicts_with: Vec<String>,
    pub resolution: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub operation_id: String,
    pub status: OperationStatus,
    pub cancelled: Vec<String>,
    pub resolution: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LockStatistics {
    pub pending: usize,
    pub running: usize,
    pub locks_held: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

enum Resolution {
    CancelConflicting(String),
    Queue(String),
    Merge(String),
}

pub struct LockManager {
    operations: DashMap<String, Operation>,
    locks: DashMap<String, Vec<ResourceLock>>,
    history: Mutex<VecDeque<ConflictRecord>>,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockConfig, clock: Arc<dyn Clock>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            operations: DashMap::new(),
            locks: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            config,
            clock,
            event_sink,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn cleanup_interval_ms(&self) -> u64 {
        self.config.cleanup_interval_ms
    }

    pub fn register(&self, operation: Operation) -> RegisterOutcome {
        self.event_sink.emit(DurabilityEvent::OperationRegistered {
            operation_id: operation.id.clone(),
            session_id: operation.session_id.clone(),
        });

        let conflicting: Vec<Operation> = self
            .operations
            .iter()
            .filter(|entry| {
                matches!(
                    entry.status,
                    OperationStatus::Pending | OperationStatus::Running
                )
            })
            .map(|entry| entry.value().clone())
            .filter(|existing| conflicts(existing, &operation))
            .collect();

        if conflicting.is_empty() {
            self.operations
                .insert(operation.id.clone(), operation.clone());
            return RegisterOutcome {
                operation_id: operation.id,
                status: OperationStatus::Pending,
                cancelled: Vec::new(),
                resolution: "no-conflict".to_string(),
            };
        }

        let max_conflicting_priority = conflicting.iter().map(|o| o.priority).max().unwrap();
        let resolution = if operation.priority == Priority::Critical {
            Resolution::CancelConflicting("critical-priority-preempts".to_string())
        } else if operation.priority > max_conflicting_priority {
            Resolution::CancelConflicting("higher-priority-preempts".to_string())
        } else if operation.priority < max_conflicting_priority {
            Resolution::Queue("lower-priority-queued".to_string())
        } else if operation.op_type == OperationType::AutoSave
            && conflicting
                .iter()
                .any(|c| c.op_type == OperationType::Manual)
        {
            Resolution::Queue("auto-save-yields-to-manual".to_string())
        } else if operation.op_type == OperationType::AutoSave
            && conflicting.iter().all(|c| {
                c.op_type == OperationType::AutoSave && c.session_id == operation.session_id
            })
        {
            Resolution::Merge("auto-save-merge".to_string())
        } else {
            Resolution::Queue("equal-priority-queued".to_string())
        };

        let (cancelled_ids, resolution_label) = match resolution {
            Resolution::CancelConflicting(label) | Resolution::Merge(label) => {
                let ids: Vec<String> = conflicting.iter().map(|o| o.id.clone()).collect();
                for id in &ids {
                    self.cancel_internal(id);
                }
                (ids, label)
            }
            Resolution::Queue(label) => (Vec::new(), label),
        };

        let mut new_op = operation;
        new_op.conflicts_with = conflicting.iter().map(|o| o.id.clone()).collect();
        self.operations.insert(new_op.id.clone(), new_op.clone());

        self.push_history(ConflictRecord {
            operation_id: new_op.id.clone(),
            conflicts_with: new_op.conflicts_with.iter().cloned().collect(),
            resolution: resolution_label.clone(),
            timestamp: self.clock.now_millis(),
        });

        if !cancelled_ids.is_empty() {
            self.event_sink.emit(DurabilityEvent::ConflictResolved {
                operation_id: new_op.id.clone(),
                cancelled: cancelled_ids.clone(),
                resolution: resolution_label.clone(),
            });
        }

        RegisterOutcome {
            operation_id: new_op.id,
            status: OperationStatus::Pending,
            cancelled: cancelled_ids,
            resolution: resolution_label,
        }
    }

    /// Attempts to acquire every resource lock the operation needs. All-or-nothing: a
    /// failed acquisition releases whatever this call already took.
    pub fn start(&self, operation_id: &str) -> Result<()> {
        let mut op = self
            .operations
            .get(operation_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| DurabilityError::NotFound(operation_id.to_string()))?;

        let kind = op.op_type.lock_kind();
        let mut acquired = Vec::new();
        for resource in &op.required_resources {
            match self.acquire_lock(resource, &op.id, &op.session_id, kind) {
                Ok(()) => acquired.push(resource.clone()),
                Err(e) => {
                    for resource in &acquired {
                        self.release_lock(resource, &op.id);
                    }
                    return Err(e);
                }
            }
        }

        op.status = OperationStatus::Running;
        self.operations.insert(op.id.clone(), op);
        Ok(())
    }

    fn acquire_lock(
        &self,
        resource_id: &str,
        operation_id: &str,
        session_id: &str,
        kind: LockKind,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let mut holders = self.locks.entry(resource_id.to_string()).or_default();
        holders.retain(|lock| {
            let expired = lock.expires_at <= now;
            if expired {
                debug!(resource = resource_id, operation = %lock.operation_id, "reclaiming expired lock");
            }
            !expired
        });

        if holders.iter().any(|lock| !compatible(lock.lock_kind, kind)) {
            return Err(DurabilityError::LockBusy(resource_id.to_string()));
        }

        holders.push(ResourceLock {
            resource_id: resource_id.to_string(),
            operation_id: operation_id.to_string(),
            session_id: session_id.to_string(),
            lock_kind: kind,
            acquired_at: now,
            expires_at: now + self.config.lock_timeout_ms,
        });
        Ok(())
    }

    fn release_lock(&self, resource_id: &str, operation_id: &str) {
        if let Some(mut holders) = self.locks.get_mut(resource_id) {
            holders.retain(|lock| lock.operation_id != operation_id);
        }
    }

    /// Releases every lock held by `operation_id`, marks it with `outcome`, and
    /// re-evaluates pending operations whose conflicts may now have cleared.
    pub fn complete(&self, operation_id: &str, outcome: OperationStatus) {
        for mut holders in self.locks.iter_mut() {
            holders.retain(|lock| lock.operation_id != operation_id);
        }

        if let Some((_, mut op)) = self.operations.remove(operation_id) {
            op.status = outcome;
            match outcome {
                OperationStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
                OperationStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
                OperationStatus::Cancelled => self.cancelled.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
            self.event_sink.emit(DurabilityEvent::OperationCompleted {
                operation_id: op.id.clone(),
                outcome: format!("{outcome:?}"),
            });
        }

        self.reevaluate_pending();
    }

    fn cancel_internal(&self, operation_id: &str) {
        for mut holders in self.locks.iter_mut() {
            holders.retain(|lock| lock.operation_id != operation_id);
        }
        if let Some(mut entry) = self.operations.get_mut(operation_id) {
            entry.status = OperationStatus::Cancelled;
        }
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn reevaluate_pending(&self) {
        let pending_ids: Vec<String> = self
            .operations
            .iter()
            .filter(|e| e.status == OperationStatus::Pending)
            .map(|e| e.key().clone())
            .collect();
        for id in pending_ids {
            let _ = self.start(&id);
        }
    }

    /// Drops locks past their `expires_at`. Intended to run on a periodic sweeper.
    pub fn sweep_expired_locks(&self) {
        let now = self.clock.now_millis();
        let mut dropped = 0usize;
        for mut holders in self.locks.iter_mut() {
            let before = holders.len();
            holders.retain(|lock| lock.expires_at > now);
            dropped += before - holders.len();
        }
        if dropped > 0 {
            info!(dropped, "lock sweeper reclaimed expired locks");
        } else {
            debug!("lock sweeper found nothing to reclaim");
        }
    }

    pub fn statistics(&self) -> LockStatistics {
        let pending = self
            .operations
            .iter()
            .filter(|e| e.status == OperationStatus::Pending)
            .count();
        let running = self
            .operations
            .iter()
            .filter(|e| e.status == OperationStatus::Running)
            .count();
        let locks_held = self.locks.iter().map(|e| e.len()).sum();
        LockStatistics {
            pending,
            running,
            locks_held,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn push_history(&self, record: ConflictRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }

    pub fn conflict_history(&self) -> Vec<ConflictRecord> {
        self.history.lock().iter().cloned().collect()
    }
}

/// Same-session operations always conflict (this also covers the spec's "either side is
/// a restoration in the same session" rule, which is a special case of it). Cross-session
/// conflicts arise only from shared, lock-incompatible resources or two resource-intensive
/// operations landing at once.
fn conflicts(existing: &Operation, new: &Operation) -> bool {
    if existing.session_id == new.session_id {
        return true;
    }
    let shares_resource = !existing
        .required_resources
        .is_disjoint(&new.required_resources);
    if shares_resource && !compatible(existing.op_type.lock_kind(), new.op_type.lock_kind()) {
        return true;
    }
    existing.op_type.is_resource_intensive() && new.op_type.is_resource_intensive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::null_sink;
    use std::time::UNIX_EPOCH;

    fn manager() -> LockManager {
        LockManager::new(
            LockConfig::default(),
            Arc::new(ManualClock::new(UNIX_EPOCH)),
            null_sink(),
        )
    }

    fn resources(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn non_conflicting_operations_both_start() {
        let mgr = manager();
        let op_a = Operation::new(
            "a",
            "s1",
            OperationType::AutoSave,
            Priority::Normal,
            resources(&["r1"]),
        );
        let op_b = Operation::new(
            "b",
            "s2",
            OperationType::AutoSave,
            Priority::Normal,
            resources(&["r2"]),
        );
        assert!(mgr.register(op_a).cancelled.is_empty());
        assert!(mgr.register(op_b).cancelled.is_empty());
        assert!(mgr.start("a").is_ok());
        assert!(mgr.start("b").is_ok());
    }

    #[test]
    fn repeated_autosaves_merge_and_cancel_predecessors() {
        let mgr = manager();
        let r = resources(&["session-s1"]);
        for id in ["a", "b", "c"] {
            let op = Operation::new(id, "s1", OperationType::AutoSave, Priority::Normal, r.clone());
            mgr.register(op);
        }
        let c = mgr.operations.get("c").unwrap();
        assert_eq!(c.status, OperationStatus::Pending);
        let a = mgr.operations.get("a").unwrap();
        assert_eq!(a.status, OperationStatus::Cancelled);
    }

    #[test]
    fn critical_priority_preempts_pending_lower_priority() {
        let mgr = manager();
        let r = resources(&["session-s1"]);
        mgr.register(Operation::new(
            "low",
            "s1",
            OperationType::Manual,
            Priority::Normal,
            r.clone(),
        ));
        let outcome = mgr.register(Operation::new(
            "urgent",
            "s1",
            OperationType::Restoration,
            Priority::Critical,
            r,
        ));
        assert_eq!(outcome.cancelled, vec!["low".to_string()]);
    }

    #[test]
    fn incompatible_locks_on_shared_resource_deny_start() {
        let mgr = manager();
        let op_a = Operation::new(
            "a",
            "s1",
            OperationType::Manual,
            Priority::Normal,
            resources(&["shared"]),
        );
        mgr.register(op_a);
        mgr.start("a").unwrap();

        // Force a second write lock attempt directly, bypassing the same-session
        // conflict rule, to exercise the resource-lock compatibility check itself.
        let err = mgr.acquire_lock("shared", "other", "s2", LockKind::Write);
        assert!(err.is_err());
    }

    #[test]
    fn complete_releases_locks_and_starts_queued_operation() {
        let mgr = manager();
        let r = resources(&["session-s1"]);
        mgr.register(Operation::new(
            "first",
            "s1",
            OperationType::Manual,
            Priority::Normal,
            r.clone(),
        ));
        mgr.start("first").unwrap();

        let outcome = mgr.register(Operation::new(
            "second",
            "s1",
            OperationType::Manual,
            Priority::Normal,
            r,
        ));
        assert!(outcome.cancelled.is_empty());
        assert_eq!(
            mgr.operations.get("second").unwrap().status,
            OperationStatus::Pending
        );

        mgr.complete("first", OperationStatus::Completed);
        assert_eq!(
            mgr.operations.get("second").unwrap().status,
            OperationStatus::Running
        );
    }
}
