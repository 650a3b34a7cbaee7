// Durability Core facade: wires components A-H together behind one request surface and
// owns the background timers that drive health, rotation, audit flush, and lock sweeping.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::audit::{AuditFilter, AuditOutcome, AuditSeverity, ExportFormat, RecoveryAuditLog};
use crate::backup::rotation::RotationResult;
use crate::backup::{BackupRecord, BackupStore, IncrementalBackupEngine, RotationEngine};
use crate::change_detector::ChangeDetector;
use crate::clock::Clock;
use crate::config::{DurabilityConfig, RotationConfig};
use crate::error::Result;
use crate::events::EventSink;
use crate::health::{HealthMonitor, HealthStatus};
use crate::lock::{LockManager, LockStatistics, Operation, OperationStatus, RegisterOutcome};
use crate::recovery::{CorruptionReport, RecoveryOptions, RecoveryPlanner, RecoveryPoint, RecoveryResult};
use crate::state_tree::Node;

/// Join handles for the four background timers; dropping this does not stop them,
/// call `abort_all` (or let the handles themselves be aborted) to stop early.
pub struct BackgroundHandles {
    pub health: JoinHandle<()>,
    pub rotation: JoinHandle<()>,
    pub audit_flush: JoinHandle<()>,
    pub lock_sweep: JoinHandle<()>,
}

impl BackgroundHandles {
    pub fn abort_all(&self) {
        self.health.abort();
        self.rotation.abort();
        self.audit_flush.abort();
        self.lock_sweep.abort();
    }
}

/// Façade over the eight durability components. Foreground calls go straight through
/// to the owning component; background timers are started separately via
/// `spawn_background_tasks` so a caller controls the async runtime they run on.
pub struct DurabilityCore {
    store: Arc<BackupStore>,
    incremental: Arc<IncrementalBackupEngine>,
    rotation: Arc<RotationEngine>,
    lock: Arc<LockManager>,
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryPlanner>,
    audit: Arc<RecoveryAuditLog>,
    clock: Arc<dyn Clock>,
}

impl DurabilityCore {
    pub fn new(config: DurabilityConfig, clock: Arc<dyn Clock>, event_sink: Arc<dyn EventSink>) -> Self {
        let store = Arc::new(BackupStore::new(config.incremental.backup_dir.clone()));
        let detector = Arc::new(ChangeDetector::new());
        let incremental = Arc::new(IncrementalBackupEngine::new(
            store.clone(),
            detector,
            config.incremental,
            clock.clone(),
        ));
        let rotation = Arc::new(RotationEngine::new(store.clone(), config.rotation, clock.clone()));
        let lock = Arc::new(LockManager::new(config.lock, clock.clone(), event_sink.clone()));
        let health = Arc::new(HealthMonitor::new(config.health, clock.clone(), event_sink.clone()));
        let recovery = Arc::new(RecoveryPlanner::new(
            incremental.clone(),
            config.recovery,
            clock.clone(),
            event_sink,
        ));
        let audit = Arc::new(RecoveryAuditLog::new(config.audit, clock.clone()));

        Self {
            store,
            incremental,
            rotation,
            lock,
            health,
            recovery,
            audit,
            clock,
        }
    }

    /// Starts the four background timers described by the concurrency model: health
    /// checks, rotation passes, audit-log flushes, and lock-table sweeps.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> BackgroundHandles {
        let health_interval_ms = self.health.config_interval_ms();
        let rotation_interval_ms = self.rotation.policy().interval_hours * 60 * 60 * 1000;
        let audit_interval_ms = self.audit.flush_interval_ms();
        let sweep_interval_ms = self.lock.cleanup_interval_ms();

        let health = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(std::time::Duration::from_millis(health_interval_ms.max(1)));
                loop {
                    ticker.tick().await;
                    if let Err(e) = core.health.perform_health_check() {
                        warn!(error = %e, "background health check failed");
                    }
                }
            })
        };

        let rotation = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(std::time::Duration::from_millis(rotation_interval_ms.max(1)));
                loop {
                    ticker.tick().await;
                    match core.rotation.perform_rotation() {
                        Ok(result) => info!(
                            deleted = result.deleted.len(),
                            remaining = result.remaining,
                            "background rotation pass complete"
                        ),
                        Err(e) => warn!(error = %e, "background rotation pass failed"),
                    }
                }
            })
        };

        let audit_flush = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(std::time::Duration::from_millis(audit_interval_ms.max(1)));
                loop {
                    ticker.tick().await;
                    if let Err(e) = core.audit.flush() {
                        warn!(error = %e, "background audit flush failed");
                    }
                }
            })
        };

        let lock_sweep = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(std::time::Duration::from_millis(sweep_interval_ms.max(1)));
                loop {
                    ticker.tick().await;
                    core.lock.sweep_expired_locks();
                }
            })
        };

        BackgroundHandles {
            health,
            rotation,
            audit_flush,
            lock_sweep,
        }
    }

    pub fn create_incremental(
        &self,
        session_id: &str,
        current_state: &Node,
        force_baseline: bool,
    ) -> Result<BackupRecord> {
        self.incremental.create_incremental(session_id, current_state, force_baseline)
    }

    pub fn rotate(&self) -> Result<RotationResult> {
        self.rotation.perform_rotation()
    }

    pub fn get_policy(&self) -> RotationConfig {
        self.rotation.policy()
    }

    pub fn update_policy(&self, config: RotationConfig) {
        self.rotation.update_policy(config)
    }

    pub fn estimate_post_rotation_usage(&self) -> Result<u64> {
        self.rotation.estimate_post_rotation_usage()
    }

    pub fn register_operation(&self, operation: Operation) -> RegisterOutcome {
        self.lock.register(operation)
    }

    pub fn start_operation(&self, operation_id: &str) -> Result<()> {
        self.lock.start(operation_id)
    }

    pub fn complete_operation(&self, operation_id: &str, outcome: OperationStatus) {
        self.lock.complete(operation_id, outcome)
    }

    pub fn lock_statistics(&self) -> LockStatistics {
        self.lock.statistics()
    }

    pub fn health_status(&self) -> Result<HealthStatus> {
        self.health.perform_health_check()
    }

    pub fn health_check_now(&self) -> Result<HealthStatus> {
        self.health.check_now()
    }

    pub fn get_recovery_points(&self) -> Result<Vec<RecoveryPoint>> {
        self.recovery.scan_for_recovery_points()
    }

    pub fn recover_to_point(&self, options: RecoveryOptions) -> RecoveryResult {
        let start = self.clock.now_millis();
        let result = self.recovery.recover_to_point(options);
        let duration_ms = self.clock.now_millis().saturating_sub(start);

        let outcome = if result.success {
            AuditOutcome::Success
        } else if result.warnings.is_empty() {
            AuditOutcome::Failure
        } else {
            AuditOutcome::Partial
        };
        let severity = if result.success {
            AuditSeverity::Low
        } else {
            AuditSeverity::Critical
        };
        let event_type = if result.success {
            "recovery-completed"
        } else {
            "recovery-failed"
        };

        if let Err(e) = self.audit.log(
            event_type,
            severity,
            "recover_to_point",
            serde_json::json!({"warnings": result.warnings}),
            outcome,
            Some(duration_ms),
            result.errors.first().cloned(),
            result.recovery_point.as_ref().and_then(|p| p.session_id.clone()),
            result.recovery_point.as_ref().map(|p| p.id.clone()),
        ) {
            warn!(error = %e, "failed to write audit entry for recovery attempt");
        }

        result
    }

    pub fn detect_corruption(&self) -> Result<CorruptionReport> {
        self.recovery.detect_corruption()
    }

    /// Scans for the most recent healthy recovery point across all sessions and
    /// recovers it, skipping corrupted candidates and repairing where possible.
    pub fn attempt_auto_recovery(&self, session_id: Option<String>) -> RecoveryResult {
        self.recover_to_point(RecoveryOptions {
            session_id,
            skip_corrupted: true,
            attempt_auto_repair: true,
            ..Default::default()
        })
    }

    pub fn create_checkpoint(
        &self,
        data: &Node,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<RecoveryPoint> {
        self.recovery.create_checkpoint(data, description, metadata)
    }

    pub fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<crate::audit::AuditEntry>> {
        self.audit.query(filter)
    }

    pub fn audit_summary(&self, filter: &AuditFilter) -> Result<crate::audit::AuditSummary> {
        self.audit.summary(filter)
    }

    pub fn audit_export(
        &self,
        path: &std::path::Path,
        filter: &AuditFilter,
        format: ExportFormat,
    ) -> Result<()> {
        self.audit.export(path, filter, format)
    }

    pub fn audit_cleanup(&self, days_to_keep: u64) -> Result<usize> {
        self.audit.cleanup(days_to_keep)
    }

    pub fn backup_store(&self) -> &Arc<BackupStore> {
        &self.store
    }
}
