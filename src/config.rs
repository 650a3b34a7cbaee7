// Recognized configuration surface (spec §6). Loading this from a file or environment is an
// external collaborator's job; the core only ever consumes an already-constructed `DurabilityConfig`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    pub backup_dir: PathBuf,
    pub max_incrementals_per_chain: usize,
    pub compression_threshold_bytes: u64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./data/backups"),
            max_incrementals_per_chain: 50,
            compression_threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionClassPolicy {
    pub enabled: bool,
    pub retain_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    pub hourly: RetentionClassPolicy,
    pub daily: RetentionClassPolicy,
    pub weekly: RetentionClassPolicy,
    pub monthly: RetentionClassPolicy,
    pub max_total_size_mb: u64,
    pub max_age_days: u64,
    pub interval_hours: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            hourly: RetentionClassPolicy {
                enabled: true,
                retain_count: 24,
            },
            daily: RetentionClassPolicy {
                enabled: true,
                retain_count: 30,
            },
            weekly: RetentionClassPolicy {
                enabled: true,
                retain_count: 12,
            },
            monthly: RetentionClassPolicy {
                enabled: true,
                retain_count: 12,
            },
            max_total_size_mb: 5000,
            max_age_days: 365,
            interval_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub max_backup_age_ms: u64,
    pub min_backup_size_bytes: u64,
    pub max_backup_size_bytes: u64,
    pub enable_auto_fix: bool,
    pub alert_threshold_percent: f64,
    pub roots: Vec<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 3_600_000,
            max_backup_age_ms: 30 * 24 * 60 * 60 * 1000,
            min_backup_size_bytes: 100,
            max_backup_size_bytes: 100 * 1024 * 1024,
            enable_auto_fix: true,
            alert_threshold_percent: 20.0,
            roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub lock_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub history_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 300_000,
            cleanup_interval_ms: 60_000,
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub audit_dir: PathBuf,
    pub flush_interval_ms: u64,
    pub max_log_size_bytes: u64,
    pub max_log_files: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_dir: PathBuf::from("./data/audit"),
            flush_interval_ms: 5000,
            max_log_size_bytes: 50 * 1024 * 1024,
            max_log_files: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub recovery_dir: PathBuf,
    pub scan_roots: Vec<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_dir: PathBuf::from("./data/recovery"),
            scan_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurabilityConfig {
    pub incremental: IncrementalConfig,
    pub rotation: RotationConfig,
    pub health: HealthConfig,
    pub lock: LockConfig,
    pub audit: AuditConfig,
    pub recovery: RecoveryConfig,
}
