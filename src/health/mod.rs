// Health Monitor (component F): periodically scans backup files, classifies issues,
// produces a status report, and optionally auto-remediates benign faults.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backup::BackupRecord;
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::error::Result;
use crate::events::{DurabilityEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthIssueKind {
    Corruption,
    Missing,
    ChecksumMismatch,
    Outdated,
    SizeAnomaly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub backup_id: String,
    pub path: PathBuf,
    pub severity: Severity,
    pub kind: HealthIssueKind,
    pub auto_fixable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub path: PathBuf,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub healthy_count: usize,
    pub total: usize,
    pub issues: Vec<HealthIssue>,
    pub checked_at: u64,
}

pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            clock,
            event_sink,
        }
    }

    /// Alias for `perform_health_check`, named for the on-demand request surface.
    pub fn check_now(&self) -> Result<HealthStatus> {
        self.perform_health_check()
    }

    pub fn config_interval_ms(&self) -> u64 {
        self.config.check_interval_ms
    }

    pub fn perform_health_check(&self) -> Result<HealthStatus> {
        let mut results = Vec::new();
        for root in &self.config.roots {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let ext = entry.path().extension().and_then(|e| e.to_str());
                if !matches!(ext, Some("json") | Some("gz")) {
                    continue;
                }
                results.push(self.check_file(entry.path()));
            }
        }

        let total = results.len();
        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let issues: Vec<HealthIssue> = results.into_iter().flat_map(|r| r.issues).collect();

        let healthy_ratio = if total == 0 {
            100.0
        } else {
            healthy_count as f64 / total as f64 * 100.0
        };
        let healthy = healthy_ratio >= (100.0 - self.config.alert_threshold_percent);

        let status = HealthStatus {
            healthy,
            healthy_count,
            total,
            issues,
            checked_at: self.clock.now_millis(),
        };

        self.event_sink.emit(DurabilityEvent::HealthChanged {
            status: status.clone(),
        });

        if self.config.enable_auto_fix {
            self.auto_fix(&status);
        }

        Ok(status)
    }

    fn check_file(&self, path: &std::path::Path) -> HealthCheckResult {
        let mut issues = Vec::new();
        let backup_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                issues.push(HealthIssue {
                    backup_id,
                    path: path.to_path_buf(),
                    severity: Severity::High,
                    kind: HealthIssueKind::Missing,
                    auto_fixable: false,
                });
                return HealthCheckResult {
                    path: path.to_path_buf(),
                    healthy: false,
                    issues,
                };
            }
        };

        if metadata.len() < self.config.min_backup_size_bytes {
            issues.push(HealthIssue {
                backup_id: backup_id.clone(),
                path: path.to_path_buf(),
                severity: Severity::High,
                kind: HealthIssueKind::SizeAnomaly,
                auto_fixable: false,
            });
        } else if metadata.len() > self.config.max_backup_size_bytes {
            issues.push(HealthIssue {
                backup_id: backup_id.clone(),
                path: path.to_path_buf(),
                severity: Severity::Medium,
                kind: HealthIssueKind::SizeAnomaly,
                auto_fixable: false,
            });
        }

        if let Ok(modified) = metadata.modified() {
            let age_ms = self
                .clock
                .now()
                .duration_since(modified)
                .unwrap_or_default()
                .as_millis() as u64;
            if age_ms > self.config.max_backup_age_ms {
                issues.push(HealthIssue {
                    backup_id: backup_id.clone(),
                    path: path.to_path_buf(),
                    severity: Severity::Low,
                    kind: HealthIssueKind::Outdated,
                    auto_fixable: true,
                });
            }
        }

        match std::fs::read_to_string(path) {
            Err(_) => issues.push(HealthIssue {
                backup_id: backup_id.clone(),
                path: path.to_path_buf(),
                severity: Severity::Critical,
                kind: HealthIssueKind::Corruption,
                auto_fixable: false,
            }),
            Ok(body) => match serde_json::from_str::<serde_json::Value>(&body) {
                Err(_) => issues.push(HealthIssue {
                    backup_id: backup_id.clone(),
                    path: path.to_path_buf(),
                    severity: Severity::Critical,
                    kind: HealthIssueKind::Corruption,
                    auto_fixable: false,
                }),
                Ok(value) => {
                    let has_id = value.get("id").is_some();
                    let has_timestamp = value.get("timestamp").is_some();
                    if !has_id || !has_timestamp {
                        issues.push(HealthIssue {
                            backup_id: backup_id.clone(),
                            path: path.to_path_buf(),
                            severity: Severity::High,
                            kind: HealthIssueKind::Corruption,
                            auto_fixable: false,
                        });
                    } else if let Ok(record) = serde_json::from_value::<BackupRecord>(value) {
                        if let Ok(decoded) = record.changes.decode() {
                            if let Ok(expected) = BackupRecord::compute_payload_checksum(&decoded)
                            {
                                if expected != record.payload_checksum {
                                    issues.push(HealthIssue {
                                        backup_id: backup_id.clone(),
                                        path: path.to_path_buf(),
                                        severity: Severity::Critical,
                                        kind: HealthIssueKind::ChecksumMismatch,
                                        auto_fixable: false,
                                    });
                                }
                            }
                        }
                    }
                }
            },
        }

        HealthCheckResult {
            path: path.to_path_buf(),
            healthy: issues.is_empty(),
            issues,
        }
    }

    fn auto_fix(&self, status: &HealthStatus) {
        for issue in &status.issues {
            if issue.kind == HealthIssueKind::Outdated && issue.auto_fixable {
                match std::fs::remove_file(&issue.path) {
                    Ok(()) => info!(path = %issue.path.display(), "auto-fixed outdated backup"),
                    Err(e) => warn!(path = %issue.path.display(), error = %e, "auto-fix failed"),
                }
            }
        }
    }
}
