// Recovery Planner (component G): enumerates recovery points, ranks them against a
// query, attempts repair, and executes restoration, optionally merging partial saves.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup::{
    base64_then_gunzip, sha256_hex, BackupKind, BackupMetadata, BackupRecord,
    ChangeEntry, ChangeKind, ChangesPayload, IncrementalBackupEngine, BASELINE_FIELD,
};
use crate::clock::Clock;
use crate::config::RecoveryConfig;
use crate::error::{DurabilityError, Result};
use crate::events::{DurabilityEvent, EventSink};
use crate::health::Severity;
use crate::state_tree::{flatten, get_path, set_path, to_json_value, Node};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub timestamp: u64,
    pub kind: BackupKind,
    pub session_id: Option<String>,
    pub size_bytes: u64,
    pub healthy: bool,
    pub checksum_valid: bool,
    pub on_disk_path: PathBuf,
    pub metadata: BackupMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    pub target_timestamp: Option<u64>,
    /// Filtered against `RecoveryPoint::session_id`. There is no separate project concept
    /// in the persisted record; a caller that encodes project scoping into session ids
    /// should pass the same value here and in `session_id`.
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub skip_corrupted: bool,
    pub attempt_auto_repair: bool,
    pub merge_partial_saves: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecoveryMetadata {
    pub duration_ms: u64,
    pub integrity_score: i64,
    pub repairs_attempted: u32,
    pub repairs_succeeded: u32,
}

pub struct RecoveryResult {
    pub success: bool,
    pub state: Option<Node>,
    pub timestamp: Option<u64>,
    pub recovery_point: Option<RecoveryPoint>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: RecoveryMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub total: usize,
    pub healthy_count: usize,
    pub unhealthy: Vec<RecoveryPoint>,
    pub repairable_files: Vec<String>,
    pub unrepairable_files: Vec<String>,
    pub severity: Severity,
    pub recommended_action: String,
}

pub struct RecoveryPlanner {
    incremental: Arc<IncrementalBackupEngine>,
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl RecoveryPlanner {
    pub fn new(
        incremental: Arc<IncrementalBackupEngine>,
        config: RecoveryConfig,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            incremental,
            config,
            clock,
            event_sink,
        }
    }

    pub fn scan_for_recovery_points(&self) -> Result<Vec<RecoveryPoint>> {
        let mut points = Vec::new();
        let mut roots = self.config.scan_roots.clone();
        roots.push(self.config.recovery_dir.clone());
        for root in roots {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                points.push(build_point(entry.path()));
            }
        }
        Ok(points)
    }

    pub fn recover_to_point(&self, options: RecoveryOptions) -> RecoveryResult {
        self.event_sink.emit(DurabilityEvent::RecoveryStarted {
            session_id: options.session_id.clone(),
        });
        let start = self.clock.now_millis();

        let result = self.recover_inner(&options);
        let duration_ms = self.clock.now_millis().saturating_sub(start);

        let mut result = result;
        result.metadata.duration_ms = duration_ms;
        self.event_sink.emit(DurabilityEvent::RecoveryCompleted {
            success: result.success,
            recovery_point: result.recovery_point.clone(),
        });
        result
    }

    fn recover_inner(&self, options: &RecoveryOptions) -> RecoveryResult {
        let points = match self.scan_for_recovery_points() {
            Ok(p) => p,
            Err(e) => return failure(vec![e.to_string()]),
        };

        let mut candidates: Vec<RecoveryPoint> = points
            .into_iter()
            .filter(|p| matches_filters(p, options))
            .collect();
        if options.skip_corrupted {
            candidates.retain(|p| p.healthy);
        }
        candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let Some(mut point) = candidates.into_iter().next() else {
            return failure(vec!["no recovery point matches the given filters".to_string()]);
        };

        let mut repairs_attempted = 0u32;
        let mut repairs_succeeded = 0u32;

        if !point.healthy {
            if options.attempt_auto_repair {
                repairs_attempted += 1;
                if self.repair_point(&mut point) {
                    repairs_succeeded += 1;
                } else if !options.skip_corrupted {
                    return failure(vec![format!(
                        "recovery point {} is unhealthy and repair failed",
                        point.id
                    )]);
                }
            } else if !options.skip_corrupted {
                return failure(vec![format!(
                    "recovery point {} is unhealthy",
                    point.id
                )]);
            }
        }

        let mut warnings = Vec::new();
        let mut state = match self.load_point(&point) {
            Ok(s) => s,
            Err(e) => return failure(vec![e.to_string()]),
        };

        if options.merge_partial_saves {
            if let Err(e) = self.merge_partial_saves(&point, options, &mut state, &mut warnings) {
                warnings.push(format!("partial-save merge skipped: {e}"));
            }
        }

        let integrity_score = integrity_score(&point, &state);

        RecoveryResult {
            success: true,
            timestamp: Some(point.timestamp),
            state: Some(state),
            recovery_point: Some(point),
            errors: Vec::new(),
            warnings,
            metadata: RecoveryMetadata {
                duration_ms: 0,
                integrity_score,
                repairs_attempted,
                repairs_succeeded,
            },
        }
    }

    fn load_point(&self, point: &RecoveryPoint) -> Result<Node> {
        if point.kind == BackupKind::Checkpoint {
            let body = std::fs::read_to_string(&point.on_disk_path)?;
            let record: BackupRecord = serde_json::from_str(&body)
                .map_err(|e| DurabilityError::Corrupt(format!("{}: {e}", point.id)))?;
            decode_single_entry_state(&record)
        } else {
            let session_id = point
                .session_id
                .clone()
                .ok_or_else(|| DurabilityError::Corrupt(format!("{} has no session", point.id)))?;
            let outcome = self.incremental.restore_chain(&session_id, Some(&point.id))?;
            Ok(outcome.state)
        }
    }

    fn merge_partial_saves(
        &self,
        base: &RecoveryPoint,
        options: &RecoveryOptions,
        state: &mut Node,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let points = self.scan_for_recovery_points()?;
        for candidate in points {
            if candidate.id == base.id {
                continue;
            }
            if !matches_filters(&candidate, options) || !candidate.healthy {
                continue;
            }
            if candidate.timestamp <= base.timestamp {
                continue;
            }
            let partial_state = match self.load_point(&candidate) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let base_flat = flatten(state);
            let partial_flat = flatten(&partial_state);
            for (path, value) in &partial_flat {
                if base_flat.get(path) != Some(value) {
                    warnings.push(format!("conflict at {path}, newer save wins"));
                    set_path(state, path, value.clone())?;
                }
            }
        }
        Ok(())
    }

    fn repair_point(&self, point: &mut RecoveryPoint) -> bool {
        let Ok(body) = std::fs::read_to_string(&point.on_disk_path) else {
            return false;
        };
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&body) else {
            return false;
        };
        let Some(obj) = value.as_object_mut() else {
            return false;
        };

        obj.entry("id").or_insert_with(|| serde_json::json!(point.id));
        obj.entry("timestamp")
            .or_insert_with(|| serde_json::json!(point.timestamp));
        obj.entry("parent_id").or_insert(serde_json::Value::Null);
        obj.entry("kind")
            .or_insert_with(|| serde_json::json!(point.kind));
        obj.entry("session_id").or_insert_with(|| {
            serde_json::json!(point.session_id.clone().unwrap_or_default())
        });
        obj.entry("on_disk_path").or_insert(serde_json::Value::Null);

        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(meta_obj) = metadata.as_object_mut() {
            meta_obj.entry("schema_version").or_insert(serde_json::json!(1));
            meta_obj.entry("compressed").or_insert(serde_json::json!(false));
            meta_obj.entry("total_changes").or_insert(serde_json::json!(0));
            meta_obj
                .entry("change_percentage")
                .or_insert(serde_json::json!(0.0));
            meta_obj.entry("original_size").or_insert(serde_json::json!(0));
        }

        if let Some(changes) = obj.get("changes").cloned() {
            if let Ok(entries) = serde_json::from_value::<Vec<ChangeEntry>>(changes) {
                if let Ok(checksum) = BackupRecord::compute_payload_checksum(&entries) {
                    obj.insert("payload_checksum".to_string(), serde_json::json!(checksum));
                }
            }
        } else {
            obj.insert(
                "changes".to_string(),
                serde_json::json!([]),
            );
            obj.insert(
                "payload_checksum".to_string(),
                serde_json::json!(sha256_hex(b"[]")),
            );
        }

        let repaired_path = repaired_sibling(&point.on_disk_path);
        let pretty = match serde_json::to_string_pretty(&value) {
            Ok(p) => p,
            Err(_) => return false,
        };
        if std::fs::write(&repaired_path, pretty).is_err() {
            return false;
        }

        point.healthy = true;
        point.checksum_valid = true;
        point.on_disk_path = repaired_path;
        true
    }

    /// Scans for unhealthy points, attempts repair on a disposable copy of each, and
    /// classifies the resulting corruption picture.
    pub fn detect_corruption(&self) -> Result<CorruptionReport> {
        let points = self.scan_for_recovery_points()?;
        let total = points.len();
        let healthy_count = points.iter().filter(|p| p.healthy).count();
        let mut unhealthy = Vec::new();
        let mut repairable_files = Vec::new();
        let mut unrepairable_files = Vec::new();

        for point in points.into_iter().filter(|p| !p.healthy) {
            let mut copy = point.clone();
            if self.repair_point(&mut copy) {
                repairable_files.push(point.id.clone());
            } else {
                unrepairable_files.push(point.id.clone());
            }
            unhealthy.push(point);
        }

        let pct = if total == 0 {
            0.0
        } else {
            unhealthy.len() as f64 / total as f64 * 100.0
        };
        let severity = if pct == 0.0 {
            Severity::Low
        } else if pct < 10.0 {
            Severity::Low
        } else if pct < 30.0 {
            Severity::Medium
        } else if pct < 60.0 {
            Severity::High
        } else {
            Severity::Critical
        };

        let recommended_action = if !repairable_files.is_empty() && unrepairable_files.is_empty()
        {
            "auto-repair"
        } else if severity == Severity::Critical {
            "restore-previous"
        } else {
            "manual-recovery"
        }
        .to_string();

        Ok(CorruptionReport {
            total,
            healthy_count,
            unhealthy,
            repairable_files,
            unrepairable_files,
            severity,
            recommended_action,
        })
    }

    pub fn create_checkpoint(
        &self,
        data: &Node,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<RecoveryPoint> {
        std::fs::create_dir_all(&self.config.recovery_dir)?;

        let id = format!("checkpoint_{}", uuid::Uuid::new_v4());
        let timestamp = self.clock.now_millis();
        let full_json = serde_json::to_string(data)?;
        let entry = ChangeEntry {
            kind: ChangeKind::Add,
            path: BASELINE_FIELD.to_string(),
            value_checksum: Some(sha256_hex(full_json.as_bytes())),
            new_value: Some(to_json_value(data)),
        };
        let payload_checksum = BackupRecord::compute_payload_checksum(std::slice::from_ref(&entry))?;

        let record = BackupRecord {
            id: id.clone(),
            session_id: String::new(),
            parent_id: None,
            timestamp,
            kind: BackupKind::Checkpoint,
            changes: ChangesPayload::Plain(vec![entry]),
            metadata: BackupMetadata {
                schema_version: 1,
                compressed: false,
                total_changes: 1,
                change_percentage: 100.0,
                original_size: full_json.len() as u64,
                compressed_size: None,
            },
            payload_checksum,
            on_disk_path: None,
        };

        if let Some(meta) = &metadata {
            debug!(id = %record.id, metadata = %meta, "checkpoint metadata supplied");
        }

        let filename = format!("checkpoint-{id}-{timestamp}.json");
        let path = self.config.recovery_dir.join(filename);
        let body = serde_json::to_string_pretty(&record)?;
        std::fs::write(&path, body)?;

        info!(id = %record.id, description, "wrote recovery checkpoint");

        Ok(RecoveryPoint {
            id: record.id,
            timestamp: record.timestamp,
            kind: record.kind,
            session_id: Some(record.session_id),
            size_bytes: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            healthy: true,
            checksum_valid: true,
            on_disk_path: path,
            metadata: record.metadata,
        })
    }
}

fn matches_filters(point: &RecoveryPoint, options: &RecoveryOptions) -> bool {
    if let Some(session_id) = &options.session_id {
        if point.session_id.as_deref() != Some(session_id.as_str()) {
            return false;
        }
    }
    if let Some(project_id) = &options.project_id {
        if point.session_id.as_deref() != Some(project_id.as_str()) {
            return false;
        }
    }
    if let Some(target) = options.target_timestamp {
        if point.timestamp > target {
            return false;
        }
    }
    true
}

fn failure(errors: Vec<String>) -> RecoveryResult {
    for message in &errors {
        warn!(message = %message, "recovery attempt failed");
    }
    RecoveryResult {
        success: false,
        state: None,
        timestamp: None,
        recovery_point: None,
        errors,
        warnings: Vec::new(),
        metadata: RecoveryMetadata::default(),
    }
}

fn decode_single_entry_state(record: &BackupRecord) -> Result<Node> {
    let entries = record.changes.decode()?;
    let entry = entries
        .first()
        .ok_or_else(|| DurabilityError::Corrupt(format!("{} has no entries", record.id)))?;
    let raw = entry
        .new_value
        .clone()
        .ok_or_else(|| DurabilityError::Corrupt(format!("{} missing value", record.id)))?;

    let value = if record.metadata.compressed {
        let blob = raw
            .as_str()
            .ok_or_else(|| DurabilityError::Corrupt(format!("{} compressed value not a string", record.id)))?;
        let bytes = base64_then_gunzip(blob)?;
        let text = String::from_utf8(bytes).map_err(|e| DurabilityError::Corrupt(e.to_string()))?;
        serde_json::from_str(&text)?
    } else {
        raw
    };
    Ok(Node::from(value))
}

fn build_point(path: &std::path::Path) -> RecoveryPoint {
    let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let body = std::fs::read_to_string(path).ok();
    let parsed = body
        .as_ref()
        .and_then(|b| serde_json::from_str::<BackupRecord>(b).ok());

    match parsed {
        Some(record) => {
            let checksum_valid = record
                .changes
                .decode()
                .ok()
                .and_then(|decoded| BackupRecord::compute_payload_checksum(&decoded).ok())
                .map(|c| c == record.payload_checksum)
                .unwrap_or(false);
            RecoveryPoint {
                id: record.id,
                timestamp: record.timestamp,
                kind: record.kind,
                session_id: Some(record.session_id),
                size_bytes,
                healthy: checksum_valid,
                checksum_valid,
                on_disk_path: path.to_path_buf(),
                metadata: record.metadata,
            }
        }
        None => {
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            RecoveryPoint {
                id,
                timestamp: 0,
                kind: BackupKind::Baseline,
                session_id: None,
                size_bytes,
                healthy: false,
                checksum_valid: false,
                on_disk_path: path.to_path_buf(),
                metadata: BackupMetadata::default(),
            }
        }
    }
}

fn repaired_sibling(path: &std::path::Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("record");
    path.with_file_name(format!("{stem}-repaired.json"))
}

fn integrity_score(point: &RecoveryPoint, state: &Node) -> i64 {
    let mut score: i64 = 100;
    if point.id.is_empty() {
        score -= 10;
    }
    if point.timestamp == 0 {
        score -= 10;
    }
    if point.metadata.schema_version == 0 {
        score -= 5;
    }
    if let Some(Node::Array(sessions)) = get_path(state, "sessions") {
        if sessions
            .iter()
            .any(|s| !matches!(s, Node::Object(m) if m.contains_key("id")))
        {
            score -= 15;
        }
    }
    if let Some(Node::Array(errors)) = get_path(state, "errors") {
        if !errors.is_empty() {
            score -= 20;
        }
    }
    score.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupStore;
    use crate::change_detector::ChangeDetector;
    use crate::clock::ManualClock;
    use crate::config::IncrementalConfig;
    use crate::events::null_sink;
    use serde_json::json;
    use std::time::UNIX_EPOCH;
    use tempfile::tempdir;

    fn planner(store_root: &std::path::Path, recovery_dir: PathBuf) -> RecoveryPlanner {
        let store = Arc::new(BackupStore::new(store_root));
        let detector = Arc::new(ChangeDetector::new());
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH));
        let incremental = Arc::new(IncrementalBackupEngine::new(
            store,
            detector,
            IncrementalConfig::default(),
            clock.clone(),
        ));
        let config = RecoveryConfig {
            recovery_dir: recovery_dir.clone(),
            scan_roots: vec![store_root.to_path_buf(), recovery_dir],
        };
        RecoveryPlanner::new(incremental, config, clock, null_sink())
    }

    #[test]
    fn recovers_most_recent_healthy_point() {
        let dir = tempdir().unwrap();
        let store_root = dir.path().join("store");
        let recovery_dir = dir.path().join("recovery");
        let p = planner(&store_root, recovery_dir);

        p.incremental
            .create_incremental("s1", &Node::from(json!({"a": 1})), true)
            .unwrap();

        let result = p.recover_to_point(RecoveryOptions {
            session_id: Some("s1".to_string()),
            ..Default::default()
        });
        assert!(result.success);
        assert_eq!(result.state.unwrap(), Node::from(json!({"a": 1})));
    }

    #[test]
    fn skip_corrupted_picks_the_healthy_baseline() {
        let dir = tempdir().unwrap();
        let store_root = dir.path().join("store");
        let recovery_dir = dir.path().join("recovery");
        let p = planner(&store_root, recovery_dir);

        p.incremental
            .create_incremental("s1", &Node::from(json!({"a": 1})), true)
            .unwrap();

        std::fs::create_dir_all(store_root.join("s1")).unwrap();
        std::fs::write(store_root.join("s1").join("incremental_bad.json"), "{not json").unwrap();

        let report = p.detect_corruption().unwrap();
        assert_eq!(report.severity, Severity::High);

        let result = p.recover_to_point(RecoveryOptions {
            session_id: Some("s1".to_string()),
            skip_corrupted: true,
            attempt_auto_repair: true,
            ..Default::default()
        });
        assert!(result.success);
        assert_eq!(result.state.unwrap(), Node::from(json!({"a": 1})));
    }

    #[test]
    fn low_corruption_ratio_is_classified_low_severity() {
        let dir = tempdir().unwrap();
        let store_root = dir.path().join("store");
        let recovery_dir = dir.path().join("recovery");
        let p = planner(&store_root, recovery_dir);

        std::fs::create_dir_all(store_root.join("s1")).unwrap();
        for i in 0..19 {
            p.incremental
                .create_incremental("s1", &Node::from(json!({"a": i})), true)
                .unwrap();
        }
        std::fs::write(store_root.join("s1").join("incremental_bad.json"), "{not json").unwrap();

        let report = p.detect_corruption().unwrap();
        assert_eq!(report.total, 20);
        assert_eq!(report.severity, Severity::Low);
    }

    #[test]
    fn create_checkpoint_round_trips_through_recover() {
        let dir = tempdir().unwrap();
        let store_root = dir.path().join("store");
        let recovery_dir = dir.path().join("recovery");
        let p = planner(&store_root, recovery_dir);

        let point = p
            .create_checkpoint(&Node::from(json!({"x": 42})), "manual save", None)
            .unwrap();
        assert!(point.healthy);

        let result = p.recover_to_point(RecoveryOptions::default());
        assert!(result.success);
        assert_eq!(result.state.unwrap(), Node::from(json!({"x": 42})));
    }
}
