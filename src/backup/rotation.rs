// Rotation Engine (component D): classify backups into retention buckets, prune by
// policy, and enforce size/age ceilings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backup::{BackupRecord, BackupStore};
use crate::clock::Clock;
use crate::config::{RetentionClassPolicy, RotationConfig};
use crate::error::Result;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetentionClass {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl RetentionClass {
    fn classify(age_ms: u64) -> Self {
        if age_ms <= DAY_MS {
            RetentionClass::Hourly
        } else if age_ms <= 7 * DAY_MS {
            RetentionClass::Daily
        } else if age_ms <= 28 * DAY_MS {
            RetentionClass::Weekly
        } else {
            RetentionClass::Monthly
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RotationResult {
    pub deleted: Vec<String>,
    pub failures: Vec<(String, String)>,
    pub remaining: usize,
}

pub struct RotationEngine {
    store: Arc<BackupStore>,
    config: RwLock<RotationConfig>,
    clock: Arc<dyn Clock>,
}

impl RotationEngine {
    pub fn new(store: Arc<BackupStore>, config: RotationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            clock,
        }
    }

    pub fn policy(&self) -> RotationConfig {
        self.config.read().clone()
    }

    pub fn update_policy(&self, config: RotationConfig) {
        *self.config.write() = config;
    }

    /// Scans every record, classifies it into a retention bucket, and returns the
    /// records alongside a keep-set reflecting per-class retention only (no size or
    /// age ceiling applied yet).
    fn classify_and_select(&self) -> Result<(Vec<BackupRecord>, HashMap<(String, String), bool>)> {
        let now = self.clock.now_millis();
        let policy = self.config.read().clone();
        let mut scanned = self.store.scan_all()?;
        scanned.sort_by(|a, b| {
            let ta = a.1.as_ref().map(|r| r.timestamp).unwrap_or(0);
            let tb = b.1.as_ref().map(|r| r.timestamp).unwrap_or(0);
            tb.cmp(&ta)
        });

        let records: Vec<BackupRecord> = scanned
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .collect();

        let mut keep: HashMap<(String, String), bool> = HashMap::new();
        let mut by_class: HashMap<RetentionClass, Vec<&BackupRecord>> = HashMap::new();
        for record in &records {
            let age_ms = now.saturating_sub(record.timestamp);
            by_class
                .entry(RetentionClass::classify(age_ms))
                .or_default()
                .push(record);
        }

        if let Some(hourly) = by_class.get(&RetentionClass::Hourly) {
            self.keep_most_recent(hourly, &policy.hourly, &mut keep);
        }
        if let Some(daily) = by_class.get(&RetentionClass::Daily) {
            self.keep_grouped(daily, &policy.daily, group_by_day, &mut keep);
        }
        if let Some(weekly) = by_class.get(&RetentionClass::Weekly) {
            self.keep_grouped(weekly, &policy.weekly, group_by_week, &mut keep);
        }
        if let Some(monthly) = by_class.get(&RetentionClass::Monthly) {
            self.keep_grouped(monthly, &policy.monthly, group_by_month, &mut keep);
        }

        Ok((records, keep))
    }

    /// Applies the size and age ceilings on top of a per-class keep-set, returning the
    /// ids to delete and the total bytes that would remain after ceiling enforcement.
    fn apply_ceilings<'a>(
        &self,
        records: &'a [BackupRecord],
        keep: &HashMap<(String, String), bool>,
    ) -> (Vec<&'a BackupRecord>, u64) {
        let now = self.clock.now_millis();
        let policy = self.config.read().clone();

        let mut to_delete: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| !*keep.get(&(r.session_id.clone(), r.id.clone())).unwrap_or(&false))
            .collect();

        let max_total_bytes = policy.max_total_size_mb * 1024 * 1024;
        let mut surviving: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| *keep.get(&(r.session_id.clone(), r.id.clone())).unwrap_or(&false))
            .collect();
        let mut total_bytes: u64 = surviving
            .iter()
            .map(|r| r.metadata.compressed_size.unwrap_or(r.metadata.original_size))
            .sum();

        surviving.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut oldest_first = surviving.clone();
        while total_bytes > max_total_bytes {
            let Some(victim) = oldest_first.first().copied() else {
                break;
            };
            oldest_first.remove(0);
            total_bytes = total_bytes
                .saturating_sub(victim.metadata.compressed_size.unwrap_or(victim.metadata.original_size));
            to_delete.push(victim);
        }

        let max_age_ms = policy.max_age_days * DAY_MS;
        oldest_first.retain(|record| {
            if now.saturating_sub(record.timestamp) > max_age_ms {
                to_delete.push(*record);
                false
            } else {
                true
            }
        });
        total_bytes = oldest_first
            .iter()
            .map(|r| r.metadata.compressed_size.unwrap_or(r.metadata.original_size))
            .sum();

        (to_delete, total_bytes)
    }

    /// Runs a full rotation pass over every record in the store. Deletion failures for
    /// individual files are accumulated into the result rather than aborting the pass.
    pub fn perform_rotation(&self) -> Result<RotationResult> {
        let (records, keep) = self.classify_and_select()?;
        let (to_delete, _) = self.apply_ceilings(&records, &keep);

        let mut result = RotationResult::default();
        let mut seen = std::collections::HashSet::new();
        for record in to_delete {
            if !seen.insert((record.session_id.clone(), record.id.clone())) {
                continue;
            }
            match self.store.delete(&record.session_id, &record.id) {
                Ok(()) => result.deleted.push(record.id.clone()),
                Err(e) => result.failures.push((record.id.clone(), e.to_string())),
            }
        }

        result.remaining = records.len() - result.deleted.len();
        Ok(result)
    }

    /// Computes the total byte footprint that would remain after a rotation pass,
    /// without deleting anything. Used by callers that want to preview the effect of
    /// a policy change before applying it.
    pub fn estimate_post_rotation_usage(&self) -> Result<u64> {
        let (records, keep) = self.classify_and_select()?;
        let (_, remaining_bytes) = self.apply_ceilings(&records, &keep);
        Ok(remaining_bytes)
    }

    fn keep_most_recent<'a>(
        &self,
        records: &[&'a BackupRecord],
        policy: &RetentionClassPolicy,
        keep: &mut HashMap<(String, String), bool>,
    ) {
        if !policy.enabled {
            return;
        }
        let mut sorted: Vec<&&BackupRecord> = records.iter().collect();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        for record in sorted.into_iter().take(policy.retain_count) {
            keep.insert((record.session_id.clone(), record.id.clone()), true);
        }
    }

    fn keep_grouped(
        &self,
        records: &[&BackupRecord],
        policy: &RetentionClassPolicy,
        group_key: fn(u64) -> String,
        keep: &mut HashMap<(String, String), bool>,
    ) {
        if !policy.enabled {
            return;
        }
        let mut groups: HashMap<String, Vec<(String, String, u64)>> = HashMap::new();
        for record in records {
            groups.entry(group_key(record.timestamp)).or_default().push((
                record.session_id.clone(),
                record.id.clone(),
                record.timestamp,
            ));
        }

        let mut newest_per_group: Vec<(String, String, u64)> = groups
            .into_values()
            .filter_map(|mut members| {
                members.sort_by(|a, b| b.2.cmp(&a.2));
                members.into_iter().next()
            })
            .collect();
        newest_per_group.sort_by(|a, b| b.2.cmp(&a.2));

        for (session_id, id, _) in newest_per_group.into_iter().take(policy.retain_count) {
            keep.insert((session_id, id), true);
        }
    }
}

fn group_by_day(timestamp_ms: u64) -> String {
    (timestamp_ms / DAY_MS).to_string()
}

fn group_by_week(timestamp_ms: u64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms as i64) {
        Some(dt) => {
            let week = dt.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        None => (timestamp_ms / WEEK_MS).to_string(),
    }
}

fn group_by_month(timestamp_ms: u64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms as i64) {
        Some(dt) => format!("{}-{:02}", dt.year(), dt.month()),
        None => (timestamp_ms / (30 * DAY_MS)).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupKind, BackupMetadata, ChangeEntry, ChangeKind, ChangesPayload};
    use crate::clock::ManualClock;
    use std::time::UNIX_EPOCH;
    use tempfile::tempdir;

    fn record(id: &str, timestamp: u64) -> BackupRecord {
        let changes = vec![ChangeEntry::add_or_modify(
            ChangeKind::Add,
            "a".into(),
            serde_json::json!(1),
        )];
        let checksum = BackupRecord::compute_payload_checksum(&changes).unwrap();
        BackupRecord {
            id: id.to_string(),
            session_id: "s1".to_string(),
            parent_id: None,
            timestamp,
            kind: BackupKind::Baseline,
            changes: ChangesPayload::Plain(changes),
            metadata: BackupMetadata::default(),
            payload_checksum: checksum,
            on_disk_path: None,
        }
    }

    fn config_retain_hourly_only(n: usize) -> RotationConfig {
        RotationConfig {
            hourly: RetentionClassPolicy {
                enabled: true,
                retain_count: n,
            },
            daily: RetentionClassPolicy {
                enabled: false,
                retain_count: 0,
            },
            weekly: RetentionClassPolicy {
                enabled: false,
                retain_count: 0,
            },
            monthly: RetentionClassPolicy {
                enabled: false,
                retain_count: 0,
            },
            max_total_size_mb: u64::MAX / (1024 * 1024),
            max_age_days: u64::MAX / DAY_MS,
            interval_hours: 6,
        }
    }

    #[test]
    fn rotation_retains_at_most_policy_count() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BackupStore::new(dir.path()));
        let now = 1_000 * DAY_MS;
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + std::time::Duration::from_millis(now)));

        for i in 0..48u64 {
            let mut r = record(&format!("baseline_{i}"), now - i * 60_000);
            store.put(&mut r).unwrap();
        }

        let engine = RotationEngine::new(store.clone(), config_retain_hourly_only(24), clock);
        let result = engine.perform_rotation().unwrap();
        assert_eq!(result.deleted.len(), 24);
        let remaining = store.list_session("s1").unwrap();
        assert_eq!(remaining.len(), 24);
    }

    #[test]
    fn rotation_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BackupStore::new(dir.path()));
        let now = 1_000 * DAY_MS;
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + std::time::Duration::from_millis(now)));

        for i in 0..10u64 {
            let mut r = record(&format!("baseline_{i}"), now - i * 60_000);
            store.put(&mut r).unwrap();
        }

        let engine = RotationEngine::new(store, config_retain_hourly_only(24), clock);
        engine.perform_rotation().unwrap();
        let second = engine.perform_rotation().unwrap();
        assert_eq!(second.deleted.len(), 0);
    }

    #[test]
    fn update_policy_changes_future_estimates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BackupStore::new(dir.path()));
        let now = 1_000 * DAY_MS;
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + std::time::Duration::from_millis(now)));

        for i in 0..48u64 {
            let mut r = record(&format!("baseline_{i}"), now - i * 60_000);
            r.metadata.original_size = 1024;
            store.put(&mut r).unwrap();
        }

        let engine = RotationEngine::new(store, config_retain_hourly_only(48), clock);
        let before = engine.estimate_post_rotation_usage().unwrap();

        engine.update_policy(config_retain_hourly_only(10));
        let after = engine.estimate_post_rotation_usage().unwrap();
        assert!(after < before);
        assert_eq!(engine.policy().hourly.retain_count, 10);
    }

    #[test]
    fn group_by_week_aligns_to_iso_week_not_raw_duration() {
        // 2024-01-01T00:00:00Z (Monday, ISO week 1 of 2024) and a timestamp six days
        // later still inside that same ISO week must group together, while the next
        // Monday (ISO week 2) must not.
        let jan_1 = 1_704_067_200_000u64;
        let jan_6 = jan_1 + 5 * DAY_MS;
        let jan_8 = jan_1 + 7 * DAY_MS;

        assert_eq!(group_by_week(jan_1), group_by_week(jan_6));
        assert_ne!(group_by_week(jan_1), group_by_week(jan_8));
    }

    #[test]
    fn group_by_month_aligns_to_calendar_month_not_thirty_days() {
        // 2024-01-31T00:00:00Z and 2024-02-01T00:00:00Z are one day apart but belong
        // to different calendar months; raw 30-day bucketing would group them together.
        let jan_31 = 1_706_659_200_000u64;
        let feb_1 = jan_31 + DAY_MS;

        assert_ne!(group_by_month(jan_31), group_by_month(feb_1));
        assert_eq!(group_by_month(jan_31), group_by_month(jan_31 - 10 * DAY_MS));
    }
}
