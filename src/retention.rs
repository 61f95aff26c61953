//! Processed-message tracking with age-based pruning.
//!
//! The store is a JSON array of Gmail message ids, rewritten in full on every
//! mutation. Gmail ids embed a millisecond timestamp in their upper bits, so
//! the store prunes itself on load without keeping any timestamps of its own.
//! Recording an id after every terminal outcome — skip, new row, merge, or
//! failure — is what keeps repeated runs from reprocessing mail.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Age in days derived from the timestamp embedded in a Gmail message id.
///
/// The id is a hex number whose value shifted right 16 bits is milliseconds
/// since the epoch. Ids that do not parse as hex decode to age zero, so a
/// malformed id is never pruned on age grounds alone.
pub fn decode_age_days(id: &str, now_epoch_secs: f64) -> f64 {
    match u128::from_str_radix(id, 16) {
        Ok(value) => {
            let timestamp_secs = (value >> 16) as f64 / 1000.0;
            (now_epoch_secs - timestamp_secs) / SECONDS_PER_DAY
        }
        Err(_) => 0.0,
    }
}

/// The set of already-processed message ids, backed by a JSON file.
pub struct ProcessedStore {
    path: PathBuf,
    ids: HashSet<String>,
}

impl ProcessedStore {
    /// Load the store, pruning ids older than `retention_days`.
    ///
    /// A missing or unparsable file yields an empty store — the run proceeds
    /// and simply reprocesses recent mail. If pruning removed anything the
    /// pruned set is persisted back immediately.
    pub fn load(path: &Path, retention_days: u32) -> Self {
        let raw_ids: Vec<String> = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("processed-id file {} unparsable ({}); starting empty", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let now = chrono::Utc::now().timestamp() as f64;
        let before = raw_ids.len();
        let ids: HashSet<String> = raw_ids
            .into_iter()
            .filter(|id| decode_age_days(id, now) < retention_days as f64)
            .collect();

        let store = Self {
            path: path.to_path_buf(),
            ids,
        };

        if store.ids.len() != before {
            info!(
                "pruned {} processed ids older than {} days",
                before - store.ids.len(),
                retention_days
            );
            if let Err(e) = store.persist() {
                warn!("could not rewrite pruned id file: {}", e);
            }
        }

        store
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Add an id and synchronously rewrite the backing file.
    pub fn record(&mut self, id: &str) -> std::io::Result<()> {
        if self.ids.insert(id.to_string()) {
            debug!("recorded processed id {}", id);
        }
        self.persist()
    }

    fn persist(&self) -> std::io::Result<()> {
        let ids: Vec<&String> = self.ids.iter().collect();
        let json = serde_json::to_string(&ids)?;
        std::fs::write(&self.path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a hex id whose embedded timestamp is `age_days` before `now`.
    fn id_with_age(now_secs: f64, age_days: f64) -> String {
        let ts_ms = ((now_secs - age_days * SECONDS_PER_DAY) * 1000.0) as u128;
        format!("{:x}", ts_ms << 16)
    }

    #[test]
    fn test_decode_age_roundtrip() {
        let now = 1_750_000_000.0;
        let id = id_with_age(now, 3.0);
        let age = decode_age_days(&id, now);
        assert!((age - 3.0).abs() < 0.01, "age was {}", age);
    }

    #[test]
    fn test_decode_age_malformed_is_zero() {
        assert_eq!(decode_age_days("not-hex!", 1_750_000_000.0), 0.0);
        assert_eq!(decode_age_days("", 1_750_000_000.0), 0.0);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::load(&dir.path().join("absent.json"), 7);
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_unparsable_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{{{not json").unwrap();
        let store = ProcessedStore::load(&path, 7);
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_prunes_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        let now = chrono::Utc::now().timestamp() as f64;

        let fresh = id_with_age(now, 1.0);
        let stale = id_with_age(now, 30.0);
        std::fs::write(
            &path,
            serde_json::to_string(&vec![fresh.clone(), stale.clone()]).unwrap(),
        )
        .unwrap();

        let store = ProcessedStore::load(&path, 7);
        assert!(store.contains(&fresh));
        assert!(!store.contains(&stale));

        // The pruned set was written back.
        let on_disk: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![fresh]);
    }

    #[test]
    fn test_malformed_ids_survive_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        std::fs::write(&path, r#"["zzz-not-hex"]"#).unwrap();

        let store = ProcessedStore::load(&path, 7);
        assert!(store.contains("zzz-not-hex"));
    }

    #[test]
    fn test_record_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");

        let now = chrono::Utc::now().timestamp() as f64;
        let id = id_with_age(now, 0.5);

        let mut store = ProcessedStore::load(&path, 7);
        store.record(&id).unwrap();
        assert_eq!(store.len(), 1);

        let reloaded = ProcessedStore::load(&path, 7);
        assert!(reloaded.contains(&id));
    }
}
