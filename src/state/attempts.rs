use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Persisted reimplementation-attempt counter, keyed by issue number.
///
/// Phases run as independent processes, so the counter lives on disk
/// (`<data_dir>/attempts.json`) rather than in memory. Writes use the same
/// atomic replace as the state store.
pub struct AttemptStore {
    path: PathBuf,
}

impl AttemptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_map(&self) -> HashMap<u64, u32> {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Corrupt attempts file, starting fresh"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    fn save_map(&self, map: &HashMap<u64, u32>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| AppError::State("attempts path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, map)?;
        tmp.persist(&self.path)
            .map_err(|e| AppError::State(format!("Failed to persist attempts file: {e}")))?;
        Ok(())
    }

    pub fn count(&self, issue_number: u64) -> u32 {
        self.load_map().get(&issue_number).copied().unwrap_or(0)
    }

    /// Whether another automatic reimplementation is allowed for this issue.
    pub fn is_allowed(&self, issue_number: u64, max_attempts: u32) -> bool {
        self.count(issue_number) < max_attempts
    }

    /// Increment and persist, returning the new count.
    pub fn increment(&self, issue_number: u64) -> Result<u32> {
        let mut map = self.load_map();
        let count = map.entry(issue_number).or_insert(0);
        *count += 1;
        let new_count = *count;
        self.save_map(&map)?;
        tracing::info!(issue = issue_number, attempts = new_count, "Incremented reimplementation attempts");
        Ok(new_count)
    }

    /// Reset the counter for an issue. Called on successful merge; a no-op
    /// if the issue has no recorded attempts.
    pub fn reset(&self, issue_number: u64) -> Result<()> {
        let mut map = self.load_map();
        if map.remove(&issue_number).is_some() {
            self.save_map(&map)?;
            tracing::info!(issue = issue_number, "Reset reimplementation attempts");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AttemptStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = AttemptStore::new(tmp.path().join("attempts.json"));
        (tmp, store)
    }

    #[test]
    fn test_count_defaults_to_zero() {
        let (_tmp, store) = store();
        assert_eq!(store.count(42), 0);
        assert!(store.is_allowed(42, 3));
    }

    #[test]
    fn test_increment_persists_across_instances() {
        let (tmp, store) = store();
        assert_eq!(store.increment(42).unwrap(), 1);
        assert_eq!(store.increment(42).unwrap(), 2);

        // A fresh instance (simulating a separate phase process) sees the count.
        let other = AttemptStore::new(tmp.path().join("attempts.json"));
        assert_eq!(other.count(42), 2);
    }

    #[test]
    fn test_cap_reached_blocks_further_attempts() {
        let (_tmp, store) = store();
        for _ in 0..3 {
            store.increment(7).unwrap();
        }
        assert!(!store.is_allowed(7, 3));
        // Other issues are unaffected.
        assert!(store.is_allowed(8, 3));
    }

    #[test]
    fn test_reset_on_merge() {
        let (_tmp, store) = store();
        store.increment(42).unwrap();
        store.increment(42).unwrap();
        store.reset(42).unwrap();
        assert_eq!(store.count(42), 0);
        assert!(store.is_allowed(42, 3));
    }

    #[test]
    fn test_reset_missing_is_noop() {
        let (_tmp, store) = store();
        assert!(store.reset(999).is_ok());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let (_tmp, store) = store();
        std::fs::write(&store.path, b"not json").unwrap();
        assert_eq!(store.count(1), 0);
        assert_eq!(store.increment(1).unwrap(), 1);
    }
}
