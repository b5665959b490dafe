use basalt_core::crypto::{BlsPublicKey, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors persisting or recovering the safety state.
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("Safety state I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Safety state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The two per-finalizer variables that prevent equivocation:
/// the highest height voted at, and the locked ancestor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRecord {
    pub v_height: u64,
    pub b_lock: Digest,
}

#[derive(Serialize, Deserialize)]
struct SafetyFileEntry {
    generation: u32,
    finalizer_key: BlsPublicKey,
    v_height: u64,
    b_lock: Digest,
}

/// Persistent safety variables, one record per (local finalizer key, policy
/// generation).
///
/// Losing this state risks equivocation, so every update is flushed with
/// write-to-temp, fsync, rename before the corresponding signed vote is
/// allowed to leave the process. A node restarted from the flushed file will
/// refuse to vote at or below any height it already voted at.
pub struct SafetyState {
    records: HashMap<(u32, BlsPublicKey), SafetyRecord>,
    path: Option<PathBuf>,
}

impl SafetyState {
    /// A state that is never persisted. For tests and non-finalizer nodes.
    pub fn in_memory() -> Self {
        Self { records: HashMap::new(), path: None }
    }

    /// Open the safety state backed by `path`. A missing file is a fresh
    /// state; a corrupt file is an error, because guessing here risks a
    /// double vote.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SafetyError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(SafetyError::Io { path, source }),
            Ok(bytes) => {
                let entries: Vec<SafetyFileEntry> = serde_json::from_slice(&bytes)
                    .map_err(|source| SafetyError::Corrupt { path: path.clone(), source })?;
                entries
                    .into_iter()
                    .map(|e| {
                        (
                            (e.generation, e.finalizer_key),
                            SafetyRecord { v_height: e.v_height, b_lock: e.b_lock },
                        )
                    })
                    .collect()
            }
        };
        Ok(Self { records, path: Some(path) })
    }

    /// Current record for a finalizer under a policy generation; zeroes if
    /// it has never voted.
    pub fn record(&self, generation: u32, key: &BlsPublicKey) -> SafetyRecord {
        self.records
            .get(&(generation, key.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Raise `v_height` to `height` (monotone; lower values are ignored).
    pub fn note_vote(&mut self, generation: u32, key: &BlsPublicKey, height: u64) {
        let record = self.records.entry((generation, key.clone())).or_default();
        record.v_height = record.v_height.max(height);
    }

    /// Move the locked ancestor.
    pub fn set_lock(&mut self, generation: u32, key: &BlsPublicKey, b_lock: Digest) {
        let record = self.records.entry((generation, key.clone())).or_default();
        record.b_lock = b_lock;
    }

    /// Flush atomically: serialize to a sibling temp file, fsync it, then
    /// rename over the real file and fsync the directory. Must complete
    /// before any vote covered by the update is released to the network.
    pub fn flush(&self) -> Result<(), SafetyError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut entries: Vec<SafetyFileEntry> = self
            .records
            .iter()
            .map(|((generation, key), record)| SafetyFileEntry {
                generation: *generation,
                finalizer_key: key.clone(),
                v_height: record.v_height,
                b_lock: record.b_lock,
            })
            .collect();
        // Deterministic file content regardless of map iteration order
        entries.sort_by(|a, b| {
            (a.generation, &a.finalizer_key).cmp(&(b.generation, &b.finalizer_key))
        });

        let json = serde_json::to_vec_pretty(&entries).expect("safety entries always serialize");

        let io_err = |source| SafetyError::Io { path: path.clone(), source };
        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
        drop(tmp);
        fs::rename(&tmp_path, path).map_err(io_err)?;
        sync_parent_dir(path).map_err(io_err)?;
        Ok(())
    }
}

// Make the rename itself durable. Without this a crash can lose the rename
// even though the temp file's data reached disk.
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::crypto::BlsPrivateKey;

    fn key(seed: u8) -> BlsPublicKey {
        BlsPrivateKey::generate(&[seed; 32]).unwrap().public_key()
    }

    #[test]
    fn test_fresh_record_is_zero() {
        let state = SafetyState::in_memory();
        let record = state.record(1, &key(1));
        assert_eq!(record.v_height, 0);
        assert!(record.b_lock.is_zero());
    }

    #[test]
    fn test_v_height_is_monotone() {
        let mut state = SafetyState::in_memory();
        let k = key(1);
        state.note_vote(1, &k, 100);
        state.note_vote(1, &k, 40);
        assert_eq!(state.record(1, &k).v_height, 100);
        state.note_vote(1, &k, 101);
        assert_eq!(state.record(1, &k).v_height, 101);
    }

    #[test]
    fn test_generations_are_independent() {
        let mut state = SafetyState::in_memory();
        let k = key(1);
        state.note_vote(1, &k, 100);
        assert_eq!(state.record(2, &k).v_height, 0);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.json");

        let mut state = SafetyState::load(&path).unwrap();
        let k = key(1);
        state.note_vote(1, &k, 100);
        state.set_lock(1, &k, Digest::hash(b"locked"));
        state.flush().unwrap();
        drop(state); // simulated crash: nothing beyond the flush survives

        let reloaded = SafetyState::load(&path).unwrap();
        let record = reloaded.record(1, &k);
        assert_eq!(record.v_height, 100);
        assert_eq!(record.b_lock, Digest::hash(b"locked"));
    }

    #[test]
    fn test_missing_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = SafetyState::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(state.record(1, &key(1)).v_height, 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.json");
        fs::write(&path, b"not json at all").unwrap();
        assert!(matches!(
            SafetyState::load(&path),
            Err(SafetyError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_flush_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.json");

        let mut state = SafetyState::load(&path).unwrap();
        state.note_vote(1, &key(1), 10);
        state.flush().unwrap();
        state.note_vote(1, &key(1), 20);
        state.note_vote(1, &key(2), 5);
        state.flush().unwrap();

        let reloaded = SafetyState::load(&path).unwrap();
        assert_eq!(reloaded.record(1, &key(1)).v_height, 20);
        assert_eq!(reloaded.record(1, &key(2)).v_height, 5);
    }
}
