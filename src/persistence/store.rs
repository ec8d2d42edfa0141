//! Durable storage of repository and pull request state.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/<label>/
//!   repository.json     # RepositoryRecord (tree-closed threshold)
//!   pulls/<n>.json      # one PullRequestState per open pull request
//!   retry_log.jsonl     # append-only audit of retry commands
//! ```
//!
//! State files are wrapped with a schema version and written atomically.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::effects::RetryRecord;
use crate::types::{PrNumber, PullRequestState, RepoLabel, RepositoryRecord};

use super::atomic::{append_line, write_atomic};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("schema version mismatch in {path}: expected {expected}, got {got}")]
    SchemaMismatch {
        path: PathBuf,
        expected: u32,
        got: u32,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where the bot keeps state between restarts.
pub trait StateStore: Send + Sync {
    fn load_repository(&self, label: &RepoLabel) -> Result<Option<RepositoryRecord>>;

    fn save_repository(&self, record: &RepositoryRecord) -> Result<()>;

    fn load_pulls(&self, label: &RepoLabel) -> Result<BTreeMap<PrNumber, PullRequestState>>;

    fn save_pull(&self, label: &RepoLabel, state: &PullRequestState) -> Result<()>;

    /// Forgets a pull request. Deleting one that was never saved is fine.
    fn delete_pull(&self, label: &RepoLabel, pr: PrNumber) -> Result<()>;

    fn append_retry(&self, label: &RepoLabel, record: &RetryRecord) -> Result<()>;

    fn retry_log(&self, label: &RepoLabel) -> Result<Vec<RetryRecord>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Versioned<T> {
    schema_version: u32,
    #[serde(flatten)]
    value: T,
}

/// JSON files under a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonFileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, label: &RepoLabel) -> PathBuf {
        self.root.join(label.as_str())
    }

    fn pulls_dir(&self, label: &RepoLabel) -> PathBuf {
        self.repo_dir(label).join("pulls")
    }

    fn pull_path(&self, label: &RepoLabel, pr: PrNumber) -> PathBuf {
        self.pulls_dir(label).join(format!("{}.json", pr.0))
    }

    fn repository_path(&self, label: &RepoLabel) -> PathBuf {
        self.repo_dir(label).join("repository.json")
    }

    fn retry_log_path(&self, label: &RepoLabel) -> PathBuf {
        self.repo_dir(label).join("retry_log.jsonl")
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    }
}

fn write_versioned<T: Serialize>(path: &Path, value: T) -> Result<()> {
    let wrapped = Versioned {
        schema_version: SCHEMA_VERSION,
        value,
    };
    let bytes = serde_json::to_vec_pretty(&wrapped).map_err(json_error(path))?;
    write_atomic(path, &bytes).map_err(io_error(path))
}

/// Reads a versioned file; `None` when it does not exist.
fn read_versioned<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    let wrapped: Versioned<T> = serde_json::from_slice(&bytes).map_err(json_error(path))?;
    if wrapped.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: SCHEMA_VERSION,
            got: wrapped.schema_version,
        });
    }
    Ok(Some(wrapped.value))
}

impl StateStore for JsonFileStore {
    fn load_repository(&self, label: &RepoLabel) -> Result<Option<RepositoryRecord>> {
        read_versioned(&self.repository_path(label))
    }

    fn save_repository(&self, record: &RepositoryRecord) -> Result<()> {
        write_versioned(&self.repository_path(&record.label), record)
    }

    fn load_pulls(&self, label: &RepoLabel) -> Result<BTreeMap<PrNumber, PullRequestState>> {
        let dir = self.pulls_dir(label);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut pulls = BTreeMap::new();
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            // Leftover temp files from an interrupted write
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = read_versioned::<PullRequestState>(&path)? {
                pulls.insert(state.number, state);
            }
        }
        Ok(pulls)
    }

    fn save_pull(&self, label: &RepoLabel, state: &PullRequestState) -> Result<()> {
        write_versioned(&self.pull_path(label, state.number), state)
    }

    fn delete_pull(&self, label: &RepoLabel, pr: PrNumber) -> Result<()> {
        let path = self.pull_path(label, pr);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn append_retry(&self, label: &RepoLabel, record: &RetryRecord) -> Result<()> {
        let path = self.retry_log_path(label);
        let line = serde_json::to_string(record).map_err(json_error(&path))?;
        append_line(&path, &line).map_err(io_error(&path))
    }

    fn retry_log(&self, label: &RepoLabel) -> Result<Vec<RetryRecord>> {
        let path = self.retry_log_path(label);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path)(e)),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<io::Result<_>>()
            .map_err(io_error(&path))?;
        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A crash mid-append leaves a torn final line
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "Ignoring torn retry log line");
                }
                Err(e) => return Err(json_error(&path)(e)),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_pr_number, arb_sha};
    use crate::types::{BuildState, RepoId, Sha};
    use chrono::Utc;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn label() -> RepoLabel {
        RepoLabel::new("widgets")
    }

    fn retry(number: u64) -> RetryRecord {
        RetryRecord {
            number,
            actor: "alice".into(),
            at: Utc::now(),
            source: None,
            body: "@bors retry".into(),
        }
    }

    #[test]
    fn empty_store_loads_nothing() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.load_repository(&label()).unwrap(), None);
        assert!(store.load_pulls(&label()).unwrap().is_empty());
        assert!(store.retry_log(&label()).unwrap().is_empty());
    }

    #[test]
    fn pulls_survive_a_reload() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut state = PullRequestState::new(PrNumber(5), Sha::new("a".repeat(40)));
        state.approved_by = "alice".into();
        state.build_state = BuildState::Pending;
        store.save_pull(&label(), &state).unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let pulls = reopened.load_pulls(&label()).unwrap();
        assert_eq!(pulls.get(&PrNumber(5)), Some(&state));
        assert!(dir.path().join("widgets/pulls/5.json").exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let state = PullRequestState::new(PrNumber(5), Sha::new("a".repeat(40)));
        store.save_pull(&label(), &state).unwrap();
        store.delete_pull(&label(), PrNumber(5)).unwrap();
        store.delete_pull(&label(), PrNumber(5)).unwrap();
        assert!(store.load_pulls(&label()).unwrap().is_empty());
    }

    #[test]
    fn repository_record_round_trips_tree_state() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut record = RepositoryRecord::new(label(), &RepoId::new("octo", "widgets"));
        record.set_treeclosed(50, Some("https://example.com/c/1".into()));
        store.save_repository(&record).unwrap();
        assert_eq!(store.load_repository(&label()).unwrap(), Some(record));
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let path = dir.path().join("widgets/repository.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"schema_version": 99, "label": "widgets", "owner": "o", "name": "n"}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load_repository(&label()),
            Err(StoreError::SchemaMismatch { got: 99, .. })
        ));
    }

    #[test]
    fn retry_log_appends_and_skips_torn_tail() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.append_retry(&label(), &retry(1)).unwrap();
        store.append_retry(&label(), &retry(2)).unwrap();

        let path = dir.path().join("widgets/retry_log.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"number\": 3, \"act");
        std::fs::write(&path, content).unwrap();

        let numbers: Vec<u64> = store.retry_log(&label()).unwrap().iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn temp_files_are_ignored_on_load() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let pulls = dir.path().join("widgets/pulls");
        std::fs::create_dir_all(&pulls).unwrap();
        std::fs::write(pulls.join("9.json.tmp"), "{garbage").unwrap();
        assert!(store.load_pulls(&label()).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn any_saved_pull_loads_back(number in arb_pr_number(), head in arb_sha(), priority in -100i64..100) {
            let dir = tempdir().unwrap();
            let store = JsonFileStore::new(dir.path());
            let mut state = PullRequestState::new(number, head);
            state.priority = priority;
            store.save_pull(&label(), &state).unwrap();
            prop_assert_eq!(store.load_pulls(&label()).unwrap().remove(&number), Some(state));
        }
    }
}
