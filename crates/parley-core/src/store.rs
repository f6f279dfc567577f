//! Local key-value persistence with optional expiry.
//!
//! Holds the per-assistant transcript snapshot, the remaining trial uses, the
//! sticky-key label and the lifetime generation counter.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::transcript::Message;

/// Default store file name under the parley home directory.
pub const STORE_FILE: &str = "state.json";

pub mod keys {
    pub const TRIAL_REMAINING_USES: &str = "trial.remaining_uses";
    pub const TRIAL_KEY_LABEL: &str = "trial.key_label";
    pub const LIFETIME_GENERATIONS: &str = "stats.lifetime_generations";

    pub fn transcript(assistant: &str) -> String {
        format!("transcript.{assistant}")
    }
}

/// Key-value storage with optional per-entry time-to-live.
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`, expiring after `ttl` when given.
    ///
    /// # Errors
    /// Returns an error if the value cannot be persisted.
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key` if present.
    ///
    /// # Errors
    /// Returns an error if the removal cannot be persisted.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed helpers over any [`KvStore`].
pub trait KvStoreExt: KvStore {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!(key, error = %err, "Ignoring unreadable stored value");
                None
            }
        }
    }

    /// # Errors
    /// Returns an error if the value cannot be serialized or persisted.
    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize stored value for {key}"))?;
        self.set(key, value, None)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        Self { value, expires_at }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Entries = BTreeMap<String, StoredEntry>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store, used by tests and `--no-persist` style callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = lock(&self.entries);
        let entry = entries.get(key)?;
        (!entry.is_expired(Utc::now())).then(|| entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// JSON file store. Every mutation rewrites the file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file doesn't exist.
    ///
    /// Expired entries are dropped on load.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store from {}", path.display()))?;
            serde_json::from_str::<Entries>(&contents)
                .with_context(|| format!("Failed to parse store from {}", path.display()))?
        } else {
            Entries::new()
        };
        let now = Utc::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(entries).context("Failed to serialize store")?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write to {}", self.path.display()))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = lock(&self.entries);
        let entry = entries.get(key)?;
        (!entry.is_expired(Utc::now())).then(|| entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), StoredEntry::new(value, ttl));
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// How long a saved transcript survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionWindow {
    Hours(u32),
    Never,
}

impl Default for RetentionWindow {
    fn default() -> Self {
        RetentionWindow::Hours(24)
    }
}

impl RetentionWindow {
    /// Whether a snapshot taken at `saved_at` is still kept at `now`.
    pub fn keeps(self, saved_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RetentionWindow::Never => true,
            RetentionWindow::Hours(hours) => {
                now.signed_duration_since(saved_at) < chrono::Duration::hours(i64::from(hours))
            }
        }
    }
}

impl fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionWindow::Hours(hours) => write!(f, "{hours}h"),
            RetentionWindow::Never => write!(f, "never"),
        }
    }
}

impl Serialize for RetentionWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RetentionWindow::Hours(hours) => serializer.serialize_u32(*hours),
            RetentionWindow::Never => serializer.serialize_str("never"),
        }
    }
}

impl<'de> Deserialize<'de> for RetentionWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Hours(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Hours(hours) => Ok(RetentionWindow::Hours(hours)),
            Raw::Text(text) if text.trim().eq_ignore_ascii_case("never") => {
                Ok(RetentionWindow::Never)
            }
            Raw::Text(text) => text
                .trim()
                .parse::<u32>()
                .map(RetentionWindow::Hours)
                .map_err(|_| {
                    serde::de::Error::custom(format!(
                        "expected a number of hours or \"never\", got \"{text}\""
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub history: Vec<Message>,
    pub timestamp: DateTime<Utc>,
}

/// Saves `history` as the assistant's transcript snapshot.
///
/// # Errors
/// Returns an error if the snapshot cannot be persisted.
pub fn save_transcript(store: &dyn KvStore, assistant: &str, history: &[Message]) -> Result<()> {
    let snapshot = TranscriptSnapshot {
        history: history.to_vec(),
        timestamp: Utc::now(),
    };
    store.set_as(&keys::transcript(assistant), &snapshot)
}

/// Loads the assistant's transcript, discarding it when older than `retention`.
pub fn load_transcript(
    store: &dyn KvStore,
    assistant: &str,
    retention: RetentionWindow,
) -> Option<Vec<Message>> {
    load_transcript_at(store, assistant, retention, Utc::now())
}

fn load_transcript_at(
    store: &dyn KvStore,
    assistant: &str,
    retention: RetentionWindow,
    now: DateTime<Utc>,
) -> Option<Vec<Message>> {
    let key = keys::transcript(assistant);
    let snapshot: TranscriptSnapshot = store.get_as(&key)?;
    if retention.keeps(snapshot.timestamp, now) {
        return Some(snapshot.history);
    }

    tracing::info!(assistant, saved_at = %snapshot.timestamp, "Discarding expired transcript");
    if let Err(err) = store.remove(&key) {
        tracing::warn!(assistant, error = %err, "Failed to remove expired transcript");
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transcript::{MessageId, Role};

    fn history() -> Vec<Message> {
        vec![Message {
            id: MessageId(0),
            role: Role::User,
            content: "hello".to_string(),
            attachments: Vec::new(),
            streaming: false,
        }]
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(STORE_FILE);

        let store = FileStore::open(&path).unwrap();
        store.set_as(keys::TRIAL_REMAINING_USES, &3u32).unwrap();
        store.set(keys::TRIAL_KEY_LABEL, json!("pool-a"), None).unwrap();
        store.remove(keys::TRIAL_KEY_LABEL).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get_as::<u32>(keys::TRIAL_REMAINING_USES), Some(3));
        assert!(reopened.get(keys::TRIAL_KEY_LABEL).is_none());
    }

    #[test]
    fn expired_entries_are_hidden() {
        let store = MemoryStore::new();
        store
            .set("short", json!(1), Some(Duration::from_secs(0)))
            .unwrap();
        store
            .set("long", json!(2), Some(Duration::from_secs(3600)))
            .unwrap();

        assert!(store.get("short").is_none());
        assert_eq!(store.get("long"), Some(json!(2)));
    }

    #[test]
    fn unreadable_value_reads_as_none() {
        let store = MemoryStore::new();
        store.set("n", json!("not a number"), None).unwrap();
        assert_eq!(store.get_as::<u32>("n"), None);
    }

    #[test]
    fn transcript_snapshot_respects_retention() {
        let store = MemoryStore::new();
        save_transcript(&store, "writer", &history()).unwrap();

        let now = Utc::now();
        let restored =
            load_transcript_at(&store, "writer", RetentionWindow::Hours(1), now).unwrap();
        assert_eq!(restored, history());

        let later = now + chrono::Duration::hours(30);
        assert!(load_transcript_at(&store, "writer", RetentionWindow::Never, later).is_some());
        assert!(load_transcript_at(&store, "writer", RetentionWindow::Hours(24), later).is_none());
        // Expired snapshots are removed, not just hidden.
        assert!(store.get(&keys::transcript("writer")).is_none());
    }

    #[test]
    fn retention_window_parses_hours_or_never() {
        #[derive(Deserialize)]
        struct Wrapper {
            window: RetentionWindow,
        }

        let parse = |src: &str| toml::from_str::<Wrapper>(src).map(|w| w.window);
        assert_eq!(parse("window = 48").unwrap(), RetentionWindow::Hours(48));
        assert_eq!(parse("window = \"never\"").unwrap(), RetentionWindow::Never);
        assert_eq!(parse("window = \"12\"").unwrap(), RetentionWindow::Hours(12));
        assert!(parse("window = \"soon\"").is_err());
    }
}
