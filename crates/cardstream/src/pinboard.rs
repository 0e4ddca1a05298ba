//! Saved snippets keyed by the millisecond they were pinned.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

/// Key of a pinned entry: milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinKey(pub i64);

impl PinKey {
    fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// Next key after `last`: the current time, bumped when it would not
    /// sort after `last`.
    fn after(last: Option<PinKey>) -> Self {
        let now = Self::now();
        match last {
            Some(last) if now <= last => Self(last.0 + 1),
            _ => now,
        }
    }
}

impl std::fmt::Display for PinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while persisting pins.
#[derive(Debug, thiserror::Error)]
pub enum PinboardError {
    #[error("pinboard io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pinboard file {path} is not a valid pin map: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("pinboard lock poisoned")]
    Poisoned,
}

/// Store for pinned text.
pub trait Pinboard: Send + Sync {
    /// Pins `text` and returns its key. Keys are strictly increasing.
    fn pin(&self, text: &str) -> Result<PinKey, PinboardError>;

    /// All entries, oldest first.
    fn entries(&self) -> Result<Vec<(PinKey, String)>, PinboardError>;
}

/// In-memory pinboard.
#[derive(Debug, Default)]
pub struct MemoryPinboard {
    entries: Mutex<BTreeMap<PinKey, String>>,
}

impl MemoryPinboard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pinboard for MemoryPinboard {
    fn pin(&self, text: &str) -> Result<PinKey, PinboardError> {
        let mut entries = self.entries.lock().map_err(|_| PinboardError::Poisoned)?;
        let key = PinKey::after(entries.keys().next_back().copied());
        entries.insert(key, text.to_string());
        Ok(key)
    }

    fn entries(&self) -> Result<Vec<(PinKey, String)>, PinboardError> {
        let entries = self.entries.lock().map_err(|_| PinboardError::Poisoned)?;
        Ok(entries.iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

/// Pinboard stored as a JSON object `{ "<millis>": "<text>" }` on disk.
///
/// The file is read and rewritten on every pin.
#[derive(Debug)]
pub struct FilePinboard {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePinboard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<PinKey, String>, PinboardError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(PinboardError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw).map_err(|source| PinboardError::Format {
                path: self.path.clone(),
                source,
            })?;
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            let (Ok(millis), Some(text)) = (key.parse::<i64>(), value.as_str()) else {
                debug!(path = %self.path.display(), %key, "skipping malformed pin entry");
                continue;
            };
            entries.insert(PinKey(millis), text.to_string());
        }
        Ok(entries)
    }

    fn store(&self, entries: &BTreeMap<PinKey, String>) -> Result<(), PinboardError> {
        let map: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
            .collect();
        let raw = serde_json::to_string_pretty(&map).map_err(|source| PinboardError::Format {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PinboardError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, raw).map_err(|source| PinboardError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Pinboard for FilePinboard {
    fn pin(&self, text: &str) -> Result<PinKey, PinboardError> {
        let _guard = self.lock.lock().map_err(|_| PinboardError::Poisoned)?;
        let mut entries = self.load()?;
        let key = PinKey::after(entries.keys().next_back().copied());
        entries.insert(key, text.to_string());
        self.store(&entries)?;
        debug!(path = %self.path.display(), %key, "pinned entry");
        Ok(key)
    }

    fn entries(&self) -> Result<Vec<(PinKey, String)>, PinboardError> {
        let _guard = self.lock.lock().map_err(|_| PinboardError::Poisoned)?;
        Ok(self.load()?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_keys_strictly_increase() {
        let board = MemoryPinboard::new();
        let keys: Vec<PinKey> = (0..50)
            .map(|i| board.pin(&format!("entry {i}")).expect("pin"))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let entries = board.entries().expect("entries");
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].1, "entry 0");
    }

    #[test]
    fn file_pinboard_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("pins.json");
        let board = FilePinboard::new(&path);
        let first = board.pin("## A\n\nsummary").expect("pin");
        let second = board.pin("second").expect("pin");
        assert!(first < second);

        let reopened = FilePinboard::new(&path);
        let entries = reopened.entries().expect("entries");
        assert_eq!(
            entries,
            vec![(first, "## A\n\nsummary".to_string()), (second, "second".to_string())]
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw[first.to_string()], serde_json::json!("## A\n\nsummary"));
    }

    #[test]
    fn file_pinboard_rejects_non_object_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pins.json");
        std::fs::write(&path, "[1,2]").expect("write");
        let board = FilePinboard::new(&path);
        assert!(matches!(board.entries(), Err(PinboardError::Format { .. })));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let board = FilePinboard::new(dir.path().join("absent.json"));
        assert!(board.entries().expect("entries").is_empty());
    }
}
