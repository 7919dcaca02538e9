use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::record::{snapshot_from_map, validate_path, Record};
use crate::registry::Registry;
use crate::watcher::{ChangeCallback, CollectionWatcher};

const COLLECTIONS_DIR: &str = "collections";

/// Offline adapter: one JSON file per collection path under the store root,
/// each holding the id-keyed record map for that path.
pub struct LocalStore {
    inner: Arc<LocalInner>,
    write_delay: Duration,
    _watcher: CollectionWatcher,
}

struct LocalInner {
    collections_dir: PathBuf,
    registry: Arc<Registry>,
    // Serializes this instance's load-modify-write cycles so concurrent
    // in-process writers cannot drop each other's records. Writers in other
    // processes stay last-write-wins, as across tabs in a browser.
    write_lock: Mutex<()>,
}

impl LocalInner {
    fn file_for(&self, path: &str) -> PathBuf {
        let mut file = self.collections_dir.clone();
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                file.push(format!("{segment}.json"));
            } else {
                file.push(segment);
            }
        }
        file
    }

    /// Stored id → fields map for a path. Missing and corrupt files both
    /// read as empty; corruption must never surface as an error.
    fn load_map(&self, path: &str) -> BTreeMap<String, Value> {
        let file = self.file_for(path);
        match fs::read_to_string(&file) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn read(&self, path: &str) -> Vec<Record> {
        snapshot_from_map(self.load_map(path).iter())
    }

    fn store_map(&self, path: &str, map: &BTreeMap<String, Value>) -> crate::Result<()> {
        let file = self.file_for(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(map)?;
        atomic_write(&file, data.as_bytes())
    }

    /// Recompute the snapshot for a path and notify its subscribers. Both
    /// the in-process post-write hook and the cross-process watcher land
    /// here, so the two channels cannot diverge.
    fn refresh(&self, path: &str) {
        let snapshot = self.read(path);
        self.registry.notify(path, &snapshot);
    }
}

// Atomically write bytes to a file: write a temp file in the same directory
// and rename into place, so a reader never observes a half-written state.
fn atomic_write(path: &PathBuf, bytes: &[u8]) -> crate::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| crate::UplinkError::FileSystem("invalid path".to_string()))?;
    use rand::{thread_rng, Rng};
    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".uplink.{}.tmp", suffix));

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl LocalStore {
    pub fn open(
        root: impl Into<PathBuf>,
        write_delay: Duration,
        registry: Arc<Registry>,
    ) -> crate::Result<Self> {
        let collections_dir = root.into().join(COLLECTIONS_DIR);
        fs::create_dir_all(&collections_dir)?;

        let inner = Arc::new(LocalInner {
            collections_dir: collections_dir.clone(),
            registry,
            write_lock: Mutex::new(()),
        });
        let watcher_inner = inner.clone();
        let on_change: ChangeCallback = Arc::new(move |path: &str| watcher_inner.refresh(path));
        let watcher = CollectionWatcher::spawn(collections_dir, on_change)?;

        Ok(Self {
            inner,
            write_delay,
            _watcher: watcher,
        })
    }

    pub fn read(&self, path: &str) -> Vec<Record> {
        self.inner.read(path)
    }

    pub async fn append(&self, path: &str, fields: Map<String, Value>) -> crate::Result<String> {
        validate_path(path)?;
        // Optional simulated latency so saving affordances behave as they
        // would against the hosted database.
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let id = Record::fresh_id();
        let mut record = fields;
        // The store assigns ids; a caller-supplied one is dropped.
        record.remove("id");

        let _write = self.inner.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.inner.load_map(path);
        map.insert(id.clone(), Value::Object(record));
        self.inner.store_map(path, &map)?;
        debug!("appended {} to {}", id, path);

        self.inner.refresh(path);
        Ok(id)
    }

    pub async fn remove(&self, path: &str, id: &str) -> crate::Result<()> {
        validate_path(path)?;
        let _write = self.inner.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.inner.load_map(path);
        if map.remove(id).is_none() {
            // Deleting an absent record is a no-op, not an error.
            return Ok(());
        }
        self.inner.store_map(path, &map)?;
        debug!("removed {} from {}", id, path);

        self.inner.refresh(path);
        Ok(())
    }
}
