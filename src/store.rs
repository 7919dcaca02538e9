use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::local::LocalStore;
use crate::record::{validate_path, Record};
use crate::registry::{Callback, Registry};
use crate::remote::RemoteStore;

/// Which adapter is live for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Remote,
    Local,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Simulated latency applied to local-mode writes so saving affordances
    /// get exercised without a network. Zero disables it.
    pub write_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            write_delay: Duration::ZERO,
        }
    }
}

enum Backend {
    Remote(RemoteStore),
    Local(LocalStore),
}

/// The collection store every feature component talks to. Callers address
/// collections by path and never learn whether the hosted database or local
/// durable storage is behind the call.
///
/// Mode is decided exactly once, at construction, and injected as immutable
/// state; changing the connection configuration takes effect on restart.
/// Must be constructed inside a tokio runtime.
pub struct UplinkStore {
    backend: Backend,
    registry: Arc<Registry>,
}

/// Handle returned by [`UplinkStore::subscribe`]. Dropping it, or calling
/// [`unsubscribe`](Subscription::unsubscribe), permanently stops callback
/// invocations for this subscription without affecting any other.
pub struct Subscription {
    registry: Arc<Registry>,
    path: String,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.unsubscribe(&self.path, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl UplinkStore {
    /// Open the store, attempting remote mode iff a configuration is given.
    /// A malformed or unusable configuration falls back to local mode and
    /// never fails construction; the only error source is local storage
    /// setup itself.
    pub fn open(
        config: Option<ConnectionConfig>,
        data_dir: impl Into<PathBuf>,
        options: StoreOptions,
    ) -> crate::Result<Self> {
        let registry = Registry::new();
        let data_dir = data_dir.into();

        let backend = match config {
            Some(config) => match RemoteStore::connect(&config, registry.clone()) {
                Ok(remote) => {
                    info!("uplink established, remote mode active");
                    Backend::Remote(remote)
                }
                Err(e) => {
                    warn!("connection failed, reverting to local mode: {}", e);
                    Backend::Local(LocalStore::open(
                        data_dir,
                        options.write_delay,
                        registry.clone(),
                    )?)
                }
            },
            None => {
                info!("simulation mode active, local storage only");
                Backend::Local(LocalStore::open(
                    data_dir,
                    options.write_delay,
                    registry.clone(),
                )?)
            }
        };

        Ok(Self { backend, registry })
    }

    pub fn mode(&self) -> Mode {
        match self.backend {
            Backend::Remote(_) => Mode::Remote,
            Backend::Local(_) => Mode::Local,
        }
    }

    pub fn is_online(&self) -> bool {
        self.mode() == Mode::Remote
    }

    /// Subscribe to a collection. The callback is invoked with the current
    /// known snapshot (possibly empty) before this returns, then once per
    /// observed change with the full updated snapshot.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> crate::Result<Subscription>
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        validate_path(path)?;
        let callback: Callback = Arc::new(callback);
        let id = match &self.backend {
            Backend::Remote(remote) => {
                remote.ensure_stream(path);
                self.registry
                    .subscribe(path, callback, || remote.read(path))
            }
            Backend::Local(local) => self.registry.subscribe(path, callback, || local.read(path)),
        };
        Ok(Subscription {
            registry: self.registry.clone(),
            path: path.to_string(),
            id: Some(id),
        })
    }

    /// Append a record. The store assigns the id; the returned future
    /// resolves only once the write is durable in the active adapter.
    pub async fn append(&self, path: &str, fields: Map<String, Value>) -> crate::Result<String> {
        match &self.backend {
            Backend::Remote(remote) => remote.append(path, fields).await,
            Backend::Local(local) => local.append(path, fields).await,
        }
    }

    /// Remove a record by id. Removing an absent id is a no-op.
    pub async fn remove(&self, path: &str, id: &str) -> crate::Result<()> {
        match &self.backend {
            Backend::Remote(remote) => remote.remove(path, id).await,
            Backend::Local(local) => local.remove(path, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn open_local(dir: &TempDir) -> UplinkStore {
        UplinkStore::open(None, dir.path(), StoreOptions::default()).unwrap()
    }

    struct Watched {
        snapshots: Arc<Mutex<Vec<Vec<Record>>>>,
        _subscription: Subscription,
    }

    impl Watched {
        fn new(store: &UplinkStore, path: &str) -> Self {
            let snapshots: Arc<Mutex<Vec<Vec<Record>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = snapshots.clone();
            let subscription = store
                .subscribe(path, move |records| {
                    sink.lock().unwrap().push(records.to_vec());
                })
                .unwrap();
            Self {
                snapshots,
                _subscription: subscription,
            }
        }

        fn latest(&self) -> Vec<Record> {
            self.snapshots.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.snapshots.lock().unwrap().len()
        }

        async fn wait_for(&self, expected_len: usize) -> Vec<Record> {
            for _ in 0..200 {
                {
                    let snapshots = self.snapshots.lock().unwrap();
                    if let Some(last) = snapshots.last() {
                        if last.len() == expected_len {
                            return last.clone();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("snapshot never reached {} records", expected_len);
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_empty_list() {
        let dir = TempDir::new().unwrap();
        let store = open_local(&dir);
        let watched = Watched::new(&store, "missions");
        assert_eq!(watched.count(), 1);
        assert!(watched.latest().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_remove_scenario() {
        let dir = TempDir::new().unwrap();
        let store = open_local(&dir);
        let watched = Watched::new(&store, "chat/L1");

        store
            .append("chat/L1", fields(json!({"text": "hello", "timestamp": 1000})))
            .await
            .unwrap();

        let snapshot = watched.latest();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].id.is_empty());
        assert_eq!(snapshot[0].fields["text"], json!("hello"));
        assert_eq!(snapshot[0].fields["timestamp"], json!(1000));

        store.remove("chat/L1", &snapshot[0].id).await.unwrap();
        assert!(watched.latest().is_empty());
    }

    #[tokio::test]
    async fn test_append_assigns_previously_unseen_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_local(&dir);

        let first = store
            .append("logs", fields(json!({"text": "one"})))
            .await
            .unwrap();
        let second = store
            .append("logs", fields(json!({"text": "two"})))
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_fanout_keeps_subscribers_set_equal() {
        let dir = TempDir::new().unwrap();
        let store = open_local(&dir);
        let first = Watched::new(&store, "faculty");
        let second = Watched::new(&store, "faculty");

        store
            .append("faculty", fields(json!({"name": "Dr. Kleiner"})))
            .await
            .unwrap();
        assert_eq!(first.latest(), second.latest());

        let id = first.latest()[0].id.clone();
        store.remove("faculty", &id).await.unwrap();
        assert_eq!(first.latest(), second.latest());
        assert!(first.latest().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_handle_stops_callbacks() {
        let dir = TempDir::new().unwrap();
        let store = open_local(&dir);
        let kept = Watched::new(&store, "logs");

        let dropped = Watched::new(&store, "logs");
        let dropped_snapshots = dropped.snapshots.clone();
        drop(dropped);

        store
            .append("logs", fields(json!({"text": "after"})))
            .await
            .unwrap();
        assert_eq!(kept.latest().len(), 1);
        // Only the initial snapshot reached the dropped subscription.
        assert_eq!(dropped_snapshots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_falls_back_to_local() {
        let dir = TempDir::new().unwrap();
        let config: ConnectionConfig =
            serde_json::from_value(json!({"databaseURL": "not a url at all"})).unwrap();
        let store =
            UplinkStore::open(Some(config), dir.path(), StoreOptions::default()).unwrap();

        assert_eq!(store.mode(), Mode::Local);
        assert!(!store.is_online());

        // The fallback store is fully operational.
        let watched = Watched::new(&store, "missions");
        store
            .append("missions", fields(json!({"objective": "survive"})))
            .await
            .unwrap();
        assert_eq!(watched.latest().len(), 1);
    }

    #[tokio::test]
    async fn test_config_without_url_falls_back_to_local() {
        let dir = TempDir::new().unwrap();
        let config: ConnectionConfig = serde_json::from_value(json!({"apiKey": "x"})).unwrap();
        let store =
            UplinkStore::open(Some(config), dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(store.mode(), Mode::Local);
    }

    #[tokio::test]
    async fn test_write_delay_preserves_async_contract() {
        let dir = TempDir::new().unwrap();
        let store = UplinkStore::open(
            None,
            dir.path(),
            StoreOptions {
                write_delay: Duration::from_millis(50),
            },
        )
        .unwrap();

        let started = std::time::Instant::now();
        store
            .append("logs", fields(json!({"text": "slow"})))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cross_instance_propagation_on_shared_root() {
        let dir = TempDir::new().unwrap();
        let writer = open_local(&dir);
        let reader = open_local(&dir);

        let watched = Watched::new(&reader, "chat/L1");
        assert!(watched.latest().is_empty());

        writer
            .append("chat/L1", fields(json!({"text": "hello", "timestamp": 1000})))
            .await
            .unwrap();

        // The second instance sees the write via the file watcher, without
        // any restart.
        let snapshot = watched.wait_for(1).await;
        assert_eq!(snapshot[0].fields["text"], json!("hello"));

        writer.remove("chat/L1", &snapshot[0].id).await.unwrap();
        watched.wait_for(0).await;
    }
}
