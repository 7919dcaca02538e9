use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::record::{snapshot_fingerprint, Record};

pub type Callback = Arc<dyn Fn(&[Record]) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
    // Fingerprint of the last snapshot delivered to this subscriber. Lets a
    // change observed through two channels (post-write hook and the file
    // watcher echoing our own write) produce exactly one invocation.
    last_delivered: Option<[u8; 32]>,
}

#[derive(Default)]
struct PathChannel {
    subscribers: Mutex<Vec<Subscriber>>,
    // Held across callback invocation so every subscriber of a path sees
    // snapshots in a single monotonic order.
    delivery: Mutex<()>,
}

/// Subscriber bookkeeping shared by the facade and both adapters.
///
/// Every change channel (local post-write hook, cross-process file watcher,
/// remote event stream) converges on [`Registry::notify`], so same-process
/// and cross-process updates cannot diverge in behavior.
///
/// Callbacks run while the path's delivery lock is held; a callback must not
/// subscribe to its own path.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Arc<PathChannel>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channel(&self, path: &str) -> Arc<PathChannel> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(PathChannel::default()))
            .clone()
    }

    /// Register a subscription and deliver the current snapshot to it before
    /// returning, without racing a concurrent [`notify`] on the same path.
    /// Returns the subscription id used for [`unsubscribe`].
    pub fn subscribe<F>(&self, path: &str, callback: Callback, read_snapshot: F) -> u64
    where
        F: FnOnce() -> Vec<Record>,
    {
        let channel = self.channel(path);
        let _delivery = channel.delivery.lock().unwrap_or_else(|e| e.into_inner());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = read_snapshot();
        let fingerprint = snapshot_fingerprint(&snapshot);
        {
            let mut subscribers = channel
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscribers.push(Subscriber {
                id,
                callback: callback.clone(),
                last_delivered: Some(fingerprint),
            });
        }
        callback(&snapshot);
        id
    }

    pub fn unsubscribe(&self, path: &str, id: u64) {
        let channel = self.channel(path);
        let mut subscribers = channel
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| s.id != id);
    }

    pub fn has_subscribers(&self, path: &str) -> bool {
        let channel = self.channel(path);
        let subscribers = channel
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        !subscribers.is_empty()
    }

    /// Fan a fresh snapshot out to every subscriber of `path` that has not
    /// already seen it.
    pub fn notify(&self, path: &str, snapshot: &[Record]) {
        let channel = self.channel(path);
        let _delivery = channel.delivery.lock().unwrap_or_else(|e| e.into_inner());

        let fingerprint = snapshot_fingerprint(snapshot);
        let targets: Vec<Callback> = {
            let mut subscribers = channel
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter_mut()
                .filter(|s| s.last_delivered != Some(fingerprint))
                .map(|s| {
                    s.last_delivered = Some(fingerprint);
                    s.callback.clone()
                })
                .collect()
        };
        for callback in targets {
            callback(snapshot);
        }
    }
}
