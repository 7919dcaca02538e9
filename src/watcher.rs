use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use notify::{recommended_watcher, RecursiveMode, Watcher};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, warn};

pub type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Cross-process change bridge for local mode.
///
/// Watches the collections directory with a native file watcher and maps
/// changed files back to collection paths, so a write performed by another
/// process sharing the same store root flows into the same notification
/// routine as an in-process write.
pub struct CollectionWatcher {
    shutdown: Arc<AtomicBool>,
}

impl CollectionWatcher {
    pub fn spawn(collections_dir: PathBuf, on_change: ChangeCallback) -> crate::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = tokio_mpsc::channel::<String>(100);

        // Set up the native watcher up front so setup failures surface to
        // the caller instead of dying inside the thread.
        let (notify_tx, notify_rx) = mpsc::channel();
        let mut watcher = recommended_watcher(notify_tx)?;
        watcher.watch(&collections_dir, RecursiveMode::Recursive)?;

        // The notify watcher is synchronous; run it on its own thread and
        // bridge events into the async context.
        let thread_shutdown = shutdown.clone();
        let watch_root = collections_dir;
        std::thread::spawn(move || {
            // Keep the watcher alive for the lifetime of the bridge thread.
            let _watcher = watcher;

            loop {
                if thread_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match notify_rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(Ok(event)) => {
                        for file in &event.paths {
                            if let Some(path) = collection_path_for(&watch_root, file) {
                                if tx.blocking_send(path).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => warn!("collection watcher error: {}", e),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                debug!("external change detected on {}", path);
                on_change(&path);
            }
        });

        Ok(Self { shutdown })
    }
}

impl Drop for CollectionWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Map a changed file back to its collection path. Temp files from atomic
/// writes and anything that is not a `.json` collection file are ignored.
fn collection_path_for(collections_dir: &Path, file: &Path) -> Option<String> {
    if file.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let relative = file.strip_prefix(collections_dir).ok()?;
    let trimmed = relative.with_extension("");
    let segments: Vec<String> = trimmed
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() || segments.iter().any(|s| s.starts_with('.')) {
        return None;
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_path_mapping() {
        let root = Path::new("/data/collections");
        assert_eq!(
            collection_path_for(root, Path::new("/data/collections/missions.json")),
            Some("missions".to_string())
        );
        assert_eq!(
            collection_path_for(
                root,
                Path::new("/data/collections/chat/Licence_Year_1.json")
            ),
            Some("chat/Licence_Year_1".to_string())
        );
    }

    #[test]
    fn test_temp_and_foreign_files_ignored() {
        let root = Path::new("/data/collections");
        assert_eq!(
            collection_path_for(root, Path::new("/data/collections/.uplink.12345.tmp")),
            None
        );
        assert_eq!(
            collection_path_for(root, Path::new("/data/collections/notes.txt")),
            None
        );
        assert_eq!(
            collection_path_for(root, Path::new("/elsewhere/missions.json")),
            None
        );
    }
}
