pub mod config;
pub mod error;
pub mod local;
pub mod record;
pub mod registry;
pub mod remote;
pub mod store;
pub mod watcher;

pub use config::{ConfigManager, ConnectionConfig};
pub use error::UplinkError;
pub use record::Record;
pub use store::{Mode, StoreOptions, Subscription, UplinkStore};

/// Re-export commonly used result type
pub type Result<T> = std::result::Result<T, UplinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_without_config_is_local_mode() {
        let tmp_dir = TempDir::new().unwrap();
        let store = UplinkStore::open(None, tmp_dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(store.mode(), Mode::Local);
        assert!(!store.is_online());
    }

    #[tokio::test]
    async fn test_config_manager_and_store_wire_together() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(tmp_dir.path());
        manager
            .save(&json!({"databaseURL": "https://db.example.com"}).to_string())
            .unwrap();

        let config = manager.resolve(None).unwrap();
        let store =
            UplinkStore::open(Some(config), tmp_dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(store.mode(), Mode::Remote);
        assert!(store.is_online());
    }
}
