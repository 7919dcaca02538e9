use std::fs;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::UplinkError;

/// Marker key for the share-link fragment: `…/#uplink=<base64 JSON>`.
pub const LINK_FRAGMENT_KEY: &str = "uplink=";

const CONFIG_FILE: &str = "connection.json";

/// Credentials for the hosted realtime database. The blob is treated as
/// opaque beyond the endpoint URL: whatever extra keys the service needs
/// (API keys, project ids) round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(
        rename = "databaseURL",
        alias = "database_url",
        skip_serializing_if = "Option::is_none"
    )]
    pub database_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionConfig {
    /// Optional auth token forwarded to the remote service on every request.
    pub fn auth_token(&self) -> Option<&str> {
        self.extra.get("auth").and_then(Value::as_str)
    }

    /// Endpoint of the hosted database. `Err` means this configuration
    /// cannot bring the store online; the online adapter applies exactly
    /// these checks at connect time.
    pub fn endpoint(&self) -> crate::Result<reqwest::Url> {
        let url = self
            .database_url
            .as_deref()
            .ok_or_else(|| UplinkError::Configuration("missing databaseURL".to_string()))?;
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| UplinkError::Configuration(format!("invalid databaseURL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(UplinkError::Configuration(format!(
                "unsupported databaseURL scheme: {}",
                parsed.scheme()
            )));
        }
        Ok(parsed)
    }
}

/// Resolves, persists and shares the connection configuration.
///
/// Resolution order: an inbound share-link fragment wins and is persisted so
/// the link does not need to be re-processed; otherwise previously persisted
/// configuration; otherwise nothing, which puts the store in local mode.
/// Saving or resetting takes effect on the next process start — mode never
/// hot-swaps mid-session.
pub struct ConfigManager {
    dir: PathBuf,
}

impl ConfigManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> PathBuf {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("uplink-store")
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("Library/Application Support/uplink-store")
        } else {
            // Linux and others
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share/uplink-store")
        }
    }

    fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Resolve the active configuration, importing an inbound share link
    /// first if one is given. `None` means local mode.
    pub fn resolve(&self, inbound_link: Option<&str>) -> Option<ConnectionConfig> {
        if let Some(link) = inbound_link {
            if let Some(config) = parse_link_fragment(link) {
                if let Err(e) = self.persist(&config) {
                    warn!("could not persist imported configuration: {}", e);
                }
                return Some(config);
            }
        }
        self.stored()
    }

    fn stored(&self) -> Option<ConnectionConfig> {
        let data = fs::read_to_string(self.config_file()).ok()?;
        match serde_json::from_str(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("stored connection configuration is corrupt: {}", e);
                None
            }
        }
    }

    fn persist(&self, config: &ConnectionConfig) -> crate::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_string_pretty(config)?;
        fs::write(self.config_file(), data)?;
        Ok(())
    }

    /// Parse and persist raw configuration text. Invalid JSON is reported
    /// without touching the persisted state.
    pub fn save(&self, raw: &str) -> crate::Result<()> {
        let config: ConnectionConfig = serde_json::from_str(raw).map_err(|e| {
            UplinkError::Configuration(format!("invalid configuration format: {}", e))
        })?;
        self.persist(&config)
    }

    /// Clear persisted configuration, reverting to local mode on the next
    /// start. Clearing when nothing is stored is fine.
    pub fn reset(&self) -> crate::Result<()> {
        match fs::remove_file(self.config_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Shareable link embedding the current configuration, or `None` in
    /// local mode. Note that the recipient gains the same read/write access
    /// these credentials carry.
    pub fn invite_link(&self, base_url: &str) -> crate::Result<Option<String>> {
        let Some(config) = self.stored() else {
            return Ok(None);
        };
        // A stored configuration that cannot bring the store online leaves
        // it in local mode too; sharing those credentials would hand the
        // recipient a broken link.
        if let Err(e) = config.endpoint() {
            warn!("not generating invite link: {}", e);
            return Ok(None);
        }
        let encoded = BASE64.encode(serde_json::to_string(&config)?);

        let mut base = base_url.to_string();
        if let Some(stripped) = base.strip_suffix("index.html") {
            base = stripped.to_string();
        }
        while base.ends_with('/') {
            base.pop();
        }

        Ok(Some(format!("{}/#{}{}", base, LINK_FRAGMENT_KEY, encoded)))
    }
}

/// Extract a configuration from a share link's `#uplink=` fragment.
/// Malformed fragments are warned about and ignored, never fatal.
pub fn parse_link_fragment(link: &str) -> Option<ConnectionConfig> {
    let fragment = link.split_once('#')?.1;
    let encoded = fragment.split_once(LINK_FRAGMENT_KEY)?.1;
    let decoded = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!("invalid uplink fragment encoding");
            return None;
        }
    };
    match serde_json::from_slice(&decoded) {
        Ok(config) => Some(config),
        Err(_) => {
            warn!("invalid uplink fragment contents");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_config() -> String {
        json!({
            "databaseURL": "https://test-sector.example.com",
            "apiKey": "AIza-test"
        })
        .to_string()
    }

    #[test]
    fn test_resolve_without_anything_is_local_mode() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert!(manager.resolve(None).is_none());
    }

    #[test]
    fn test_save_then_resolve() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        let config = manager.resolve(None).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("https://test-sector.example.com")
        );
        assert_eq!(config.extra["apiKey"], json!("AIza-test"));
    }

    #[test]
    fn test_save_invalid_json_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        let err = manager.save("{not valid json").unwrap_err();
        assert!(matches!(err, UplinkError::Configuration(_)));

        // Previous configuration survives the failed save.
        assert!(manager.resolve(None).is_some());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        manager.reset().unwrap();
        assert!(manager.resolve(None).is_none());
        manager.reset().unwrap();
    }

    #[test]
    fn test_invite_link_none_in_local_mode() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert!(manager
            .invite_link("https://portal.example.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invite_link_none_when_config_cannot_go_online() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());

        // Stored but unusable: no endpoint means the store stays local, so
        // there is nothing worth sharing.
        manager.save(&json!({"apiKey": "x"}).to_string()).unwrap();
        assert!(manager
            .invite_link("https://portal.example.com")
            .unwrap()
            .is_none());

        manager
            .save(&json!({"databaseURL": "not a url"}).to_string())
            .unwrap();
        assert!(manager
            .invite_link("https://portal.example.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invite_link_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        let link = manager
            .invite_link("https://portal.example.com/")
            .unwrap()
            .unwrap();
        assert!(link.starts_with("https://portal.example.com/#uplink="));

        let config = parse_link_fragment(&link).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("https://test-sector.example.com")
        );
    }

    #[test]
    fn test_invite_link_normalizes_index_html() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        let link = manager
            .invite_link("https://portal.example.com/app/index.html")
            .unwrap()
            .unwrap();
        assert!(link.starts_with("https://portal.example.com/app/#uplink="));
    }

    #[test]
    fn test_inbound_link_wins_and_is_persisted() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());

        let encoded = BASE64.encode(json!({"databaseURL": "https://shared.example.com"}).to_string());
        let link = format!("https://portal.example.com/#uplink={}", encoded);

        let config = manager.resolve(Some(&link)).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("https://shared.example.com")
        );

        // Re-processing is not needed: the import persisted.
        let config = manager.resolve(None).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("https://shared.example.com")
        );
    }

    #[test]
    fn test_malformed_fragment_falls_back_to_stored() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        manager.save(&sample_config()).unwrap();

        let config = manager
            .resolve(Some("https://portal.example.com/#uplink=%%%not-base64"))
            .unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("https://test-sector.example.com")
        );
    }

    #[test]
    fn test_link_without_fragment_is_ignored() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert!(manager
            .resolve(Some("https://portal.example.com/plain"))
            .is_none());
    }
}
