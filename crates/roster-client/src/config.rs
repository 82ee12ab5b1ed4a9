//! Discovery client configuration
//!
//! Loaded from a file (format chosen by extension) overlaid with
//! `ROSTER_`-prefixed environment variables, e.g.
//! `ROSTER_BASE_PATH=/services` or `ROSTER_STORE__SESSION_TIMEOUT_MS=5000`.
//! A `.properties` file is read as flat `key=value` pairs, so a legacy
//! `zoo.properties` holding only `address=zk1:2181,zk2:2181` still works.

use std::path::Path;

use config::{Config, Environment, FileFormat};
use roster_api::{DEFAULT_BASE_PATH, path};
use roster_store::StoreConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};

const ENV_PREFIX: &str = "ROSTER";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Root under which services are registered
    pub base_path: String,
    pub store: StoreConfig,
    /// Comma separated connect string; replaces `store.addresses` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_string(),
            store: StoreConfig::default(),
            address: None,
        }
    }
}

impl DiscoveryConfig {
    /// Load from `path` and the process environment, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_prefix(path.as_ref(), ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, prefix: &str) -> Result<Self> {
        let file = match path.extension().and_then(|e| e.to_str()) {
            Some("properties") => config::File::new(&path.to_string_lossy(), FileFormat::Ini),
            _ => config::File::from(path),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("store.addresses"),
            )
            .build()?;

        let config: DiscoveryConfig = settings.try_deserialize()?;
        let config = config.normalized();
        config.validate()?;
        debug!(
            "Loaded discovery config from {}: base_path={}, store={}",
            path.display(),
            config.base_path,
            config.store.connect_string()
        );
        Ok(config)
    }

    /// Fold the legacy `address` key into `store.addresses`.
    pub fn normalized(mut self) -> Self {
        if let Some(address) = self.address.take() {
            self.store.addresses = StoreConfig::from_connect_string(&address).addresses;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        path::validate(&self.base_path)
            .map_err(|e| ClientError::Config(format!("base_path: {}", e)))?;
        self.store.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.base_path, "/services");
        assert_eq!(config.store.session_timeout_ms, 3000);
        assert_eq!(config.store.retry_count, 3);
        assert_eq!(config.store.retry_backoff_ms, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let file = write_file(
            ".yaml",
            "base_path: /registry\nstore:\n  addresses:\n    - zk1:2181\n    - zk2:2181\n  session_timeout_ms: 5000\n",
        );
        let config = DiscoveryConfig::load_with_prefix(file.path(), "ROSTER_TEST_YAML").unwrap();
        assert_eq!(config.base_path, "/registry");
        assert_eq!(config.store.addresses, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.store.session_timeout_ms, 5000);
        assert_eq!(config.store.retry_count, 3);
    }

    #[test]
    fn test_load_legacy_properties() {
        let file = write_file(".properties", "address=zk1:2181,zk2:2181\n");
        let config = DiscoveryConfig::load_with_prefix(file.path(), "ROSTER_TEST_PROPS").unwrap();
        assert_eq!(config.base_path, "/services");
        assert_eq!(config.store.addresses, vec!["zk1:2181", "zk2:2181"]);
        assert!(config.address.is_none());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_file(".toml", "base_path = \"/from-file\"\n");
        // SAFETY: the variables are unique to this test
        unsafe {
            std::env::set_var("ROSTER_TEST_ENV_BASE_PATH", "/from-env");
            std::env::set_var("ROSTER_TEST_ENV_STORE__RETRY_COUNT", "7");
        }
        let config = DiscoveryConfig::load_with_prefix(file.path(), "ROSTER_TEST_ENV").unwrap();
        assert_eq!(config.base_path, "/from-env");
        assert_eq!(config.store.retry_count, 7);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let file = write_file(".toml", "base_path = \"relative\"\n");
        let result = DiscoveryConfig::load_with_prefix(file.path(), "ROSTER_TEST_BAD");
        assert!(matches!(result, Err(ClientError::Config(_))));

        let file = write_file(".toml", "[store]\naddresses = [\"no-port\"]\n");
        let result = DiscoveryConfig::load_with_prefix(file.path(), "ROSTER_TEST_BAD");
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = DiscoveryConfig::load_with_prefix(Path::new("/nonexistent/roster.toml"), "ROSTER_TEST_MISSING");
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
