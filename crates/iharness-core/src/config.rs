//! Harness configuration.
//!
//! Uses the same key=value format as the service's shell tooling: one
//! `key=value` per line, `#` comments, optional single or double quotes.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::codec::strip_quotes;
use crate::environment::{DEFAULT_PORT, DEFAULT_RESOURCE};
use crate::version::{ProtocolVersion, VersionError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Settings shared by every session of a test run.
///
/// Passed explicitly to the session manager instead of being read from
/// process-wide globals.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    // Hosts and identity
    /// Host name that provisioned client sessions connect to.
    pub hostname: String,
    /// Catalog provider host used by the pre-existing admin session.
    pub icat_hostname: String,
    /// Zone override; read from the service account environment when unset.
    pub zone_name: Option<String>,
    /// Admin name override; read from the service account environment when unset.
    pub admin_name: Option<String>,
    pub admin_password: String,
    pub port: u16,
    pub default_resource: String,
    pub use_ssl: bool,

    // Service version
    pub service_version: String,
    /// `VERSION.json` of the installed service; takes priority over `service_version`.
    pub version_file: Option<PathBuf>,

    // Paths
    /// Server log file, or a log directory holding rotating `rodsLog*` files.
    pub server_log_path: PathBuf,
    /// Structured environment file of the service account.
    pub service_env_path: PathBuf,
    /// Directory searched first for icommands.
    pub icommands_dir: Option<PathBuf>,
    /// Parent directory for session scratch directories (system temp when unset).
    pub scratch_root: Option<PathBuf>,

    // Process control
    /// Grace period between terminate and kill, in milliseconds.
    pub terminate_grace_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            icat_hostname: "localhost".to_string(),
            zone_name: None,
            admin_name: None,
            admin_password: "rods".to_string(),
            port: DEFAULT_PORT,
            default_resource: DEFAULT_RESOURCE.to_string(),
            use_ssl: false,
            service_version: "4.1.0".to_string(),
            version_file: None,
            server_log_path: PathBuf::from("/var/lib/irods/iRODS/server/log"),
            service_env_path: dirs::home_dir().map_or_else(
                || PathBuf::from("~/.irods/irods_environment.json"),
                |h| h.join(".irods/irods_environment.json"),
            ),
            icommands_dir: None,
            scratch_root: None,
            terminate_grace_ms: 2000,
        }
    }
}

impl HarnessConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Values in `path` override the current ones.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'));
        for line in entries {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidLine(line.to_string()))?;
            self.apply_value(key.trim(), strip_quotes(value.trim(), &['"', '\'']))?;
        }
        Ok(())
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "hostname" => self.hostname = value.to_string(),
            "icat_hostname" => self.icat_hostname = value.to_string(),
            "zone_name" => self.zone_name = Self::optional_string(value),
            "admin_name" => self.admin_name = Self::optional_string(value),
            "admin_password" => self.admin_password = value.to_string(),
            "port" => self.port = Self::parse_int(key, value)?,
            "default_resource" => self.default_resource = value.to_string(),
            "use_ssl" => self.use_ssl = Self::parse_bool(key, value)?,
            "service_version" => self.service_version = value.to_string(),
            "version_file" => self.version_file = Self::optional_path(value),
            "server_log_path" => self.server_log_path = PathBuf::from(value),
            "service_env_path" => self.service_env_path = PathBuf::from(value),
            "icommands_dir" => self.icommands_dir = Self::optional_path(value),
            "scratch_root" => self.scratch_root = Self::optional_path(value),
            "terminate_grace_ms" => self.terminate_grace_ms = Self::parse_int(key, value)?,
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn optional_string(value: &str) -> Option<String> {
        (!value.is_empty()).then(|| value.to_string())
    }

    fn optional_path(value: &str) -> Option<PathBuf> {
        (!value.is_empty()).then(|| PathBuf::from(value))
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.server_log_path.is_relative() {
            self.server_log_path = base.join(&self.server_log_path);
        }
        if self.service_env_path.is_relative() {
            self.service_env_path = base.join(&self.service_env_path);
        }
        for path in [
            &mut self.version_file,
            &mut self.icommands_dir,
            &mut self.scratch_root,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// The service version, preferring the installed `VERSION.json`.
    pub fn protocol_version(&self) -> Result<ProtocolVersion, VersionError> {
        match &self.version_file {
            Some(path) => ProtocolVersion::from_version_file(path),
            None => self.service_version.parse(),
        }
    }

    pub fn terminate_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.terminate_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionEra;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = HarnessConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.admin_password, "rods");
        assert_eq!(config.port, 1247);
        assert_eq!(config.default_resource, "demoResc");
        assert!(!config.use_ssl);
        assert!(config.zone_name.is_none());
        assert!(config.icommands_dir.is_none());
        assert_eq!(config.terminate_grace_ms, 2000);
        assert_eq!(
            config.protocol_version().unwrap().era().unwrap(),
            VersionEra::Current
        );
    }

    #[test]
    fn parse_simple_config() {
        let mut config = HarnessConfig::default();
        let content = r#"
# test settings
hostname="client.example.org"
icat_hostname=icat.example.org
zone_name='tempZone'
use_ssl=yes
port=1250
service_version=4.0.3
terminate_grace_ms=500
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.hostname, "client.example.org");
        assert_eq!(config.icat_hostname, "icat.example.org");
        assert_eq!(config.zone_name.as_deref(), Some("tempZone"));
        assert!(config.use_ssl);
        assert_eq!(config.port, 1250);
        assert_eq!(
            config.protocol_version().unwrap().era().unwrap(),
            VersionEra::Legacy
        );
        assert_eq!(config.terminate_grace().as_millis(), 500);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = HarnessConfig::default();
        config.parse_content("federation_remote_zone=otherZone").unwrap();
        assert_eq!(config.hostname, "localhost");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = HarnessConfig::default();
        assert!(matches!(
            config.parse_content("use_ssl=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("port=99999"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("just a line"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn quoted_values_lose_one_layer_of_quotes() {
        let mut config = HarnessConfig::default();
        config
            .parse_content("hostname=\"icat.example.org\"\nadmin_password='\"secret\"'\ndefault_resource=demoResc")
            .unwrap();
        assert_eq!(config.hostname, "icat.example.org");
        assert_eq!(config.admin_password, "\"secret\"");
        assert_eq!(config.default_resource, "demoResc");
    }

    #[test]
    fn empty_optional_values_clear_the_setting() {
        let mut config = HarnessConfig::default();
        config.parse_content("icommands_dir=/opt/icommands").unwrap();
        assert_eq!(config.icommands_dir, Some(PathBuf::from("/opt/icommands")));
        config.parse_content("icommands_dir=").unwrap();
        assert!(config.icommands_dir.is_none());
    }

    #[test]
    fn version_file_takes_priority() {
        let dir = TempDir::new().unwrap();
        let version_path = dir.path().join("VERSION.json");
        std::fs::write(&version_path, r#"{"irods_version": "4.0.3"}"#).unwrap();

        let mut config = HarnessConfig {
            service_version: "4.2.0".to_string(),
            ..Default::default()
        };
        config.version_file = Some(version_path);

        assert_eq!(config.protocol_version().unwrap(), ProtocolVersion::new(4, 0, 3));
    }

    #[test]
    fn resolve_paths_anchors_relative_entries() {
        let mut config = HarnessConfig::default();
        config
            .parse_content("server_log_path=log/rodsLog\nscratch_root=tmp\nicommands_dir=/abs/bin")
            .unwrap();
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.server_log_path, PathBuf::from("/work/log/rodsLog"));
        assert_eq!(config.scratch_root, Some(PathBuf::from("/work/tmp")));
        assert_eq!(config.icommands_dir, Some(PathBuf::from("/abs/bin")));
    }

    #[test]
    fn from_file_reads_and_merges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("harness.conf");
        std::fs::write(&path, "admin_password=secret\n").unwrap();
        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.admin_password, "secret");
        assert_eq!(config.hostname, "localhost");
    }
}
