//! Service protocol versions and the client-configuration era they imply.
//!
//! Releases before 4.1.0 read a legacy `.irodsEnv` file located through
//! `irodsEnvFile`/`irodsAuthFileName`. From 4.1.0 on, clients read
//! `irods_environment.json` located through `IRODS_ENVIRONMENT_FILE`/
//! `IRODS_AUTHENTICATION_FILE`.

use crate::codec::EnvFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("invalid version string: {0}")]
    Parse(String),
    #[error("unrecognized service version {0}: supported eras are 3.x-4.0.x (legacy) and 4.1.x+ below 5.0 (current)")]
    Unrecognized(ProtocolVersion),
    #[error("failed to read version file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid version file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("version file has no `irods_version` field")]
    MissingField,
}

/// A `major.minor.patch` service version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// First version that uses the structured client environment.
pub const ERA_BOUNDARY: ProtocolVersion = ProtocolVersion::new(4, 1, 0);

const OLDEST_SUPPORTED: ProtocolVersion = ProtocolVersion::new(3, 0, 0);
const FIRST_UNSUPPORTED: ProtocolVersion = ProtocolVersion::new(5, 0, 0);

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Client-configuration era for this version.
    pub fn era(&self) -> Result<VersionEra, VersionError> {
        if *self < OLDEST_SUPPORTED || *self >= FIRST_UNSUPPORTED {
            Err(VersionError::Unrecognized(*self))
        } else if *self < ERA_BOUNDARY {
            Ok(VersionEra::Legacy)
        } else {
            Ok(VersionEra::Current)
        }
    }

    /// Read `irods_version` from a service `VERSION.json` file.
    pub fn from_version_file(path: &Path) -> Result<Self, VersionError> {
        let content = std::fs::read_to_string(path)?;
        let json: serde_json::Value = serde_json::from_str(&content)?;
        json.get("irods_version")
            .and_then(serde_json::Value::as_str)
            .ok_or(VersionError::MissingField)?
            .parse()
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    /// Accepts `4.1.8`, `4.1` and the `rods4.1.8` form reported by the server.
    fn from_str(s: &str) -> Result<Self, VersionError> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("rods").unwrap_or(trimmed);
        let parts: Vec<&str> = digits.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(VersionError::Parse(s.to_string()));
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| VersionError::Parse(s.to_string()))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Client-configuration era.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionEra {
    Legacy,
    Current,
}

impl VersionEra {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
        }
    }

    /// Environment variable naming the environment document.
    pub fn environment_file_var(&self) -> &'static str {
        match self {
            Self::Legacy => "irodsEnvFile",
            Self::Current => "IRODS_ENVIRONMENT_FILE",
        }
    }

    /// Environment variable naming the authentication token file.
    pub fn authentication_file_var(&self) -> &'static str {
        match self {
            Self::Legacy => "irodsAuthFileName",
            Self::Current => "IRODS_AUTHENTICATION_FILE",
        }
    }

    pub fn environment_format(&self) -> EnvFormat {
        match self {
            Self::Legacy => EnvFormat::Legacy,
            Self::Current => EnvFormat::Structured,
        }
    }

    pub fn environment_file_name(&self) -> &'static str {
        match self {
            Self::Legacy => ".irodsEnv",
            Self::Current => "irods_environment.json",
        }
    }

    pub fn authentication_file_name(&self) -> &'static str {
        match self {
            Self::Legacy => ".irodsA",
            Self::Current => "irods_authentication",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_common_forms() {
        assert_eq!("4.1.8".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(4, 1, 8));
        assert_eq!("4.2".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(4, 2, 0));
        assert_eq!("rods4.0.3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(4, 0, 3));
        assert!("4.x".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
        assert!("".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn era_boundary_is_4_1_0() {
        assert_eq!(ProtocolVersion::new(4, 0, 3).era().unwrap(), VersionEra::Legacy);
        assert_eq!(ProtocolVersion::new(3, 3, 1).era().unwrap(), VersionEra::Legacy);
        assert_eq!(ProtocolVersion::new(4, 1, 0).era().unwrap(), VersionEra::Current);
        assert_eq!(ProtocolVersion::new(4, 3, 2).era().unwrap(), VersionEra::Current);
    }

    #[test]
    fn versions_outside_known_eras_are_rejected() {
        assert!(matches!(
            ProtocolVersion::new(2, 5, 0).era(),
            Err(VersionError::Unrecognized(_))
        ));
        assert!(matches!(
            ProtocolVersion::new(5, 0, 0).era(),
            Err(VersionError::Unrecognized(_))
        ));
    }

    #[test]
    fn eras_use_distinct_variable_pairs() {
        assert_eq!(VersionEra::Legacy.environment_file_var(), "irodsEnvFile");
        assert_eq!(VersionEra::Legacy.authentication_file_var(), "irodsAuthFileName");
        assert_eq!(VersionEra::Current.environment_file_var(), "IRODS_ENVIRONMENT_FILE");
        assert_eq!(
            VersionEra::Current.authentication_file_var(),
            "IRODS_AUTHENTICATION_FILE"
        );
        assert_eq!(VersionEra::Legacy.environment_format(), EnvFormat::Legacy);
        assert_eq!(VersionEra::Current.environment_format(), EnvFormat::Structured);
    }

    #[test]
    fn reads_version_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("VERSION.json");
        std::fs::write(&path, r#"{"irods_version": "4.1.9", "commit_id": "abc"}"#).unwrap();
        assert_eq!(
            ProtocolVersion::from_version_file(&path).unwrap(),
            ProtocolVersion::new(4, 1, 9)
        );

        std::fs::write(&path, r#"{"commit_id": "abc"}"#).unwrap();
        assert!(matches!(
            ProtocolVersion::from_version_file(&path),
            Err(VersionError::MissingField)
        ));
    }
}
