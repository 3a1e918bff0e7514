//! On-disk formats for environment documents.
//!
//! Two formats exist:
//! - legacy: flat `key value` lines (`.irodsEnv`), used before 4.1.0
//! - structured: a JSON object (`irods_environment.json`)
//!
//! A fixed table maps legacy keys to structured keys. Structured fields with no
//! legacy equivalent are dropped when encoding to the legacy format.

use crate::environment::EnvironmentDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid environment document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("environment document must be a JSON object")]
    NotAnObject,
    #[error("unknown environment format: {0}")]
    UnknownFormat(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Environment document representation on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvFormat {
    Legacy,
    Structured,
}

impl EnvFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Structured => "structured",
        }
    }
}

impl FromStr for EnvFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "structured" | "json" => Ok(Self::Structured),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

/// Legacy key to structured key. Order is the legacy encode order.
pub const LEGACY_KEY_MAP: &[(&str, &str)] = &[
    ("irodsUserName", "irods_user_name"),
    ("irodsHost", "irods_host"),
    ("irodsPort", "irods_port"),
    ("irodsHome", "irods_home"),
    ("irodsCwd", "irods_cwd"),
    ("irodsAuthScheme", "irods_authentication_scheme"),
    ("irodsDefResource", "irods_default_resource"),
    ("irodsZone", "irods_zone_name"),
    ("irodsServerDn", "irods_gsi_server_dn"),
    ("irodsLogLevel", "irods_log_level"),
    ("irodsAuthFileName", "irods_authentication_file"),
    ("irodsDebug", "irods_debug"),
    ("irodsClientServerPolicy", "irods_client_server_policy"),
    ("irodsClientServerNegotiation", "irods_client_server_negotiation"),
    ("irodsEncryptionKeySize", "irods_encryption_key_size"),
    ("irodsEncryptionSaltSize", "irods_encryption_salt_size"),
    ("irodsEncryptionNumHashRounds", "irods_encryption_num_hash_rounds"),
    ("irodsEncryptionAlgorithm", "irods_encryption_algorithm"),
    ("irodsDefaultHashScheme", "irods_default_hash_scheme"),
    ("irodsMatchHashPolicy", "irods_match_hash_policy"),
    ("irodsSSLVerifyServer", "irods_ssl_verify_server"),
    ("irodsSSLCACertificateFile", "irods_ssl_ca_certificate_file"),
    ("irodsSSLCACertificatePath", "irods_ssl_ca_certificate_path"),
    ("irodsProt", "irods_use_xml_protocol"),
    ("clientUserName", "irods_client_user_name"),
    ("clientRodsZone", "irods_client_zone_name"),
];

/// Structured fields decoded from legacy text as integers.
const INTEGER_FIELDS: &[&str] = &[
    "irods_port",
    "irods_encryption_key_size",
    "irods_encryption_salt_size",
    "irods_encryption_num_hash_rounds",
];

pub fn legacy_to_structured(legacy_key: &str) -> Option<&'static str> {
    LEGACY_KEY_MAP
        .iter()
        .find(|(legacy, _)| *legacy == legacy_key)
        .map(|(_, structured)| *structured)
}

pub fn structured_to_legacy(structured_key: &str) -> Option<&'static str> {
    LEGACY_KEY_MAP
        .iter()
        .find(|(_, structured)| *structured == structured_key)
        .map(|(legacy, _)| *legacy)
}

/// Serialize a document in the given format.
pub fn encode(doc: &EnvironmentDocument, format: EnvFormat) -> Result<Vec<u8>> {
    match format {
        EnvFormat::Structured => Ok(serde_json::to_vec_pretty(doc)?),
        EnvFormat::Legacy => Ok(encode_legacy(doc).into_bytes()),
    }
}

/// Render the legacy `key value` text. Unmapped fields are dropped.
pub fn encode_legacy(doc: &EnvironmentDocument) -> String {
    let mut out = String::new();
    for (legacy, structured) in LEGACY_KEY_MAP {
        let Some(value) = doc.get(structured) else {
            continue;
        };
        let rendered = match value {
            Value::Null => continue,
            Value::String(s) => format!("'{s}'"),
            other => other.to_string(),
        };
        out.push_str(legacy);
        out.push(' ');
        out.push_str(&rendered);
        out.push('\n');
    }
    out
}

/// Parse legacy text.
///
/// Compatibility shim: lines that are blank, comments, unknown keys or lack a
/// value are skipped rather than rejected, and only the second token of a line
/// is used as the value.
pub fn decode_legacy_str(content: &str) -> EnvironmentDocument {
    let mut doc = EnvironmentDocument::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        let (Some(key), Some(raw)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if key.starts_with('#') {
            continue;
        }
        let Some(structured) = legacy_to_structured(key) else {
            tracing::debug!(key, "skipping unknown legacy environment key");
            continue;
        };
        let value = strip_quotes(raw, &['\'']);
        let value = if INTEGER_FIELDS.contains(&structured) {
            value
                .parse::<i64>()
                .map_or_else(|_| Value::from(value), Value::from)
        } else {
            Value::from(value)
        };
        doc.set(structured, value);
    }
    doc
}

/// Remove one layer of matching `quotes` around `value`.
pub(crate) fn strip_quotes<'a>(value: &'a str, quotes: &[char]) -> &'a str {
    quotes
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(value)
}

pub fn decode_legacy(path: &Path) -> Result<EnvironmentDocument> {
    let content = std::fs::read_to_string(path)?;
    Ok(decode_legacy_str(&content))
}

pub fn decode_structured_str(content: &str) -> Result<EnvironmentDocument> {
    match serde_json::from_str::<Value>(content)? {
        Value::Object(map) => Ok(EnvironmentDocument::from_map(map)),
        _ => Err(CodecError::NotAnObject),
    }
}

pub fn decode_structured(path: &Path) -> Result<EnvironmentDocument> {
    let content = std::fs::read_to_string(path)?;
    decode_structured_str(&content)
}

pub fn decode(path: &Path, format: EnvFormat) -> Result<EnvironmentDocument> {
    match format {
        EnvFormat::Legacy => decode_legacy(path),
        EnvFormat::Structured => decode_structured(path),
    }
}

/// Write a document atomically: a sibling temp file is written, then renamed
/// over `path`.
pub fn write_document(path: &Path, doc: &EnvironmentDocument, format: EnvFormat) -> Result<()> {
    let bytes = encode(doc, format)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ClientProfile;
    use serde_json::json;
    use tempfile::TempDir;

    fn four_field_doc() -> EnvironmentDocument {
        let mut doc = EnvironmentDocument::new();
        doc.set("irods_host", "h");
        doc.set("irods_port", 1247);
        doc.set("irods_user_name", "alice");
        doc.set("irods_zone_name", "z");
        doc
    }

    #[test]
    fn legacy_round_trip_of_four_fields() {
        let doc = four_field_doc();
        let text = encode(&doc, EnvFormat::Legacy).unwrap();
        let decoded = decode_legacy_str(std::str::from_utf8(&text).unwrap());
        assert_eq!(decoded, doc);
    }

    #[test]
    fn legacy_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".irodsEnv");
        let doc = four_field_doc();

        write_document(&path, &doc, EnvFormat::Legacy).unwrap();

        assert_eq!(decode_legacy(&path).unwrap(), doc);
    }

    #[test]
    fn structured_round_trip_keeps_every_field() {
        let mut doc = EnvironmentDocument::for_client(&ClientProfile::new("alice", "h", "z"));
        doc.set("irods_plugin_settings", json!({"nested": [1, 2, 3], "flag": true}));
        doc.set("irods_not_in_legacy_table", "kept");

        let bytes = encode(&doc, EnvFormat::Structured).unwrap();
        let decoded = decode_structured_str(std::str::from_utf8(&bytes).unwrap()).unwrap();

        assert_eq!(decoded, doc);
    }

    #[test]
    fn legacy_encode_drops_unmapped_fields() {
        let mut doc = four_field_doc();
        doc.set("irods_maximum_number_of_transfer_threads", 64);

        let text = encode_legacy(&doc);

        assert!(!text.contains("64"));
        assert_eq!(decode_legacy_str(&text), four_field_doc());
    }

    #[test]
    fn legacy_encode_is_stable_and_quotes_strings() {
        let text = encode_legacy(&four_field_doc());
        assert_eq!(
            text,
            "irodsUserName 'alice'\nirodsHost 'h'\nirodsPort 1247\nirodsZone 'z'\n"
        );
        assert_eq!(text, encode_legacy(&four_field_doc()));
    }

    #[test]
    fn legacy_decode_skips_garbage() {
        let content = "\
# comment line
irodsHost 'icat.example.org'

irodsPort
notAKey value
irodsZone tempZone trailing tokens
irodsPort 'abc'
";
        let doc = decode_legacy_str(content);
        assert_eq!(doc.host(), Some("icat.example.org"));
        assert_eq!(doc.zone_name(), Some("tempZone"));
        // Unparseable integers are kept as text rather than rejected.
        assert_eq!(doc.get("irods_port"), Some(&json!("abc")));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn legacy_decode_strips_only_one_layer_of_quotes() {
        let doc = decode_legacy_str("irodsDefResource ''resc''\nirodsHome '\n");
        assert_eq!(doc.default_resource(), Some("'resc'"));
        assert_eq!(doc.get_str("irods_home"), Some("'"));
    }

    #[test]
    fn decode_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = decode_legacy(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[test]
    fn structured_decode_rejects_non_objects() {
        assert!(matches!(
            decode_structured_str("[1, 2]"),
            Err(CodecError::NotAnObject)
        ));
    }

    #[test]
    fn mapping_table_is_bidirectional() {
        for (legacy, structured) in LEGACY_KEY_MAP {
            assert_eq!(legacy_to_structured(legacy), Some(*structured));
            assert_eq!(structured_to_legacy(structured), Some(*legacy));
        }
        assert_eq!(structured_to_legacy("irods_connection_pool_refresh_time_in_seconds"), None);
    }

    #[test]
    fn unknown_format_name_fails_fast() {
        assert_eq!("legacy".parse::<EnvFormat>().unwrap(), EnvFormat::Legacy);
        assert_eq!("json".parse::<EnvFormat>().unwrap(), EnvFormat::Structured);
        assert!(matches!(
            "yaml".parse::<EnvFormat>(),
            Err(CodecError::UnknownFormat(f)) if f == "yaml"
        ));
    }

    #[test]
    fn write_document_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("irods_environment.json");
        std::fs::write(&path, "stale").unwrap();

        write_document(&path, &four_field_doc(), EnvFormat::Structured).unwrap();

        assert_eq!(decode_structured(&path).unwrap(), four_field_doc());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
