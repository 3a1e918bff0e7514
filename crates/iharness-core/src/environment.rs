//! Client environment documents.
//!
//! An environment document is the connection/configuration record an icommand
//! reads to find and authenticate against the service. Field names are the
//! structured (`irods_*`) names; see [`crate::codec`] for the on-disk formats.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default service port.
pub const DEFAULT_PORT: u16 = 1247;

/// Default target resource for new client environments.
pub const DEFAULT_RESOURCE: &str = "demoResc";

/// Structured field names used by the harness.
pub mod keys {
    pub const HOST: &str = "irods_host";
    pub const PORT: &str = "irods_port";
    pub const USER_NAME: &str = "irods_user_name";
    pub const ZONE_NAME: &str = "irods_zone_name";
    pub const HOME: &str = "irods_home";
    pub const CWD: &str = "irods_cwd";
    pub const DEFAULT_RESOURCE: &str = "irods_default_resource";
    pub const CLIENT_SERVER_POLICY: &str = "irods_client_server_policy";
    pub const CLIENT_SERVER_NEGOTIATION: &str = "irods_client_server_negotiation";
    pub const SSL_VERIFY_SERVER: &str = "irods_ssl_verify_server";
    pub const SSL_CA_CERTIFICATE_FILE: &str = "irods_ssl_ca_certificate_file";
    pub const AUTHENTICATION_SCHEME: &str = "irods_authentication_scheme";
}

/// Ordered map of structured field names to values.
///
/// Keys are kept sorted, so serialization is stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentDocument(Map<String, Value>);

/// Identity and connection parameters for a default client environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub user_name: String,
    pub host: String,
    pub zone_name: String,
    pub port: u16,
    pub default_resource: String,
    pub use_ssl: bool,
}

impl ClientProfile {
    pub fn new(
        user_name: impl Into<String>,
        host: impl Into<String>,
        zone_name: impl Into<String>,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            host: host.into(),
            zone_name: zone_name.into(),
            port: DEFAULT_PORT,
            default_resource: DEFAULT_RESOURCE.to_string(),
            use_ssl: false,
        }
    }
}

impl EnvironmentDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard client environment for a user.
    pub fn for_client(profile: &ClientProfile) -> Self {
        let home = format!("/{}/home/{}", profile.zone_name, profile.user_name);
        let mut doc = Self::new();
        doc.set(keys::HOST, profile.host.as_str());
        doc.set(keys::PORT, profile.port);
        doc.set(keys::DEFAULT_RESOURCE, profile.default_resource.as_str());
        doc.set(keys::HOME, home.as_str());
        doc.set(keys::CWD, home.as_str());
        doc.set(keys::USER_NAME, profile.user_name.as_str());
        doc.set(keys::ZONE_NAME, profile.zone_name.as_str());
        doc.set(keys::CLIENT_SERVER_NEGOTIATION, "request_server_negotiation");
        doc.set(keys::CLIENT_SERVER_POLICY, "CS_NEG_REFUSE");
        doc.set("irods_encryption_key_size", 32);
        doc.set("irods_encryption_salt_size", 8);
        doc.set("irods_encryption_num_hash_rounds", 16);
        doc.set("irods_encryption_algorithm", "AES-256-CBC");
        doc.set("irods_default_hash_scheme", "SHA256");
        doc.set("irods_maximum_size_for_single_buffer_in_megabytes", 32);
        doc.set("irods_default_number_of_transfer_threads", 4);
        doc.set("irods_maximum_number_of_transfer_threads", 64);
        doc.set(
            "irods_transfer_buffer_size_for_parallel_transfer_in_megabytes",
            4,
        );
        doc.set("irods_connection_pool_refresh_time_in_seconds", 300);

        if profile.use_ssl {
            doc.set(keys::CLIENT_SERVER_POLICY, "CS_NEG_REQUIRE");
            doc.set(keys::SSL_VERIFY_SERVER, "cert");
            doc.set(keys::SSL_CA_CERTIFICATE_FILE, "/etc/irods/server.crt");
        }
        doc
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Recursively merge `overrides` into this document.
    ///
    /// Nested objects are merged key by key; any other value replaces the
    /// existing one.
    pub fn merge(&mut self, overrides: &EnvironmentDocument) {
        merge_maps(&mut self.0, &overrides.0);
    }

    pub fn user_name(&self) -> Option<&str> {
        self.get_str(keys::USER_NAME)
    }

    pub fn zone_name(&self) -> Option<&str> {
        self.get_str(keys::ZONE_NAME)
    }

    pub fn host(&self) -> Option<&str> {
        self.get_str(keys::HOST)
    }

    pub fn port(&self) -> Option<i64> {
        self.get_i64(keys::PORT)
    }

    pub fn default_resource(&self) -> Option<&str> {
        self.get_str(keys::DEFAULT_RESOURCE)
    }
}

impl FromIterator<(String, Value)> for EnvironmentDocument {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn merge_maps(target: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_maps(existing, nested),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
