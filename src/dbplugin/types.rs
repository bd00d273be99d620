//! Request and response records of the database plugin contract.
//!
//! These are the host-neutral shapes every adapter sees. The wire codec in
//! [`crate::protocol::wire`] maps them to and from the messages that travel
//! between the host and the plugin process.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Config Value
// ============================================================================

/// Adapter-defined configuration blob.
///
/// The core never imposes a schema on it; adapters validate their own keys.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Recursively typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(ConfigMap),
}

impl ConfigValue {
    /// Try to get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as i64. Integer-valued floats are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            ConfigValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

/// JSON numbers become `Int` when they fit in an i64 and `Float` otherwise.
impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::Null,
            serde_json::Value::Bool(b) => ConfigValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ConfigValue::String(s),
            serde_json::Value::Array(items) => {
                ConfigValue::List(items.into_iter().map(ConfigValue::from).collect())
            }
            serde_json::Value::Object(fields) => ConfigValue::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, ConfigValue::from(v)))
                    .collect(),
            ),
        }
    }
}

// ============================================================================
// Credential Types
// ============================================================================

/// Kind of credential a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    #[default]
    Password,
    RsaPrivateKey,
    ClientCertificate,
}

impl CredentialType {
    /// Numeric tag used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            CredentialType::Password => 0,
            CredentialType::RsaPrivateKey => 1,
            CredentialType::ClientCertificate => 2,
        }
    }

    pub fn from_i32(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(CredentialType::Password),
            1 => Some(CredentialType::RsaPrivateKey),
            2 => Some(CredentialType::ClientCertificate),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialType::Password => write!(f, "password"),
            CredentialType::RsaPrivateKey => write!(f, "rsa_private_key"),
            CredentialType::ClientCertificate => write!(f, "client_certificate"),
        }
    }
}

// ============================================================================
// Requests / Responses
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitializeRequest {
    pub config: ConfigMap,
    pub verify_connection: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitializeResponse {
    /// Canonicalised config the host persists.
    pub config: ConfigMap,
}

/// Metadata a username template is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameMetadata {
    pub display_name: String,
    pub role_name: String,
}

/// Adapter-interpreted commands. Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statements {
    pub commands: Vec<String>,
}

impl Statements {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewUserRequest {
    pub username_config: UsernameMetadata,
    pub credential_type: CredentialType,
    pub password: String,
    pub public_key: Vec<u8>,
    pub subject: String,
    pub statements: Statements,
    pub rollback_statements: Statements,
    /// Informational only; adapters never enforce it.
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUserResponse {
    /// The username the database actually accepted.
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePassword {
    pub new_password: String,
    pub statements: Statements,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePublicKey {
    pub new_public_key: Vec<u8>,
    pub statements: Statements,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeExpiration {
    pub new_expiration: DateTime<Utc>,
    pub statements: Statements,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateUserRequest {
    pub username: String,
    pub credential_type: CredentialType,
    pub password: Option<ChangePassword>,
    pub public_key: Option<ChangePublicKey>,
    pub expiration: Option<ChangeExpiration>,
    pub self_managed_password: Option<String>,
}

impl UpdateUserRequest {
    /// True when at least one credential or expiration change is present.
    pub fn has_changes(&self) -> bool {
        self.password
            .as_ref()
            .is_some_and(|p| !p.new_password.is_empty())
            || self
                .public_key
                .as_ref()
                .is_some_and(|k| !k.new_public_key.is_empty())
            || self.expiration.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteUserRequest {
    pub username: String,
    pub statements: Statements,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteUserResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_value_from_json() {
        let json = serde_json::json!({
            "host": "localhost",
            "port": 8086,
            "ratio": 0.5,
            "tls": true,
            "tags": ["a", "b"],
            "nested": { "x": null }
        });
        let value = ConfigValue::from(json);
        let ConfigValue::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map["host"], ConfigValue::String("localhost".to_string()));
        assert_eq!(map["port"], ConfigValue::Int(8086));
        assert_eq!(map["ratio"], ConfigValue::Float(0.5));
        assert_eq!(map["tls"], ConfigValue::Bool(true));
        assert!(matches!(&map["tags"], ConfigValue::List(items) if items.len() == 2));
    }

    #[test]
    fn test_config_value_as_i64_accepts_integral_float() {
        assert_eq!(ConfigValue::Float(8086.0).as_i64(), Some(8086));
        assert_eq!(ConfigValue::Float(1.5).as_i64(), None);
        assert_eq!(ConfigValue::String("1".to_string()).as_i64(), None);
    }

    #[test]
    fn test_credential_type_tags() {
        for ty in [
            CredentialType::Password,
            CredentialType::RsaPrivateKey,
            CredentialType::ClientCertificate,
        ] {
            assert_eq!(CredentialType::from_i32(ty.as_i32()), Some(ty));
        }
        assert_eq!(CredentialType::from_i32(7), None);
    }

    #[test]
    fn test_update_has_changes() {
        let mut req = UpdateUserRequest {
            username: "u".to_string(),
            ..Default::default()
        };
        assert!(!req.has_changes());

        req.password = Some(ChangePassword::default());
        assert!(!req.has_changes(), "empty password is not a change");

        req.password = Some(ChangePassword {
            new_password: "pw".to_string(),
            statements: Statements::default(),
        });
        assert!(req.has_changes());
    }
}
