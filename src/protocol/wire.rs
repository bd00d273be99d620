//! Wire Format Types
//!
//! Serializable messages exchanged between the host and a plugin process,
//! and the conversions between them and the records in [`crate::dbplugin`].
//! Messages are encoded with bincode.
//!
//! The wire format has no integer type. Config values travel as a structured
//! value tree whose numbers are all `f64`; on receipt, integer-valued floats
//! are coerced back to `i64`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::dbplugin::{
    ChangeExpiration, ChangePassword, ChangePublicKey, ConfigMap, ConfigValue, CredentialType,
    DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse,
    Statements, UpdateUserRequest, UsernameMetadata,
};
use crate::protocol::status::Status;

/// Largest integer magnitude an `f64` represents exactly.
pub const MAX_SAFE_INTEGER: i64 = 1 << 53;

/// `0001-01-01T00:00:00Z`, the earliest timestamp the wire format accepts.
pub const MIN_TIMESTAMP_SECONDS: i64 = -62_135_596_800;

/// `10000-01-01T00:00:00Z`, exclusive upper bound.
pub const MAX_TIMESTAMP_SECONDS: i64 = 253_402_300_800;

// ============================================================================
// Structured Value Tree
// ============================================================================

/// One node of the structured value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Number(f64),
    String(String),
    Bool(bool),
    List(Vec<WireValue>),
    Struct(WireStruct),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireStruct {
    pub fields: BTreeMap<String, WireValue>,
}

pub fn encode_config(config: &ConfigMap) -> Result<WireStruct, Status> {
    let mut fields = BTreeMap::new();
    for (key, value) in config {
        let encoded = encode_value(value)
            .map_err(|reason| Status::invalid_argument(format!("config key {key:?}: {reason}")))?;
        fields.insert(key.clone(), encoded);
    }
    Ok(WireStruct { fields })
}

fn encode_value(value: &ConfigValue) -> Result<WireValue, String> {
    Ok(match value {
        ConfigValue::Null => WireValue::Null,
        ConfigValue::Bool(b) => WireValue::Bool(*b),
        ConfigValue::Int(i) => {
            if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                return Err(format!("integer {i} cannot be represented exactly"));
            }
            WireValue::Number(*i as f64)
        }
        ConfigValue::Float(f) => {
            if !f.is_finite() {
                return Err(format!("number {f} is not finite"));
            }
            WireValue::Number(*f)
        }
        ConfigValue::String(s) => WireValue::String(s.clone()),
        ConfigValue::List(items) => {
            WireValue::List(items.iter().map(encode_value).collect::<Result<_, _>>()?)
        }
        ConfigValue::Map(map) => {
            let mut fields = BTreeMap::new();
            for (k, v) in map {
                fields.insert(k.clone(), encode_value(v)?);
            }
            WireValue::Struct(WireStruct { fields })
        }
    })
}

/// Decode a config tree, coercing integer-valued numbers to `Int`.
pub fn decode_config(wire: WireStruct) -> ConfigMap {
    wire.fields
        .into_iter()
        .map(|(k, v)| (k, decode_value(v)))
        .collect()
}

fn decode_value(value: WireValue) -> ConfigValue {
    match value {
        WireValue::Null => ConfigValue::Null,
        WireValue::Bool(b) => ConfigValue::Bool(b),
        WireValue::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
                ConfigValue::Int(n as i64)
            } else {
                ConfigValue::Float(n)
            }
        }
        WireValue::String(s) => ConfigValue::String(s),
        WireValue::List(items) => ConfigValue::List(items.into_iter().map(decode_value).collect()),
        WireValue::Struct(s) => ConfigValue::Map(decode_config(s)),
    }
}

// ============================================================================
// Timestamps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

pub fn encode_timestamp(ts: &DateTime<Utc>) -> Result<WireTimestamp, Status> {
    let wire = WireTimestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    };
    check_timestamp(&wire)?;
    Ok(wire)
}

pub fn decode_timestamp(wire: &WireTimestamp) -> Result<DateTime<Utc>, Status> {
    check_timestamp(wire)?;
    DateTime::from_timestamp(wire.seconds, wire.nanos as u32)
        .ok_or_else(|| Status::invalid_argument(format!("invalid timestamp: {wire:?}")))
}

fn check_timestamp(ts: &WireTimestamp) -> Result<(), Status> {
    if ts.seconds < MIN_TIMESTAMP_SECONDS {
        return Err(Status::invalid_argument(format!(
            "timestamp: {ts:?} before 0001-01-01"
        )));
    }
    if ts.seconds >= MAX_TIMESTAMP_SECONDS {
        return Err(Status::invalid_argument(format!(
            "timestamp: {ts:?} after 10000-01-01"
        )));
    }
    if !(0..1_000_000_000).contains(&ts.nanos) {
        return Err(Status::invalid_argument(format!(
            "timestamp: {ts:?}: nanos not in range [0, 1e9)"
        )));
    }
    Ok(())
}

fn encode_optional_timestamp(ts: Option<&DateTime<Utc>>) -> Result<Option<WireTimestamp>, Status> {
    ts.map(encode_timestamp).transpose()
}

fn decode_optional_timestamp(ts: Option<&WireTimestamp>) -> Result<Option<DateTime<Utc>>, Status> {
    ts.map(decode_timestamp).transpose()
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireStatements {
    pub commands: Vec<String>,
}

impl From<&Statements> for WireStatements {
    fn from(s: &Statements) -> Self {
        Self {
            commands: s.commands.clone(),
        }
    }
}

impl From<Option<WireStatements>> for Statements {
    fn from(s: Option<WireStatements>) -> Self {
        Statements::new(s.map(|s| s.commands).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireInitializeRequest {
    pub config: WireStruct,
    pub verify_connection: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireInitializeResponse {
    pub config: WireStruct,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUsernameConfig {
    pub display_name: String,
    pub role_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireNewUserRequest {
    pub username_config: Option<WireUsernameConfig>,
    pub credential_type: i32,
    pub password: String,
    pub public_key: Vec<u8>,
    pub subject: String,
    pub expiration: Option<WireTimestamp>,
    pub statements: Option<WireStatements>,
    pub rollback_statements: Option<WireStatements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireNewUserResponse {
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireChangePassword {
    pub new_password: String,
    pub statements: Option<WireStatements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireChangePublicKey {
    pub new_public_key: Vec<u8>,
    pub statements: Option<WireStatements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireChangeExpiration {
    pub new_expiration: Option<WireTimestamp>,
    pub statements: Option<WireStatements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUpdateUserRequest {
    pub username: String,
    pub credential_type: i32,
    pub password: Option<WireChangePassword>,
    pub public_key: Option<WireChangePublicKey>,
    pub expiration: Option<WireChangeExpiration>,
    /// Empty when the password is not self-managed.
    pub self_managed_password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUpdateUserResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDeleteUserRequest {
    pub username: String,
    pub statements: Option<WireStatements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDeleteUserResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEmpty {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTypeResponse {
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMultiplexingSupportResponse {
    pub supported: bool,
}

/// Reply envelope of every RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    Ok(Vec<u8>),
    Err(Status),
}

// ============================================================================
// Record <-> Message Conversions
// ============================================================================

pub fn encode_initialize_request(req: &InitializeRequest) -> Result<WireInitializeRequest, Status> {
    Ok(WireInitializeRequest {
        config: encode_config(&req.config)?,
        verify_connection: req.verify_connection,
    })
}

pub fn decode_initialize_request(wire: WireInitializeRequest) -> InitializeRequest {
    InitializeRequest {
        config: decode_config(wire.config),
        verify_connection: wire.verify_connection,
    }
}

pub fn encode_initialize_response(
    resp: &InitializeResponse,
) -> Result<WireInitializeResponse, Status> {
    Ok(WireInitializeResponse {
        config: encode_config(&resp.config)?,
    })
}

pub fn decode_initialize_response(wire: WireInitializeResponse) -> InitializeResponse {
    InitializeResponse {
        config: decode_config(wire.config),
    }
}

pub fn encode_new_user_request(req: &NewUserRequest) -> Result<WireNewUserRequest, Status> {
    Ok(WireNewUserRequest {
        username_config: Some(WireUsernameConfig {
            display_name: req.username_config.display_name.clone(),
            role_name: req.username_config.role_name.clone(),
        }),
        credential_type: req.credential_type.as_i32(),
        password: req.password.clone(),
        public_key: req.public_key.clone(),
        subject: req.subject.clone(),
        expiration: encode_optional_timestamp(req.expiration.as_ref())?,
        statements: Some(WireStatements::from(&req.statements)),
        rollback_statements: Some(WireStatements::from(&req.rollback_statements)),
    })
}

pub fn decode_new_user_request(wire: WireNewUserRequest) -> Result<NewUserRequest, Status> {
    let username_config = wire
        .username_config
        .map(|u| UsernameMetadata {
            display_name: u.display_name,
            role_name: u.role_name,
        })
        .unwrap_or_default();
    Ok(NewUserRequest {
        username_config,
        credential_type: decode_credential_type(wire.credential_type)?,
        password: wire.password,
        public_key: wire.public_key,
        subject: wire.subject,
        expiration: decode_optional_timestamp(wire.expiration.as_ref())?,
        statements: wire.statements.into(),
        rollback_statements: wire.rollback_statements.into(),
    })
}

pub fn encode_new_user_response(resp: &NewUserResponse) -> WireNewUserResponse {
    WireNewUserResponse {
        username: resp.username.clone(),
    }
}

pub fn decode_new_user_response(wire: WireNewUserResponse) -> NewUserResponse {
    NewUserResponse {
        username: wire.username,
    }
}

pub fn encode_update_user_request(req: &UpdateUserRequest) -> Result<WireUpdateUserRequest, Status> {
    let expiration = match &req.expiration {
        Some(change) => Some(WireChangeExpiration {
            new_expiration: Some(encode_timestamp(&change.new_expiration)?),
            statements: Some(WireStatements::from(&change.statements)),
        }),
        None => None,
    };
    Ok(WireUpdateUserRequest {
        username: req.username.clone(),
        credential_type: req.credential_type.as_i32(),
        password: req.password.as_ref().map(|p| WireChangePassword {
            new_password: p.new_password.clone(),
            statements: Some(WireStatements::from(&p.statements)),
        }),
        public_key: req.public_key.as_ref().map(|k| WireChangePublicKey {
            new_public_key: k.new_public_key.clone(),
            statements: Some(WireStatements::from(&k.statements)),
        }),
        expiration,
        self_managed_password: req.self_managed_password.clone().unwrap_or_default(),
    })
}

pub fn decode_update_user_request(wire: WireUpdateUserRequest) -> Result<UpdateUserRequest, Status> {
    // A change whose timestamp is absent is no change at all.
    let expiration = match wire.expiration {
        Some(change) => match change.new_expiration {
            Some(ts) => Some(ChangeExpiration {
                new_expiration: decode_timestamp(&ts)?,
                statements: change.statements.into(),
            }),
            None => None,
        },
        None => None,
    };
    Ok(UpdateUserRequest {
        username: wire.username,
        credential_type: decode_credential_type(wire.credential_type)?,
        // Empty credentials are absent changes, same as a missing timestamp.
        password: wire
            .password
            .filter(|p| !p.new_password.is_empty())
            .map(|p| ChangePassword {
                new_password: p.new_password,
                statements: p.statements.into(),
            }),
        public_key: wire
            .public_key
            .filter(|k| !k.new_public_key.is_empty())
            .map(|k| ChangePublicKey {
                new_public_key: k.new_public_key,
                statements: k.statements.into(),
            }),
        expiration,
        self_managed_password: Some(wire.self_managed_password).filter(|p| !p.is_empty()),
    })
}

pub fn encode_delete_user_request(req: &DeleteUserRequest) -> WireDeleteUserRequest {
    WireDeleteUserRequest {
        username: req.username.clone(),
        statements: Some(WireStatements::from(&req.statements)),
    }
}

pub fn decode_delete_user_request(wire: WireDeleteUserRequest) -> DeleteUserRequest {
    DeleteUserRequest {
        username: wire.username,
        statements: wire.statements.into(),
    }
}

fn decode_credential_type(tag: i32) -> Result<CredentialType, Status> {
    CredentialType::from_i32(tag)
        .ok_or_else(|| Status::invalid_argument(format!("unsupported credential type: {tag}")))
}

// ============================================================================
// Framing
// ============================================================================

pub fn to_bytes<T: Serialize>(msg: &T) -> Result<Vec<u8>, Status> {
    bincode::serialize(msg).map_err(|e| Status::internal(format!("failed to encode message: {e}")))
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    bincode::deserialize(bytes)
        .map_err(|e| Status::invalid_argument(format!("failed to decode message: {e}")))
}
