//! Connection settings of the InfluxDB adapter.

use std::time::Duration;

use crate::dbplugin::{ConfigMap, ConfigValue, DatabaseError};

pub const DEFAULT_PORT: u16 = 8086;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub organization: String,
    pub username_template: Option<String>,
    pub tls: bool,
    pub insecure_tls: bool,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"[token]")
            .field("organization", &self.organization)
            .field("tls", &self.tls)
            .field("insecure_tls", &self.insecure_tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn from_map(config: &ConfigMap) -> Result<Self, DatabaseError> {
        Ok(Self {
            host: required_str(config, "host")?,
            port: port(config)?,
            token: required_str(config, "token")?,
            organization: required_str(config, "organization")?,
            username_template: optional_str(config, "username_template")?,
            tls: flag(config, "tls")?,
            insecure_tls: flag(config, "insecure_tls")?,
            connect_timeout: connect_timeout(config)?,
        })
    }

    /// The input map with every known key rewritten in canonical form.
    pub fn canonicalize(&self, input: &ConfigMap) -> ConfigMap {
        let mut out = input.clone();
        out.insert("host".to_string(), ConfigValue::from(self.host.as_str()));
        out.insert("port".to_string(), ConfigValue::Int(i64::from(self.port)));
        out.insert("token".to_string(), ConfigValue::from(self.token.as_str()));
        out.insert(
            "organization".to_string(),
            ConfigValue::from(self.organization.as_str()),
        );
        if let Some(template) = &self.username_template {
            out.insert(
                "username_template".to_string(),
                ConfigValue::from(template.as_str()),
            );
        }
        out.insert("tls".to_string(), ConfigValue::Bool(self.tls));
        out.insert("insecure_tls".to_string(), ConfigValue::Bool(self.insecure_tls));
        out.insert(
            "connect_timeout".to_string(),
            ConfigValue::String(format_duration(self.connect_timeout)),
        );
        out
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

fn invalid(key: &str, why: &str) -> DatabaseError {
    DatabaseError::invalid_argument(format!("invalid {key}: {why}"))
}

fn optional_str(config: &ConfigMap, key: &str) -> Result<Option<String>, DatabaseError> {
    match config.get(key) {
        None | Some(ConfigValue::Null) => Ok(None),
        Some(ConfigValue::String(s)) if s.is_empty() => Ok(None),
        Some(ConfigValue::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(key, "expected a string")),
    }
}

fn required_str(config: &ConfigMap, key: &str) -> Result<String, DatabaseError> {
    optional_str(config, key)?
        .ok_or_else(|| DatabaseError::invalid_argument(format!("{key} cannot be empty")))
}

/// Integer or numeric string; defaults to 8086.
fn port(config: &ConfigMap) -> Result<u16, DatabaseError> {
    let raw = match config.get("port") {
        None | Some(ConfigValue::Null) => return Ok(DEFAULT_PORT),
        Some(ConfigValue::String(s)) if s.trim().is_empty() => return Ok(DEFAULT_PORT),
        Some(ConfigValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid("port", &format!("{s:?} is not a number")))?,
        Some(other) => other
            .as_i64()
            .ok_or_else(|| invalid("port", "expected an integer"))?,
    };
    u16::try_from(raw)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid("port", &format!("{raw} is out of range")))
}

fn flag(config: &ConfigMap, key: &str) -> Result<bool, DatabaseError> {
    match config.get(key) {
        None | Some(ConfigValue::Null) => Ok(false),
        Some(ConfigValue::Bool(b)) => Ok(*b),
        Some(ConfigValue::String(s)) => s
            .parse::<bool>()
            .map_err(|_| invalid(key, &format!("{s:?} is not a boolean"))),
        Some(_) => Err(invalid(key, "expected a boolean")),
    }
}

/// Whole seconds, or a duration string such as `"5s"`, `"500ms"`, `"1m"`.
fn connect_timeout(config: &ConfigMap) -> Result<Duration, DatabaseError> {
    match config.get("connect_timeout") {
        None | Some(ConfigValue::Null) => Ok(DEFAULT_CONNECT_TIMEOUT),
        Some(ConfigValue::String(s)) => {
            parse_duration(s).ok_or_else(|| invalid("connect_timeout", &format!("{s:?}")))
        }
        Some(other) => other
            .as_i64()
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs)
            .ok_or_else(|| invalid("connect_timeout", "expected seconds")),
    }
}

pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(n.checked_mul(3600)?)),
        _ => None,
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
