//! Environment handed from host to plugin.

use std::collections::HashMap;

/// Magic cookie key. A UX guard against running the binary by hand.
pub const MAGIC_COOKIE_KEY: &str = "VAULT_DATABASE_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "926a0820-aea2-be28-51d6-83cdf00e8edb";

/// Comma-separated application protocol versions the host accepts.
pub const PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";
pub const HOST_VERSION: &str = "VAULT_VERSION";
pub const METADATA_MODE: &str = "VAULT_PLUGIN_METADATA_MODE";
pub const AUTOMTLS_ENABLED: &str = "VAULT_PLUGIN_AUTOMTLS_ENABLED";
pub const MLOCK_ENABLED: &str = "VAULT_PLUGIN_MLOCK_ENABLED";
pub const UNWRAP_TOKEN: &str = "VAULT_UNWRAP_TOKEN";
/// CA trusted when redeeming the wrap token, for tests.
pub const TESTING_CA_PEM: &str = "VAULT_TESTING_PLUGIN_CA_PEM";
pub const HOST_ADDR: &str = "VAULT_ADDR";
/// CA certificate (PEM) that signed the host's client leaf, under auto-mTLS.
pub const CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";

/// Launch settings as the plugin sees them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnv {
    pub cookie: Option<String>,
    pub protocol_versions: Vec<u32>,
    pub host_version: Option<String>,
    pub metadata_mode: bool,
    pub automtls: bool,
    pub mlock: bool,
    pub unwrap_token: Option<String>,
    pub host_addr: Option<String>,
    pub testing_ca_pem: Option<String>,
    pub client_ca_pem: Option<String>,
}

impl PluginEnv {
    pub fn from_process() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let flag = |key: &str| non_empty(key).is_some_and(|v| parse_bool(&v));

        Self {
            cookie: lookup(MAGIC_COOKIE_KEY),
            protocol_versions: non_empty(PROTOCOL_VERSIONS)
                .map(|v| parse_versions(&v))
                .unwrap_or_default(),
            host_version: non_empty(HOST_VERSION),
            metadata_mode: flag(METADATA_MODE),
            automtls: flag(AUTOMTLS_ENABLED),
            mlock: flag(MLOCK_ENABLED),
            unwrap_token: non_empty(UNWRAP_TOKEN),
            host_addr: non_empty(HOST_ADDR),
            testing_ca_pem: non_empty(TESTING_CA_PEM),
            client_ca_pem: non_empty(CLIENT_CERT),
        }
    }

    pub fn cookie_matches(&self) -> bool {
        self.cookie.as_deref() == Some(MAGIC_COOKIE_VALUE)
    }

    /// Highest version both sides speak. A host that sends no list is
    /// assumed to speak only version 5.
    pub fn negotiate(&self, ours: &[u32]) -> Option<u32> {
        let theirs: &[u32] = if self.protocol_versions.is_empty() {
            &[super::PROTOCOL_VERSION_SINGLE]
        } else {
            &self.protocol_versions
        };
        ours.iter().copied().filter(|v| theirs.contains(v)).max()
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true")
}

fn parse_versions(v: &str) -> Vec<u32> {
    v.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

/// Base environment of a plugin launch. Callers add TLS and wrapping keys.
pub fn launch_env(host_version: &str, metadata_mode: bool, automtls: bool, mlock: bool) -> HashMap<String, String> {
    let versions = super::SUPPORTED_VERSIONS
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    HashMap::from([
        (MAGIC_COOKIE_KEY.to_string(), MAGIC_COOKIE_VALUE.to_string()),
        (PROTOCOL_VERSIONS.to_string(), versions),
        (HOST_VERSION.to_string(), host_version.to_string()),
        (METADATA_MODE.to_string(), metadata_mode.to_string()),
        (AUTOMTLS_ENABLED.to_string(), automtls.to_string()),
        (MLOCK_ENABLED.to_string(), mlock.to_string()),
    ])
}
