//! The handshake line a plugin prints on standard output once it listens:
//! `core-version|app-version|network|address|cert-fingerprint`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::{PluginError, CORE_PROTOCOL_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub network: String,
    pub addr: SocketAddr,
    /// Hex SHA-256 of the server certificate; empty for plaintext.
    pub fingerprint: String,
}

impl Handshake {
    pub fn tcp(app_version: u32, addr: SocketAddr, fingerprint: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network: "tcp".to_string(),
            addr,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn is_tls(&self) -> bool {
        !self.fingerprint.is_empty()
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.addr, self.fingerprint
        )
    }
}

impl FromStr for Handshake {
    type Err = PluginError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let bad = |reason: &str| PluginError::Handshake {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(bad("expected 5 pipe-separated fields"));
        }

        let core_version: u32 = parts[0].parse().map_err(|_| bad("bad core version"))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(bad("unsupported core protocol version"));
        }
        let app_version: u32 = parts[1].parse().map_err(|_| bad("bad protocol version"))?;
        if parts[2] != "tcp" {
            return Err(bad("unsupported network type"));
        }
        let addr: SocketAddr = parts[3].parse().map_err(|_| bad("bad address"))?;
        let fingerprint = parts[4].trim().to_ascii_lowercase();
        if !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad("fingerprint is not hex"));
        }

        Ok(Self {
            core_version,
            app_version,
            network: parts[2].to_string(),
            addr,
            fingerprint,
        })
    }
}
