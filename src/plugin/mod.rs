//! Plugin Processes
//!
//! Both sides of the process boundary: the plugin binary calls [`serve`] or
//! [`serve_multiplexed`], the host drives it through a [`PluginSupervisor`].
//!
//! # Bootstrap
//!
//! ```text
//! host                                     plugin
//!  | mint CA + client leaf                   |
//!  | spawn (env: cookie, versions, mTLS)  -> |
//!  |                                         | bind 127.0.0.1:0, TLS identity
//!  | <- stdout: 1|6|tcp|127.0.0.1:PORT|FP    |
//!  | pin FP, connect HTTP/2 + client cert -> |
//!  | MultiplexingSupport                  -> |
//! ```
//!
//! # Module Structure
//!
//! - `env` - environment variables shared by both sides
//! - `handshake` - the single stdout line
//! - `tls` - per-process certificate minting and rustls configs
//! - `wrapping` - wrap tokens carrying the plugin's TLS identity
//! - `serve` - plugin-side entry points
//! - `supervisor` - host-side process lifecycle and handle multiplexing

pub mod env;
pub mod handshake;
pub mod serve;
pub mod supervisor;
pub mod tls;
pub mod wrapping;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::dbplugin::DatabaseError;

pub use handshake::Handshake;
pub use serve::{serve, serve_multiplexed, ServeOptions};
pub use supervisor::{DatabaseHandle, PluginRunner, PluginSupervisor, SupervisorOptions};
pub use tls::{CertificateAuthority, Leaf, TlsMaterials};
pub use wrapping::{HttpUnwrapper, InMemoryWrapper, ResponseWrapper, Unwrapper};

/// Core protocol version announced in the handshake.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// One database per process.
pub const PROTOCOL_VERSION_SINGLE: u32 = 5;

/// Many databases per process, selected by multiplex id.
pub const PROTOCOL_VERSION_MULTIPLEXED: u32 = 6;

/// Application protocol versions this crate speaks, lowest first.
pub const SUPPORTED_VERSIONS: [u32; 2] = [PROTOCOL_VERSION_SINGLE, PROTOCOL_VERSION_MULTIPLEXED];

/// Errors from launching, handshaking with or serving a plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to start plugin {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin exited before completing the handshake")]
    ExitedBeforeHandshake,

    #[error("timed out after {0:?} waiting for the plugin handshake")]
    StartupTimeout(Duration),

    #[error("invalid handshake line {line:?}: {reason}")]
    Handshake { line: String, reason: String },

    #[error("unsupported plugin protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("plugin magic cookie missing or incorrect; this binary is a plugin and is not meant to be run directly")]
    MagicCookie,

    #[error("tls: {0}")]
    Tls(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Rcgen(#[from] rcgen::Error),

    #[error("wrapping: {0}")]
    Wrapping(String),

    #[error("server certificate fingerprint does not match the one issued to the plugin")]
    FingerprintMismatch,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
