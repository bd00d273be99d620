//! Database Plugin Protocol
//!
//! Everything that crosses the host/plugin process boundary.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |  Host                                                       |
//! |    DatabaseClient --(Transport)--+                          |
//! +----------------------------------|--------------------------+
//! |  HTTP/2 + mTLS, POST /rpc/<method>, bincode bodies          |
//! +----------------------------------|--------------------------+
//! |  Plugin                          v                          |
//! |    router -> DatabaseServer::dispatch -> Database adapter   |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Module Structure
//!
//! - `wire` - wire messages, config value tree, timestamps
//! - `status` - terminal RPC status codes
//! - `validate` - request preconditions shared by both stubs
//! - `transport` - HTTP/2 and in-process transports
//! - `client` - host-side stub
//! - `server` - plugin-side stub and router
//! - `shutdown` - process-exit signal

pub mod client;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod transport;
pub mod validate;
pub mod wire;

pub use client::DatabaseClient;
pub use server::{router, DatabaseFactory, DatabaseServer};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use status::{Code, Status};
pub use transport::{HttpTransport, LoopbackTransport, Metadata, Transport, MULTIPLEX_ID_HEADER};

/// RPC method names.
pub mod methods {
    pub const INITIALIZE: &str = "Database.Initialize";
    pub const NEW_USER: &str = "Database.NewUser";
    pub const UPDATE_USER: &str = "Database.UpdateUser";
    pub const DELETE_USER: &str = "Database.DeleteUser";
    pub const TYPE: &str = "Database.Type";
    pub const CLOSE: &str = "Database.Close";
    pub const MULTIPLEXING_SUPPORT: &str = "PluginMultiplexing.MultiplexingSupport";
}
