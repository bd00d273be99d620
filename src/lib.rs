//! # dbplugin
//!
//! Out-of-process database plugins for a dynamic-secrets host. A plugin
//! binary implements [`Database`] for one database engine; the host launches
//! it, talks to it over mutually-authenticated HTTP/2, and asks it to create,
//! rotate and revoke short-lived credentials.
//!
//! ## Layers
//!
//! ```text
//! host                                      plugin process
//! ----                                      --------------
//! PluginSupervisor                          serve / serve_multiplexed
//!   └─ DatabaseHandle                         └─ router
//!        └─ DatabaseClient ── HTTP/2+mTLS ──>      └─ DatabaseServer
//!                                                       └─ ErrorSanitizer
//!                                                            └─ Tracing
//!                                                                 └─ Metrics
//!                                                                      └─ adapter (InfluxDb)
//! ```
//!
//! ## Usage
//!
//! ### Writing a plugin
//! ```rust,ignore
//! use dbplugin::plugin::{serve_multiplexed, ServeOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = dbplugin::Config::load()?;
//!     serve_multiplexed(dbplugin::influxdb::new, ServeOptions::from_config(&config.plugin)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Driving a plugin from the host
//! ```rust,ignore
//! use dbplugin::plugin::{PluginRunner, PluginSupervisor, SupervisorOptions};
//! use dbplugin::Database;
//!
//! let supervisor = PluginSupervisor::new(
//!     PluginRunner::new("influxdb", "/usr/local/bin/influxdb-database-plugin"),
//!     SupervisorOptions::default(),
//! );
//! let db = supervisor.database("my-connection").await?;
//! db.initialize(request).await?;
//! supervisor.close("my-connection").await;
//! ```

pub mod config;
pub mod dbplugin;
pub mod identity;
pub mod influxdb;
pub mod logging;
pub mod middleware;
pub mod plugin;
pub mod protocol;
pub mod template;

pub use config::Config;
pub use dbplugin::{Database, DatabaseError, DatabaseResult};
pub use plugin::{PluginError, PluginSupervisor};
pub use template::UsernameTemplate;
