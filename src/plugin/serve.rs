//! Plugin-side entry points.
//!
//! A plugin binary checks the magic cookie, negotiates a protocol version,
//! acquires a TLS identity, binds a loopback port and prints its handshake
//! line. It then serves RPCs until the host kills it.

use std::future::Future;
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rustls::ServerConfig;

use super::env::PluginEnv;
use super::handshake::Handshake;
use super::tls;
use super::wrapping::{unwrap_materials, HttpUnwrapper};
use super::{PluginError, SUPPORTED_VERSIONS};
use crate::config::PluginConfig;
use crate::dbplugin::{Database, DatabaseError};
use crate::protocol::{router, DatabaseServer};

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind_host: String,
    pub env: PluginEnv,
}

impl ServeOptions {
    /// Settings from `config`, launch environment from the process.
    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            bind_host: config.bind_host.clone(),
            env: PluginEnv::from_process(),
        }
    }

    pub fn with_env(mut self, env: PluginEnv) -> Self {
        self.env = env;
        self
    }
}

/// Serve one adapter for the life of the process.
pub async fn serve(db: Arc<dyn Database>, options: ServeOptions) -> Result<(), PluginError> {
    run(DatabaseServer::new(db), &options).await
}

/// Serve one adapter per multiplex id, each built by `factory`.
pub async fn serve_multiplexed<F>(factory: F, options: ServeOptions) -> Result<(), PluginError>
where
    F: Fn() -> Result<Arc<dyn Database>, DatabaseError> + Send + Sync + 'static,
{
    run(DatabaseServer::multiplexed(factory), &options).await
}

async fn run(server: DatabaseServer, options: &ServeOptions) -> Result<(), PluginError> {
    let bound = bind(server, options).await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", bound.handshake)?;
    stdout.flush()?;
    drop(stdout);

    bound
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

/// A plugin that is listening but not yet serving.
pub struct BoundPlugin {
    pub handshake: Handshake,
    listener: TcpListener,
    app: Router,
    tls: Option<ServerConfig>,
}

impl std::fmt::Debug for BoundPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPlugin")
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

/// Everything up to the handshake line.
pub async fn bind(server: DatabaseServer, options: &ServeOptions) -> Result<BoundPlugin, PluginError> {
    let env = &options.env;
    if !env.cookie_matches() {
        return Err(PluginError::MagicCookie);
    }
    let version = env.negotiate(&SUPPORTED_VERSIONS).ok_or_else(|| {
        PluginError::UnsupportedVersion(env.protocol_versions.iter().copied().max().unwrap_or(0))
    })?;
    if env.mlock {
        tracing::warn!("memory locking requested but not supported; continuing without it");
    }

    let (tls, fingerprint) = match server_identity(env).await? {
        Some((config, fingerprint)) => (Some(config), fingerprint),
        None => {
            if !env.metadata_mode {
                tracing::warn!("no TLS identity available; serving plaintext");
            }
            (None, String::new())
        }
    };

    let listener = TcpListener::bind((options.bind_host.as_str(), 0))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let server = server.with_metadata_mode(env.metadata_mode);
    tracing::info!(
        %addr,
        version,
        tls = tls.is_some(),
        multiplexed = server.is_multiplexed(),
        metadata_mode = env.metadata_mode,
        host_version = env.host_version.as_deref().unwrap_or(""),
        "plugin listening"
    );

    Ok(BoundPlugin {
        handshake: Handshake::tcp(version, addr, fingerprint),
        listener,
        app: router(Arc::new(server)),
        tls,
    })
}

/// TLS server config and its certificate fingerprint.
async fn server_identity(env: &PluginEnv) -> Result<Option<(ServerConfig, String)>, PluginError> {
    if env.automtls {
        let client_ca = env.client_ca_pem.as_deref().ok_or_else(|| {
            PluginError::Tls("auto-mTLS is enabled but no client CA was provided".to_string())
        })?;
        let leaf = tls::self_signed_leaf("dbplugin")?;
        let config = tls::server_config(&leaf.cert_pem, &leaf.key_pem, client_ca)?;
        return Ok(Some((config, leaf.fingerprint)));
    }

    if let Some(token) = env.unwrap_token.as_deref() {
        let unwrapper = HttpUnwrapper::from_env(env)?;
        let materials = unwrap_materials(&unwrapper, token).await?;
        let config = tls::server_config(&materials.cert_pem, &materials.key_pem, &materials.ca_pem)?;
        let fingerprint = tls::fingerprint_pem(&materials.cert_pem)?;
        return Ok(Some((config, fingerprint)));
    }

    Ok(None)
}

impl BoundPlugin {
    /// Serve until `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> Result<(), PluginError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        match self.tls {
            Some(config) => {
                let handle = axum_server::Handle::new();
                let stopper = handle.clone();
                tokio::spawn(async move {
                    shutdown.await;
                    stopper.graceful_shutdown(Some(Duration::from_secs(1)));
                });
                let rustls = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(config));
                axum_server::from_tcp_rustls(self.listener, rustls)
                    .handle(handle)
                    .serve(self.app.into_make_service())
                    .await?;
            }
            None => {
                let listener = tokio::net::TcpListener::from_std(self.listener)?;
                axum::serve(listener, self.app)
                    .with_graceful_shutdown(shutdown)
                    .await?;
            }
        }
        tracing::info!("plugin stopped");
        Ok(())
    }
}
