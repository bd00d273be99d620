//! Host-side plugin supervision.
//!
//! [`PluginSupervisor`] launches plugin processes, completes the handshake,
//! and hands out one [`DatabaseHandle`] per host-chosen id. A process that
//! negotiated version 6 and reports multiplexing support is shared by every
//! handle; otherwise each handle gets its own process. A process is killed
//! when its last handle is closed.
//!
//! Every handle calls through the host-side middleware chain
//! (`ErrorSanitizer -> Tracing -> Metrics -> DatabaseClient`).
//!
//! ## Locking
//!
//! - `handles` (`parking_lot::RwLock`) maps ids to handles. It is never held
//!   across an await or an RPC.
//! - `shared` (`tokio::sync::Mutex`) serialises launching and the per-process
//!   handle count, so a process cannot be killed while a handle is being
//!   attached to it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};

use super::env::{self, CLIENT_CERT, HOST_ADDR, UNWRAP_TOKEN};
use super::handshake::Handshake;
use super::tls::{self, CertificateAuthority, TlsMaterials};
use super::wrapping::{wrap_materials, ResponseWrapper};
use super::{PluginError, PROTOCOL_VERSION_MULTIPLEXED, SUPPORTED_VERSIONS};
use crate::config::Config;
use crate::dbplugin::{
    Database, DatabaseResult, DeleteUserRequest, DeleteUserResponse, InitializeRequest,
    InitializeResponse, NewUserRequest, NewUserResponse, UpdateUserRequest, UpdateUserResponse,
};
use crate::middleware::{self, MetricsRegistry, SecretsFn, Wrapped};
use crate::protocol::client::{DEFAULT_CONTROL_TIMEOUT, DEFAULT_SHUTDOWN_GRACE};
use crate::protocol::shutdown::{self, ShutdownTrigger};
use crate::protocol::{Code, DatabaseClient, HttpTransport, Metadata, Transport};

// ============================================================================
// Configuration
// ============================================================================

/// How to start a plugin binary.
#[derive(Debug, Clone)]
pub struct PluginRunner {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Extra variables; protocol variables take precedence.
    pub env: Vec<(String, String)>,
}

impl PluginRunner {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Clone)]
pub struct SupervisorOptions {
    /// Plugin mints its own server certificate; the host's CA travels in the
    /// environment.
    pub automtls: bool,
    pub host_version: String,
    pub startup_timeout: Duration,
    pub control_timeout: Duration,
    pub shutdown_grace: Duration,
    pub wrap_ttl: Duration,
    /// Delivers the server identity when `automtls` is off.
    pub wrapper: Option<Arc<dyn ResponseWrapper>>,
    /// Where the plugin redeems its wrap token.
    pub host_addr: Option<String>,
    pub mlock: bool,
    /// Host-side call counters and durations.
    pub metrics: Arc<MetricsRegistry>,
    /// Secrets scrubbed from errors before they reach the caller.
    pub secrets: SecretsFn,
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("automtls", &self.automtls)
            .field("host_version", &self.host_version)
            .field("startup_timeout", &self.startup_timeout)
            .field("control_timeout", &self.control_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("wrap_ttl", &self.wrap_ttl)
            .field("wrapper", &self.wrapper.is_some())
            .field("host_addr", &self.host_addr)
            .field("mlock", &self.mlock)
            .finish_non_exhaustive()
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            automtls: true,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            startup_timeout: Duration::from_secs(10),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            wrap_ttl: Duration::from_secs(300),
            wrapper: None,
            host_addr: None,
            mlock: false,
            metrics: MetricsRegistry::global(),
            secrets: Arc::new(no_secrets),
        }
    }
}

fn no_secrets() -> HashMap<String, String> {
    HashMap::new()
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            startup_timeout: config.plugin.startup_timeout(),
            control_timeout: config.rpc.control_timeout(),
            shutdown_grace: config.rpc.shutdown_grace(),
            wrap_ttl: config.plugin.wrap_ttl(),
            ..Self::default()
        }
    }

    /// Turn off auto-mTLS and deliver server identities through `wrapper`.
    pub fn with_wrapping(
        mut self,
        wrapper: Arc<dyn ResponseWrapper>,
        host_addr: impl Into<String>,
    ) -> Self {
        self.automtls = false;
        self.wrapper = Some(wrapper);
        self.host_addr = Some(host_addr.into());
        self
    }

    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = registry;
        self
    }

    pub fn with_secrets(mut self, secrets: SecretsFn) -> Self {
        self.secrets = secrets;
        self
    }
}

// ============================================================================
// Processes
// ============================================================================

struct PluginProcess {
    name: String,
    pid: Option<u32>,
    version: u32,
    transport: Arc<dyn Transport>,
    trigger: ShutdownTrigger,
    kill: SyncMutex<Option<oneshot::Sender<()>>>,
    multiplexed: AtomicBool,
    /// Attached handles. Only changed while holding the supervisor's
    /// `shared` lock.
    handles: AtomicUsize,
}

impl PluginProcess {
    fn is_shut_down(&self) -> bool {
        self.trigger.is_fired()
    }

    fn kill(&self) {
        if let Some(tx) = self.kill.lock().take() {
            let _ = tx.send(());
        }
    }

    fn client(&self, metadata: Metadata, options: &SupervisorOptions) -> DatabaseClient {
        DatabaseClient::new(Arc::clone(&self.transport), self.trigger.signal())
            .with_metadata(metadata)
            .with_control_timeout(options.control_timeout)
            .with_shutdown_grace(options.shutdown_grace)
    }
}

/// A logical database served by a plugin process.
///
/// Release handles through [`PluginSupervisor::close`]; calling
/// [`Database::close`] directly only closes the plugin-side instance.
pub struct DatabaseHandle {
    id: String,
    multiplex_id: Option<String>,
    db: Wrapped<DatabaseClient>,
    process: Arc<PluginProcess>,
    released: AtomicBool,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.id)
            .field("plugin", &self.process.name)
            .field("pid", &self.process.pid)
            .field("version", &self.process.version)
            .field("multiplexed", &self.is_multiplexed())
            .finish()
    }
}

impl DatabaseHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The process behind this handle has exited.
    pub fn is_shut_down(&self) -> bool {
        self.process.is_shut_down()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.process.multiplexed.load(Ordering::SeqCst)
    }

    pub fn protocol_version(&self) -> u32 {
        self.process.version
    }

    pub fn multiplex_id(&self) -> Option<&str> {
        self.multiplex_id.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid
    }
}

#[async_trait]
impl Database for DatabaseHandle {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        self.db.initialize(req).await
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        self.db.new_user(req).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        self.db.update_user(req).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        self.db.delete_user(req).await
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        self.db.type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.db.close().await
    }
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct PluginSupervisor {
    runner: PluginRunner,
    options: SupervisorOptions,
    handles: RwLock<HashMap<String, Arc<DatabaseHandle>>>,
    shared: Mutex<Option<Arc<PluginProcess>>>,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PluginSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSupervisor")
            .field("runner", &self.runner)
            .field("handles", &self.handles.read().len())
            .field("processes", &self.process_count())
            .finish()
    }
}

impl PluginSupervisor {
    pub fn new(runner: PluginRunner, options: SupervisorOptions) -> Self {
        Self {
            runner,
            options,
            handles: RwLock::new(HashMap::new()),
            shared: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Plugin processes that have been launched and have not yet exited.
    pub fn process_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of open handles.
    pub fn handle_count(&self) -> usize {
        self.handles.read().len()
    }

    /// The handle for `id`, dispensing a new one if there is none or the
    /// previous one's process has exited.
    pub async fn database(&self, id: &str) -> Result<Arc<DatabaseHandle>, PluginError> {
        if let Some(handle) = self.handles.read().get(id) {
            if !handle.is_shut_down() {
                return Ok(Arc::clone(handle));
            }
        }

        let fresh = Arc::new(self.dispense(id).await?);

        let (handle, discard) = {
            let mut map = self.handles.write();
            match map.get(id) {
                Some(existing) if !existing.is_shut_down() => (Arc::clone(existing), Some(fresh)),
                _ => {
                    let stale = map.insert(id.to_string(), Arc::clone(&fresh));
                    (fresh, stale)
                }
            }
        };
        if let Some(discard) = discard {
            self.release(&discard).await;
        }
        Ok(handle)
    }

    /// Close the handle for `id`. Returns false if there was none.
    pub async fn close(&self, id: &str) -> bool {
        let handle = self.handles.write().remove(id);
        match handle {
            Some(handle) => {
                self.release(&handle).await;
                true
            }
            None => false,
        }
    }

    /// Close every handle.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.handles.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.release(&handle).await;
        }
        if let Some(process) = self.shared.lock().await.take() {
            process.kill();
        }
    }

    /// Launch the plugin in metadata mode and ask its type.
    pub async fn plugin_type(&self) -> Result<String, PluginError> {
        let process = self.launch(true).await?;
        let metadata = Metadata::with_multiplex_id(uuid::Uuid::new_v4().to_string());
        let result = process.client(metadata, &self.options).type_name().await;
        process.kill();
        Ok(result?)
    }

    async fn dispense(&self, id: &str) -> Result<DatabaseHandle, PluginError> {
        let mut shared = self.shared.lock().await;

        let process = match shared.as_ref() {
            Some(process) if !process.is_shut_down() => Arc::clone(process),
            _ => {
                let process = self.launch(false).await?;
                let multiplexed = match self.query_multiplexing(&process).await {
                    Ok(multiplexed) => multiplexed,
                    Err(err) => {
                        process.kill();
                        return Err(err);
                    }
                };
                process.multiplexed.store(multiplexed, Ordering::SeqCst);
                *shared = multiplexed.then(|| Arc::clone(&process));
                process
            }
        };
        process.handles.fetch_add(1, Ordering::SeqCst);
        drop(shared);

        let metadata = if process.multiplexed.load(Ordering::SeqCst) {
            Metadata::with_multiplex_id(uuid::Uuid::new_v4().to_string())
        } else {
            Metadata::default()
        };
        tracing::debug!(
            id,
            plugin = %self.runner.name,
            multiplex_id = metadata.multiplex_id.as_deref().unwrap_or(""),
            "dispensed database handle"
        );

        let multiplex_id = metadata.multiplex_id.clone();
        let db = middleware::wrap(
            process.client(metadata, &self.options),
            &self.runner.name,
            Arc::clone(&self.options.secrets),
            Arc::clone(&self.options.metrics),
        );
        Ok(DatabaseHandle {
            id: id.to_string(),
            multiplex_id,
            db,
            process,
            released: AtomicBool::new(false),
        })
    }

    async fn query_multiplexing(&self, process: &PluginProcess) -> Result<bool, PluginError> {
        if process.version < PROTOCOL_VERSION_MULTIPLEXED {
            return Ok(false);
        }
        let client = process.client(Metadata::default(), &self.options);
        match client.multiplexing_supported().await {
            Ok(supported) => Ok(supported),
            Err(err) if err.code() == Code::Unimplemented => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, handle: &DatabaseHandle) {
        if handle.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if !handle.is_shut_down() {
            if let Err(err) = handle.db.close().await {
                if !err.is_plugin_shutdown() {
                    tracing::warn!(id = %handle.id, error = %err, "error closing database");
                }
            }
        }

        let mut shared = self.shared.lock().await;
        let process = &handle.process;
        if process.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            process.kill();
            if shared.as_ref().is_some_and(|p| Arc::ptr_eq(p, process)) {
                *shared = None;
            }
            tracing::debug!(plugin = %process.name, pid = ?process.pid, "last handle closed, stopping plugin");
        }
    }

    async fn launch(&self, metadata_mode: bool) -> Result<Arc<PluginProcess>, PluginError> {
        let options = &self.options;
        let name = self.runner.name.clone();

        let ca = CertificateAuthority::generate()?;
        let client_leaf = ca.issue("dbplugin-host")?;

        let mut vars = env::launch_env(
            &options.host_version,
            metadata_mode,
            options.automtls,
            options.mlock,
        );
        let mut expected_fingerprint = None;
        let mut tls_expected = false;
        if options.automtls {
            vars.insert(CLIENT_CERT.to_string(), ca.cert_pem());
            tls_expected = true;
        } else if let (false, Some(wrapper)) = (metadata_mode, &options.wrapper) {
            let server_leaf = ca.issue("dbplugin-plugin")?;
            let materials = TlsMaterials {
                cert_pem: server_leaf.cert_pem.clone(),
                key_pem: server_leaf.key_pem.clone(),
                ca_pem: ca.cert_pem(),
            };
            let token = wrap_materials(wrapper.as_ref(), &materials, options.wrap_ttl).await?;
            vars.insert(UNWRAP_TOKEN.to_string(), token);
            if let Some(addr) = &options.host_addr {
                vars.insert(HOST_ADDR.to_string(), addr.clone());
            }
            expected_fingerprint = Some(server_leaf.fingerprint);
            tls_expected = true;
        }

        let mut child = Command::new(&self.runner.command)
            .args(&self.runner.args)
            .envs(self.runner.env.iter().cloned())
            .envs(&vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                path: self.runner.command.clone(),
                source,
            })?;
        let pid = child.id();
        tracing::debug!(plugin = %name, ?pid, metadata_mode, "plugin started");

        if let Some(stderr) = child.stderr.take() {
            let name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %name, "{line}");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or(PluginError::ExitedBeforeHandshake)?;
        let mut lines = BufReader::new(stdout).lines();

        // Dropping `child` on any error below kills the process.
        let line = tokio::time::timeout(options.startup_timeout, lines.next_line())
            .await
            .map_err(|_| PluginError::StartupTimeout(options.startup_timeout))??
            .ok_or(PluginError::ExitedBeforeHandshake)?;
        let handshake: Handshake = line.parse()?;
        if !SUPPORTED_VERSIONS.contains(&handshake.app_version) {
            return Err(PluginError::UnsupportedVersion(handshake.app_version));
        }

        {
            let name = name.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %name, stdout = %line);
                }
            });
        }

        let transport: Arc<dyn Transport> = if handshake.is_tls() {
            if let Some(expected) = &expected_fingerprint {
                if *expected != handshake.fingerprint {
                    return Err(PluginError::FingerprintMismatch);
                }
            }
            let config = tls::client_config(&client_leaf, &handshake.fingerprint)?;
            Arc::new(HttpTransport::tls(handshake.addr, config)?)
        } else if metadata_mode || !tls_expected {
            if !metadata_mode {
                tracing::warn!(plugin = %name, "plugin is serving without TLS");
            }
            Arc::new(HttpTransport::plaintext(handshake.addr)?)
        } else {
            return Err(PluginError::Tls(
                "plugin did not announce a server certificate".to_string(),
            ));
        };

        let (trigger, _) = shutdown::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.live.fetch_add(1, Ordering::SeqCst);

        let exit_trigger = trigger.clone();
        let live = Arc::clone(&self.live);
        let exit_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::debug!(plugin = %exit_name, ?status, "plugin exited");
                }
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(plugin = %exit_name, error = %err, "failed to kill plugin");
                    }
                    tracing::debug!(plugin = %exit_name, "plugin killed");
                }
            }
            exit_trigger.fire();
            live.fetch_sub(1, Ordering::SeqCst);
        });

        tracing::info!(
            plugin = %name,
            addr = %handshake.addr,
            version = handshake.app_version,
            tls = handshake.is_tls(),
            "plugin handshake complete"
        );

        Ok(Arc::new(PluginProcess {
            name,
            pid,
            version: handshake.app_version,
            transport,
            trigger,
            kill: SyncMutex::new(Some(kill_tx)),
            multiplexed: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
        }))
    }
}
