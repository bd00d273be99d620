//! InfluxDB Adapter
//!
//! Reference implementation of [`Database`] for InfluxDB v2. A new user is
//! created, given its password and added to the configured organization; if
//! any step after creation fails the user is deleted again.
//!
//! All mutating operations hold one adapter-wide async mutex, so side effects
//! on a single instance are totally ordered.

pub mod client;
pub mod config;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::dbplugin::{
    CredentialType, Database, DatabaseError, DatabaseResult, DeleteUserRequest,
    DeleteUserResponse, InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse,
    UpdateUserRequest, UpdateUserResponse,
};
use crate::middleware::{self, MetricsRegistry, SecretsFn};
use crate::template::UsernameTemplate;

pub use client::{InfluxClient, InfluxError, Organization, User};
pub use config::ConnectionConfig;

/// Value returned by `type_name`.
pub const INFLUXDB_TYPE_NAME: &str = "influxdb";

struct Connection {
    client: InfluxClient,
    config: ConnectionConfig,
    template: UsernameTemplate,
}

pub struct InfluxDb {
    conn: Mutex<Option<Connection>>,
    secrets: Arc<RwLock<HashMap<String, String>>>,
}

impl Default for InfluxDb {
    fn default() -> Self {
        Self::new()
    }
}

impl InfluxDb {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            secrets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `secret -> placeholder` pairs for the error sanitiser.
    pub fn secrets_fn(&self) -> SecretsFn {
        let secrets = Arc::clone(&self.secrets);
        Arc::new(move || secrets.read().clone())
    }
}

/// A fresh adapter behind the middleware chain, ready for `serve`.
pub fn new() -> Result<Arc<dyn Database>, DatabaseError> {
    let db = InfluxDb::new();
    let secrets = db.secrets_fn();
    Ok(Arc::new(middleware::wrap(
        db,
        INFLUXDB_TYPE_NAME,
        secrets,
        MetricsRegistry::global(),
    )))
}

fn not_initialized() -> DatabaseError {
    DatabaseError::adapter("influxdb plugin has not been initialized")
}

#[async_trait]
impl Database for InfluxDb {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        let config = ConnectionConfig::from_map(&req.config)?;

        let template = match &config.username_template {
            Some(source) => UsernameTemplate::new(source),
            None => UsernameTemplate::standard(),
        }
        .map_err(|e| DatabaseError::with_source("unable to initialize username template", e))?;

        let client = InfluxClient::new(&config)
            .map_err(|e| DatabaseError::with_source("failed to create influxdb client", e))?;

        // Register before any network call so a failed ping is scrubbed too.
        {
            let mut secrets = self.secrets.write();
            secrets.clear();
            secrets.insert(config.token.clone(), "[token]".to_string());
        }

        if req.verify_connection {
            client
                .ping()
                .await
                .map_err(|e| DatabaseError::with_source("failed to verify connection", e))?;
        }

        let canonical = config.canonicalize(&req.config);
        tracing::debug!(host = %config.host, port = config.port, "influxdb connection configured");

        *self.conn.lock().await = Some(Connection {
            client,
            config,
            template,
        });
        Ok(InitializeResponse { config: canonical })
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        if req.credential_type != CredentialType::Password {
            return Err(DatabaseError::invalid_argument(format!(
                "unsupported credential type {}",
                req.credential_type
            )));
        }

        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(not_initialized)?;

        let username = conn
            .template
            .generate(&req.username_config)
            .map_err(|e| DatabaseError::with_source("unable to generate username", e))?;

        let user = conn
            .client
            .create_user(&username)
            .await
            .map_err(|e| DatabaseError::with_source("unable to create user", e))?;

        if let Err(err) = finish_new_user(conn, &user, &req.password).await {
            tracing::debug!(username = %user.name, "rolling back user creation");
            if let Err(rollback) = conn.client.delete_user(&user.id).await {
                return Err(DatabaseError::adapter(format!(
                    "{err}; failed to roll back user creation: {rollback}"
                )));
            }
            return Err(err);
        }

        Ok(NewUserResponse {
            username: user.name,
        })
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        let password = req
            .password
            .as_ref()
            .filter(|change| !change.new_password.is_empty());
        if password.is_none() && req.expiration.is_none() {
            return Err(DatabaseError::invalid_argument("no changes requested"));
        }

        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(not_initialized)?;

        // The database has no account expiry; expiration changes are accepted as-is.
        if let Some(change) = password {
            let user = conn
                .client
                .find_user(&req.username)
                .await
                .map_err(|e| DatabaseError::with_source("unable to find user", e))?;
            conn.client
                .set_password(&user.id, &change.new_password)
                .await
                .map_err(|e| DatabaseError::with_source("unable to set password", e))?;
        }
        Ok(UpdateUserResponse {})
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(not_initialized)?;

        let user = conn
            .client
            .find_user(&req.username)
            .await
            .map_err(|e| DatabaseError::with_source("unable to find user", e))?;
        conn.client
            .delete_user(&user.id)
            .await
            .map_err(|e| DatabaseError::with_source("unable to delete user", e))?;
        Ok(DeleteUserResponse {})
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        Ok(INFLUXDB_TYPE_NAME.to_string())
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.conn.lock().await.take();
        Ok(())
    }
}

async fn finish_new_user(conn: &Connection, user: &User, password: &str) -> DatabaseResult<()> {
    conn.client
        .set_password(&user.id, password)
        .await
        .map_err(|e| DatabaseError::with_source("unable to set password", e))?;
    let org = conn
        .client
        .find_organization(&conn.config.organization)
        .await
        .map_err(|e| DatabaseError::with_source("unable to find organization", e))?;
    conn.client
        .add_member(&org.id, &user.id)
        .await
        .map_err(|e| DatabaseError::with_source("unable to add user to organization", e))?;
    Ok(())
}
