//! Host-side RPC client stub.
//!
//! [`DatabaseClient`] implements [`Database`] by validating each request
//! locally, encoding it and issuing one RPC over a [`Transport`]. Every call
//! races against the plugin's [`ShutdownSignal`]; once the process is gone the
//! call resolves to [`DatabaseError::PluginShutdown`] whatever the transport
//! reported.
//!
//! Caller cancellation is dropping the returned future (directly or through
//! `tokio::time::timeout`). `type_name` and `close` carry their own deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::dbplugin::{
    Database, DatabaseError, DatabaseResult, DeleteUserRequest, DeleteUserResponse,
    InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse, UpdateUserRequest,
    UpdateUserResponse,
};
use crate::protocol::methods;
use crate::protocol::shutdown::ShutdownSignal;
use crate::protocol::status::{Code, Status};
use crate::protocol::transport::{Metadata, Transport};
use crate::protocol::validate;
use crate::protocol::wire::{self, *};

/// Default deadline of `Type` and `Close`.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for the exit signal after a transport failure.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

pub struct DatabaseClient {
    transport: Arc<dyn Transport>,
    metadata: Metadata,
    shutdown: ShutdownSignal,
    control_timeout: Duration,
    shutdown_grace: Duration,
}

impl DatabaseClient {
    pub fn new(transport: Arc<dyn Transport>, shutdown: ShutdownSignal) -> Self {
        Self {
            transport,
            metadata: Metadata::default(),
            shutdown,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Ask the plugin whether it serves many logical databases per process.
    pub async fn multiplexing_supported(&self) -> DatabaseResult<bool> {
        let resp: WireMultiplexingSupportResponse = self
            .control(methods::MULTIPLEXING_SUPPORT, &WireEmpty {})
            .await?;
        Ok(resp.supported)
    }

    async fn invoke<Req, Resp>(&self, method: &str, req: &Req) -> DatabaseResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if self.shutdown.is_shutdown() {
            return Err(DatabaseError::PluginShutdown);
        }
        let payload = wire::to_bytes(req)?;

        let result = tokio::select! {
            biased;
            () = self.shutdown.wait() => return Err(DatabaseError::PluginShutdown),
            result = self.transport.call(method, &self.metadata, payload) => result,
        };

        match result {
            Ok(bytes) => Ok(wire::from_bytes(&bytes)?),
            Err(status) if is_transport_failure(&status) => {
                // The process may have died mid-call; the exit notification
                // can lag the broken connection slightly.
                if tokio::time::timeout(self.shutdown_grace, self.shutdown.wait())
                    .await
                    .is_ok()
                {
                    Err(DatabaseError::PluginShutdown)
                } else {
                    Err(DatabaseError::Status(status))
                }
            }
            Err(status) => Err(DatabaseError::Status(status)),
        }
    }

    async fn control<Req, Resp>(&self, method: &str, req: &Req) -> DatabaseResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        tokio::time::timeout(self.control_timeout, self.invoke(method, req))
            .await
            .map_err(|_| DatabaseError::Timeout(self.control_timeout))?
    }
}

fn is_transport_failure(status: &Status) -> bool {
    matches!(status.code, Code::Unavailable | Code::Unknown | Code::Cancelled)
}

/// Client-side validation and encoding failures never reach the transport.
fn local(status: Status) -> DatabaseError {
    DatabaseError::InvalidArgument(status.message)
}

#[async_trait]
impl Database for DatabaseClient {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        let wire_req = encode_initialize_request(&req).map_err(local)?;
        let resp: WireInitializeResponse = self.invoke(methods::INITIALIZE, &wire_req).await?;
        Ok(decode_initialize_response(resp))
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        validate::new_user(&req).map_err(local)?;
        let wire_req = encode_new_user_request(&req).map_err(local)?;
        let resp: WireNewUserResponse = self.invoke(methods::NEW_USER, &wire_req).await?;
        Ok(decode_new_user_response(resp))
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        validate::update_user(&req).map_err(local)?;
        let wire_req = encode_update_user_request(&req).map_err(local)?;
        let _: WireUpdateUserResponse = self.invoke(methods::UPDATE_USER, &wire_req).await?;
        Ok(UpdateUserResponse {})
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        validate::delete_user(&req).map_err(local)?;
        let wire_req = encode_delete_user_request(&req);
        let _: WireDeleteUserResponse = self.invoke(methods::DELETE_USER, &wire_req).await?;
        Ok(DeleteUserResponse {})
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        let resp: WireTypeResponse = self.control(methods::TYPE, &WireEmpty {}).await?;
        Ok(resp.type_name)
    }

    async fn close(&self) -> DatabaseResult<()> {
        let _: WireEmpty = self.control(methods::CLOSE, &WireEmpty {}).await?;
        Ok(())
    }
}
