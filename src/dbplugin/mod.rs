//! The database plugin contract.
//!
//! Every adapter implements [`Database`]. The same trait is implemented by the
//! RPC client stub, by each middleware wrapper, and by supervisor handles, so
//! the host drives a local adapter and a remote plugin process the same way.

pub mod error;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{BoxError, DatabaseError, DatabaseResult};
pub use types::{
    ChangeExpiration, ChangePassword, ChangePublicKey, ConfigMap, ConfigValue, CredentialType,
    DeleteUserRequest, DeleteUserResponse, InitializeRequest, InitializeResponse, NewUserRequest,
    NewUserResponse, Statements, UpdateUserRequest, UpdateUserResponse, UsernameMetadata,
};

/// Six-operation interface every database plugin implements.
#[async_trait]
pub trait Database: Send + Sync {
    /// Validate and store the connection config. Returns the canonical form.
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse>;

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse>;

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse>;

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse>;

    /// Fixed identifier of the adapter, e.g. `"influxdb"`.
    async fn type_name(&self) -> DatabaseResult<String>;

    /// Release the instance and everything it owns.
    async fn close(&self) -> DatabaseResult<()>;
}

#[async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        (**self).initialize(req).await
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        (**self).new_user(req).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        (**self).update_user(req).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        (**self).delete_user(req).await
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        (**self).type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: Database + ?Sized> Database for Box<T> {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        (**self).initialize(req).await
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        (**self).new_user(req).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        (**self).update_user(req).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        (**self).delete_user(req).await
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        (**self).type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        (**self).close().await
    }
}
