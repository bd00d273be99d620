//! Tracing wrapper: a `started` and a `finished` event around every call.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;

use crate::dbplugin::{
    Database, DatabaseResult, DeleteUserRequest, DeleteUserResponse, InitializeRequest,
    InitializeResponse, NewUserRequest, NewUserResponse, UpdateUserRequest, UpdateUserResponse,
};
use crate::middleware::sanitize::{sanitize_error, SecretsFn};

pub struct Tracing<D> {
    next: D,
    type_name: String,
    redact: Option<SecretsFn>,
}

impl<D: Database> Tracing<D> {
    pub fn new(next: D, type_name: impl Into<String>) -> Self {
        Self {
            next,
            type_name: type_name.into(),
            redact: None,
        }
    }

    /// Scrub error text before it reaches the log.
    pub fn with_redaction(mut self, secrets: SecretsFn) -> Self {
        self.redact = Some(secrets);
        self
    }

    async fn traced<T, F>(&self, op: &'static str, call: F) -> DatabaseResult<T>
    where
        F: Future<Output = DatabaseResult<T>> + Send,
    {
        let start = Instant::now();
        tracing::debug!(db_type = %self.type_name, op, "started");

        let result = call.await;
        let took = start.elapsed();
        match &result {
            Ok(_) => {
                tracing::debug!(db_type = %self.type_name, op, ?took, "finished");
            }
            Err(err) => {
                let code = err.code();
                let message = match &self.redact {
                    Some(secrets) => {
                        // Only the text is logged; the error itself is returned unchanged.
                        let copy = crate::dbplugin::DatabaseError::adapter(err.to_string());
                        sanitize_error(copy, &secrets()).to_string()
                    }
                    None => err.to_string(),
                };
                tracing::debug!(
                    db_type = %self.type_name,
                    op,
                    ?took,
                    %code,
                    error = %message,
                    "finished"
                );
            }
        }
        result
    }
}

#[async_trait]
impl<D: Database> Database for Tracing<D> {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        self.traced("initialize", self.next.initialize(req)).await
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        self.traced("new_user", self.next.new_user(req)).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        self.traced("update_user", self.next.update_user(req)).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        self.traced("delete_user", self.next.delete_user(req)).await
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        self.next.type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.traced("close", self.next.close()).await
    }
}
