//! Plugin-side RPC server stub.
//!
//! [`DatabaseServer`] decodes each request, validates it, invokes the adapter
//! and encodes the reply. Validation failures reply `InvalidArgument`; adapter
//! failures reply `Internal` unless the adapter already produced a status.
//!
//! A multiplexed server keeps one adapter instance per multiplex id, created on
//! first use by a factory and dropped on `Close`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;

use crate::dbplugin::{Database, DatabaseError};
use crate::protocol::methods;
use crate::protocol::status::Status;
use crate::protocol::transport::{Metadata, MULTIPLEX_ID_HEADER};
use crate::protocol::validate;
use crate::protocol::wire::{self, *};

/// Builds a fresh adapter instance for a new multiplex id.
pub type DatabaseFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Database>, DatabaseError> + Send + Sync>;

enum Instances {
    Single(Arc<dyn Database>),
    Multiplexed {
        factory: DatabaseFactory,
        by_id: RwLock<HashMap<String, Arc<dyn Database>>>,
    },
}

pub struct DatabaseServer {
    instances: Instances,
    metadata_mode: bool,
}

impl DatabaseServer {
    /// One adapter for the whole process.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            instances: Instances::Single(db),
            metadata_mode: false,
        }
    }

    /// One adapter per multiplex id.
    pub fn multiplexed<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Database>, DatabaseError> + Send + Sync + 'static,
    {
        Self {
            instances: Instances::Multiplexed {
                factory: Arc::new(factory),
                by_id: RwLock::new(HashMap::new()),
            },
            metadata_mode: false,
        }
    }

    /// In metadata mode only `Type`, `Close` and `MultiplexingSupport` are served.
    pub fn with_metadata_mode(mut self, enabled: bool) -> Self {
        self.metadata_mode = enabled;
        self
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.instances, Instances::Multiplexed { .. })
    }

    /// Number of live adapter instances.
    pub fn instance_count(&self) -> usize {
        match &self.instances {
            Instances::Single(_) => 1,
            Instances::Multiplexed { by_id, .. } => by_id.read().len(),
        }
    }

    fn instance(&self, metadata: &Metadata) -> Result<Arc<dyn Database>, Status> {
        let (factory, by_id) = match &self.instances {
            Instances::Single(db) => return Ok(Arc::clone(db)),
            Instances::Multiplexed { factory, by_id } => (factory, by_id),
        };
        let id = multiplex_id(metadata)?;

        if let Some(db) = by_id.read().get(id) {
            return Ok(Arc::clone(db));
        }

        let mut map = by_id.write();
        if let Some(db) = map.get(id) {
            return Ok(Arc::clone(db));
        }
        let db = factory()
            .map_err(|e| Status::internal(format!("failed to create database instance: {e}")))?;
        map.insert(id.to_string(), Arc::clone(&db));
        tracing::debug!(multiplex_id = %id, instances = map.len(), "database instance created");
        Ok(db)
    }

    fn remove_instance(&self, metadata: &Metadata) {
        if let (Instances::Multiplexed { by_id, .. }, Some(id)) =
            (&self.instances, metadata.multiplex_id.as_deref())
        {
            by_id.write().remove(id);
        }
    }

    fn reject_in_metadata_mode(&self, method: &str) -> Result<(), Status> {
        if self.metadata_mode {
            return Err(Status::failed_precondition(format!(
                "{method} is not available in metadata mode"
            )));
        }
        Ok(())
    }

    /// Serve one RPC.
    pub async fn dispatch(
        &self,
        method: &str,
        metadata: &Metadata,
        payload: &[u8],
    ) -> Result<Vec<u8>, Status> {
        tracing::trace!(method, multiplex_id = ?metadata.multiplex_id, "rpc received");
        match method {
            methods::INITIALIZE => {
                self.reject_in_metadata_mode(method)?;
                let req = decode_initialize_request(wire::from_bytes(payload)?);
                let db = self.instance(metadata)?;
                let resp = db
                    .initialize(req)
                    .await
                    .map_err(|e| adapter_status("failed to initialize", e))?;
                reply(&encode_initialize_response(&resp)?)
            }
            methods::NEW_USER => {
                self.reject_in_metadata_mode(method)?;
                let req = decode_new_user_request(wire::from_bytes(payload)?)?;
                validate::new_user(&req)?;
                let db = self.instance(metadata)?;
                let resp = db
                    .new_user(req)
                    .await
                    .map_err(|e| adapter_status("unable to create new user", e))?;
                reply(&encode_new_user_response(&resp))
            }
            methods::UPDATE_USER => {
                self.reject_in_metadata_mode(method)?;
                let req = decode_update_user_request(wire::from_bytes(payload)?)?;
                validate::update_user(&req)?;
                let db = self.instance(metadata)?;
                db.update_user(req)
                    .await
                    .map_err(|e| adapter_status("unable to update user", e))?;
                reply(&WireUpdateUserResponse {})
            }
            methods::DELETE_USER => {
                self.reject_in_metadata_mode(method)?;
                let req = decode_delete_user_request(wire::from_bytes(payload)?);
                validate::delete_user(&req)?;
                let db = self.instance(metadata)?;
                db.delete_user(req)
                    .await
                    .map_err(|e| adapter_status("unable to delete user", e))?;
                reply(&WireDeleteUserResponse {})
            }
            methods::TYPE => {
                let db = self.instance(metadata)?;
                let type_name = db
                    .type_name()
                    .await
                    .map_err(|e| adapter_status("unable to retrieve type", e))?;
                reply(&WireTypeResponse { type_name })
            }
            methods::CLOSE => {
                let db = self.instance(metadata)?;
                let result = db.close().await;
                self.remove_instance(metadata);
                result.map_err(|e| adapter_status("unable to close database plugin", e))?;
                reply(&WireEmpty {})
            }
            methods::MULTIPLEXING_SUPPORT => reply(&WireMultiplexingSupportResponse {
                supported: self.is_multiplexed(),
            }),
            other => Err(Status::unimplemented(format!("unknown method {other}"))),
        }
    }
}

fn multiplex_id(metadata: &Metadata) -> Result<&str, Status> {
    metadata
        .multiplex_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Status::invalid_argument("no multiplex id found in request metadata"))
}

fn adapter_status(context: &str, err: DatabaseError) -> Status {
    match err {
        DatabaseError::Status(status) => status,
        DatabaseError::InvalidArgument(message) => Status::invalid_argument(message),
        other => Status::internal(format!("{context}: {other}")),
    }
}

fn reply<T: Serialize>(msg: &T) -> Result<Vec<u8>, Status> {
    wire::to_bytes(msg)
}

// ============================================================================
// HTTP Router
// ============================================================================

/// Router serving `POST /rpc/:method`.
pub fn router(server: Arc<DatabaseServer>) -> Router {
    Router::new()
        .route("/rpc/:method", post(handle_rpc))
        .with_state(server)
}

async fn handle_rpc(
    State(server): State<Arc<DatabaseServer>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let metadata = Metadata {
        multiplex_id: headers
            .get(MULTIPLEX_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let envelope = match server.dispatch(&method, &metadata, &body).await {
        Ok(bytes) => RpcResponse::Ok(bytes),
        Err(status) => RpcResponse::Err(status),
    };

    match wire::to_bytes(&envelope) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(status) => (StatusCode::INTERNAL_SERVER_ERROR, status.message).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbplugin::*;
    use crate::protocol::status::Code;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct Fake {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Database for Fake {
        async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(InitializeResponse { config: req.config })
        }
        async fn new_user(&self, _req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DatabaseError::adapter("user exists"))
        }
        async fn update_user(&self, _req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateUserResponse {})
        }
        async fn delete_user(&self, _req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Status::new(Code::NotFound, "no such user").into())
        }
        async fn type_name(&self) -> DatabaseResult<String> {
            Ok("fake".to_string())
        }
        async fn close(&self) -> DatabaseResult<()> {
            Ok(())
        }
    }

    fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
        wire::to_bytes(msg).unwrap()
    }

    #[tokio::test]
    async fn test_update_without_changes_rejected_before_adapter() {
        let fake = Arc::new(Fake::default());
        let server = DatabaseServer::new(fake.clone());
        let payload = encode(&WireUpdateUserRequest {
            username: "u".to_string(),
            ..Default::default()
        });

        let err = server
            .dispatch(methods::UPDATE_USER, &Metadata::default(), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_adapter_error_maps_to_internal() {
        let server = DatabaseServer::new(Arc::new(Fake::default()));
        let payload = encode(&WireNewUserRequest {
            password: "pw".to_string(),
            ..Default::default()
        });

        let err = server
            .dispatch(methods::NEW_USER, &Metadata::default(), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.message, "unable to create new user: user exists");
    }

    #[tokio::test]
    async fn test_adapter_status_passes_through() {
        let server = DatabaseServer::new(Arc::new(Fake::default()));
        let payload = encode(&WireDeleteUserRequest {
            username: "ghost".to_string(),
            statements: None,
        });

        let err = server
            .dispatch(methods::DELETE_USER, &Metadata::default(), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn test_multiplexed_instances_by_id() {
        let server =
            DatabaseServer::multiplexed(|| Ok(Arc::new(Fake::default()) as Arc<dyn Database>));
        let empty = encode(&WireEmpty {});

        let err = server
            .dispatch(methods::TYPE, &Metadata::default(), &empty)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        for id in ["a", "b", "a"] {
            server
                .dispatch(methods::TYPE, &Metadata::with_multiplex_id(id), &empty)
                .await
                .unwrap();
        }
        assert_eq!(server.instance_count(), 2);

        server
            .dispatch(methods::CLOSE, &Metadata::with_multiplex_id("a"), &empty)
            .await
            .unwrap();
        assert_eq!(server.instance_count(), 1);

        let resp: WireMultiplexingSupportResponse = wire::from_bytes(
            &server
                .dispatch(methods::MULTIPLEXING_SUPPORT, &Metadata::default(), &empty)
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(resp.supported);
    }

    #[tokio::test]
    async fn test_metadata_mode_rejects_mutations() {
        let server = DatabaseServer::new(Arc::new(Fake::default())).with_metadata_mode(true);
        let payload = encode(&WireInitializeRequest::default());

        let err = server
            .dispatch(methods::INITIALIZE, &Metadata::default(), &payload)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);

        let resp: WireTypeResponse = wire::from_bytes(
            &server
                .dispatch(methods::TYPE, &Metadata::default(), &encode(&WireEmpty {}))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(resp.type_name, "fake");
    }

    #[tokio::test]
    async fn test_router_unknown_method() {
        let app = router(Arc::new(DatabaseServer::new(Arc::new(Fake::default()))));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rpc/Database.Frobnicate")
                    .body(Body::from(encode(&WireEmpty {})))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        match wire::from_bytes::<RpcResponse>(&body).unwrap() {
            RpcResponse::Err(status) => assert_eq!(status.code, Code::Unimplemented),
            RpcResponse::Ok(_) => panic!("expected error"),
        }
    }
}
