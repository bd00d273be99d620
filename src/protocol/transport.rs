//! RPC transports.
//!
//! A transport moves one encoded request to the plugin and returns the encoded
//! reply or the terminal status. [`HttpTransport`] speaks HTTP/2 (optionally
//! over mutual TLS) to a plugin process; [`LoopbackTransport`] dispatches into
//! an in-process [`DatabaseServer`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::server::DatabaseServer;
use crate::protocol::status::{Code, Status};
use crate::protocol::wire::{self, RpcResponse};

/// Header carrying the multiplex id of the logical database an RPC targets.
pub const MULTIPLEX_ID_HEADER: &str = "x-multiplex-id";

/// Per-call metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub multiplex_id: Option<String>,
}

impl Metadata {
    pub fn with_multiplex_id(id: impl Into<String>) -> Self {
        Self {
            multiplex_id: Some(id.into()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, metadata: &Metadata, payload: Vec<u8>)
        -> Result<Vec<u8>, Status>;
}

// ============================================================================
// HTTP/2
// ============================================================================

/// HTTP/2 transport to a plugin listening on `addr`.
///
/// All RPCs share one connection; requests are multiplexed as HTTP/2 streams.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Plaintext HTTP/2.
    pub fn plaintext(addr: SocketAddr) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{addr}"),
        })
    }

    /// HTTP/2 over TLS with a caller-built rustls config (client auth, pinning).
    pub fn tls(addr: SocketAddr, mut tls: rustls::ClientConfig) -> Result<Self, reqwest::Error> {
        tls.alpn_protocols = vec![b"h2".to_vec()];
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .http2_prior_knowledge()
            .build()?;
        Ok(Self {
            client,
            base_url: format!("https://{addr}"),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        method: &str,
        metadata: &Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        let mut request = self
            .client
            .post(format!("{}/rpc/{}", self.base_url, method))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload);
        if let Some(id) = &metadata.multiplex_id {
            request = request.header(MULTIPLEX_ID_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Status::unavailable(format!("connection error: {e}")))?;

        let http_status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Status::unavailable(format!("error reading from server: {e}")))?;

        if !http_status.is_success() {
            let code = match http_status {
                reqwest::StatusCode::NOT_FOUND => Code::Unimplemented,
                reqwest::StatusCode::SERVICE_UNAVAILABLE => Code::Unavailable,
                _ => Code::Unknown,
            };
            return Err(Status::new(
                code,
                format!(
                    "unexpected HTTP status {http_status}: {}",
                    String::from_utf8_lossy(&body)
                ),
            ));
        }

        match wire::from_bytes::<RpcResponse>(&body)? {
            RpcResponse::Ok(bytes) => Ok(bytes),
            RpcResponse::Err(status) => Err(status),
        }
    }
}

// ============================================================================
// In-process
// ============================================================================

/// Calls straight into a [`DatabaseServer`] without leaving the process.
#[derive(Clone)]
pub struct LoopbackTransport {
    server: Arc<DatabaseServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<DatabaseServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn call(
        &self,
        method: &str,
        metadata: &Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        self.server.dispatch(method, metadata, &payload).await
    }
}
