//! Response wrapping.
//!
//! When auto-mTLS is off the host hands the plugin its TLS identity inside a
//! wrap token: a single-use, short-lived reference to a JSON payload that the
//! plugin redeems over HTTP at `POST /v1/sys/wrapping/unwrap`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::env::PluginEnv;
use super::tls::{self, TlsMaterials};
use super::PluginError;

pub const UNWRAP_PATH: &str = "/v1/sys/wrapping/unwrap";
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Host side: store a payload, hand out a token for it.
#[async_trait]
pub trait ResponseWrapper: Send + Sync {
    async fn wrap_response(&self, data: Value, ttl: Duration) -> Result<String, PluginError>;
}

/// Plugin side: redeem a token.
#[async_trait]
pub trait Unwrapper: Send + Sync {
    async fn unwrap_token(&self, token: &str) -> Result<Value, PluginError>;
}

pub async fn wrap_materials(
    wrapper: &dyn ResponseWrapper,
    materials: &TlsMaterials,
    ttl: Duration,
) -> Result<String, PluginError> {
    let data = serde_json::to_value(materials)
        .map_err(|e| PluginError::Wrapping(format!("encode tls materials: {e}")))?;
    wrapper.wrap_response(data, ttl).await
}

pub async fn unwrap_materials(
    unwrapper: &dyn Unwrapper,
    token: &str,
) -> Result<TlsMaterials, PluginError> {
    let data = unwrapper.unwrap_token(token).await?;
    serde_json::from_value(data)
        .map_err(|e| PluginError::Wrapping(format!("decode tls materials: {e}")))
}

// ============================================================================
// In-memory store
// ============================================================================

/// Single-use, TTL-bounded tokens held in memory.
#[derive(Default)]
pub struct InMemoryWrapper {
    entries: DashMap<String, (Value, Instant)>,
}

impl InMemoryWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take(&self, token: &str) -> Result<Value, PluginError> {
        let (_, (data, expires)) = self
            .entries
            .remove(token)
            .ok_or_else(|| PluginError::Wrapping("wrapping token is not valid or does not exist".into()))?;
        if Instant::now() >= expires {
            return Err(PluginError::Wrapping("wrapping token is expired".into()));
        }
        Ok(data)
    }

    /// Drop tokens that can no longer be redeemed.
    fn purge_expired(&self, now: Instant) {
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl ResponseWrapper for InMemoryWrapper {
    async fn wrap_response(&self, data: Value, ttl: Duration) -> Result<String, PluginError> {
        let now = Instant::now();
        self.purge_expired(now);
        let token = format!("hvs.{}", uuid::Uuid::new_v4().simple());
        self.entries.insert(token.clone(), (data, now + ttl));
        Ok(token)
    }
}

#[async_trait]
impl Unwrapper for InMemoryWrapper {
    async fn unwrap_token(&self, token: &str) -> Result<Value, PluginError> {
        self.take(token)
    }
}

/// Serves [`UNWRAP_PATH`] out of an [`InMemoryWrapper`].
pub fn router(wrapper: Arc<InMemoryWrapper>) -> Router {
    Router::new()
        .route(UNWRAP_PATH, post(handle_unwrap))
        .with_state(wrapper)
}

async fn handle_unwrap(State(wrapper): State<Arc<InMemoryWrapper>>, headers: HeaderMap) -> Response {
    let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": ["missing client token"] })),
        )
            .into_response();
    };
    match wrapper.take(token) {
        Ok(data) => Json(json!({ "data": data })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": [e.to_string()] })),
        )
            .into_response(),
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Deserialize)]
struct UnwrapResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Redeems tokens against the host's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpUnwrapper {
    client: reqwest::Client,
    addr: String,
}

impl HttpUnwrapper {
    /// `ca_pem`, when set, is the only CA trusted for the host's listener.
    pub fn new(addr: &str, ca_pem: Option<&str>) -> Result<Self, PluginError> {
        let builder = reqwest::Client::builder();
        let builder = match ca_pem {
            Some(pem) => builder.use_preconfigured_tls(tls::ca_client_config(pem)?),
            None => builder.use_rustls_tls(),
        };
        Ok(Self {
            client: builder.build()?,
            addr: addr.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env(env: &PluginEnv) -> Result<Self, PluginError> {
        let addr = env
            .host_addr
            .as_deref()
            .ok_or_else(|| PluginError::Wrapping("host address is not set".into()))?;
        Self::new(addr, env.testing_ca_pem.as_deref())
    }
}

#[async_trait]
impl Unwrapper for HttpUnwrapper {
    async fn unwrap_token(&self, token: &str) -> Result<Value, PluginError> {
        let response = self
            .client
            .post(format!("{}{UNWRAP_PATH}", self.addr))
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        let status = response.status();
        let body: UnwrapResponse = response
            .json()
            .await
            .map_err(|e| PluginError::Wrapping(format!("unwrap returned {status}: {e}")))?;

        if !status.is_success() {
            return Err(PluginError::Wrapping(format!(
                "unwrap returned {status}: {}",
                body.errors.join("; ")
            )));
        }
        body.data
            .ok_or_else(|| PluginError::Wrapping("unwrap response has no data".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::IntoFuture;

    fn materials() -> TlsMaterials {
        TlsMaterials {
            cert_pem: "cert".into(),
            key_pem: "key".into(),
            ca_pem: "ca".into(),
        }
    }

    #[tokio::test]
    async fn test_tokens_are_single_use() {
        let wrapper = InMemoryWrapper::new();
        let token = wrap_materials(&wrapper, &materials(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(unwrap_materials(&wrapper, &token).await.unwrap(), materials());
        assert!(unwrap_materials(&wrapper, &token).await.is_err());
        assert!(wrapper.is_empty());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let wrapper = InMemoryWrapper::new();
        let token = wrapper
            .wrap_response(json!({"a": 1}), Duration::ZERO)
            .await
            .unwrap();
        let err = wrapper.unwrap_token(&token).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_unredeemed_expired_tokens_are_dropped() {
        let wrapper = InMemoryWrapper::new();
        for i in 0..100 {
            wrapper
                .wrap_response(json!({ "i": i }), Duration::ZERO)
                .await
                .unwrap();
        }
        let live = wrapper
            .wrap_response(json!({ "i": "live" }), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(wrapper.len(), 1);

        wrapper
            .wrap_response(json!({ "i": "next" }), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(wrapper.len(), 2);
        assert_eq!(wrapper.unwrap_token(&live).await.unwrap(), json!({ "i": "live" }));
    }

    #[tokio::test]
    async fn test_http_unwrap_against_router() {
        let wrapper = Arc::new(InMemoryWrapper::new());
        let token = wrap_materials(wrapper.as_ref(), &materials(), Duration::from_secs(60))
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router(Arc::clone(&wrapper))).into_future());

        let unwrapper = HttpUnwrapper::new(&format!("http://{addr}"), None).unwrap();
        let got = unwrap_materials(&unwrapper, &token).await.unwrap();
        assert_eq!(got, materials());

        let err = unwrapper.unwrap_token(&token).await.unwrap_err();
        assert!(err.to_string().contains("not valid"), "{err}");
    }
}
