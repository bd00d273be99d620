//! Minimal InfluxDB v2 HTTP API client: users, passwords, organizations.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::influxdb::config::ConnectionConfig;

#[derive(Debug, thiserror::Error)]
pub enum InfluxError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("influxdb returned {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid token header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl InfluxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InfluxError::NotFound { .. })
            || matches!(self, InfluxError::Api { status, .. } if *status == 404)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct OrgList {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Health {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone)]
pub struct InfluxClient {
    client: Client,
    base: Url,
}

impl InfluxClient {
    pub fn new(config: &ConnectionConfig) -> Result<Self, InfluxError> {
        let base = Url::parse(&config.base_url())?;

        let mut auth = HeaderValue::from_str(&format!("Token {}", config.token))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.insecure_tls)
            .default_headers(headers)
            .build()?;
        Ok(Self { client, base })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, InfluxError> {
        Ok(self.client.request(method, self.base.join(path)?))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, InfluxError> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ApiError> = serde_json::from_str(&body).ok();
        let (code, message) = match parsed {
            Some(e) => (e.code, e.message),
            None => (
                status
                    .canonical_reason()
                    .unwrap_or("unknown")
                    .to_lowercase()
                    .replace(' ', "_"),
                body,
            ),
        };
        Err(InfluxError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, InfluxError> {
        Ok(self.send(builder).await?.json::<T>().await?)
    }

    /// `GET /health`
    pub async fn ping(&self) -> Result<(), InfluxError> {
        let health: Health = self.json(self.request(Method::GET, "/health")?).await?;
        if health.status != "pass" {
            return Err(InfluxError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                code: "unhealthy".to_string(),
                message: format!("health status {:?}", health.status),
            });
        }
        Ok(())
    }

    /// `POST /api/v2/users`
    pub async fn create_user(&self, name: &str) -> Result<User, InfluxError> {
        let body = serde_json::json!({ "name": name, "status": "active" });
        self.json(self.request(Method::POST, "/api/v2/users")?.json(&body))
            .await
    }

    /// `POST /api/v2/users/{id}/password`
    pub async fn set_password(&self, user_id: &str, password: &str) -> Result<(), InfluxError> {
        let body = serde_json::json!({ "password": password });
        let path = format!("/api/v2/users/{user_id}/password");
        self.send(self.request(Method::POST, &path)?.json(&body))
            .await?;
        Ok(())
    }

    /// `GET /api/v2/users?name=`
    pub async fn find_user(&self, name: &str) -> Result<User, InfluxError> {
        let builder = self
            .request(Method::GET, "/api/v2/users")?
            .query(&[("name", name)]);
        let list: UserList = match self.json(builder).await {
            Ok(list) => list,
            Err(e) if e.is_not_found() => UserList { users: Vec::new() },
            Err(e) => return Err(e),
        };
        list.users
            .into_iter()
            .find(|u| u.name == name)
            .ok_or_else(|| InfluxError::NotFound {
                kind: "user",
                name: name.to_string(),
            })
    }

    /// `DELETE /api/v2/users/{id}`
    pub async fn delete_user(&self, user_id: &str) -> Result<(), InfluxError> {
        let path = format!("/api/v2/users/{user_id}");
        self.send(self.request(Method::DELETE, &path)?).await?;
        Ok(())
    }

    /// `GET /api/v2/orgs?org=`
    pub async fn find_organization(&self, name: &str) -> Result<Organization, InfluxError> {
        let builder = self
            .request(Method::GET, "/api/v2/orgs")?
            .query(&[("org", name)]);
        let list: OrgList = match self.json(builder).await {
            Ok(list) => list,
            Err(e) if e.is_not_found() => OrgList { orgs: Vec::new() },
            Err(e) => return Err(e),
        };
        list.orgs
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| InfluxError::NotFound {
                kind: "organization",
                name: name.to_string(),
            })
    }

    /// `POST /api/v2/orgs/{id}/members`
    pub async fn add_member(&self, org_id: &str, user_id: &str) -> Result<(), InfluxError> {
        let body = serde_json::json!({ "id": user_id });
        let path = format!("/api/v2/orgs/{org_id}/members");
        self.send(self.request(Method::POST, &path)?.json(&body))
            .await?;
        Ok(())
    }
}
