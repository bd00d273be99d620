//! Error sanitiser: the outermost wrapper of every adapter.
//!
//! Errors leave the plugin boundary only after secret material has been
//! replaced by placeholders. URL parse failures collapse to a fixed message
//! because the URL may carry credentials.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dbplugin::{
    Database, DatabaseError, DatabaseResult, DeleteUserRequest, DeleteUserResponse,
    InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse, UpdateUserRequest,
    UpdateUserResponse,
};

/// Replaces the message of any error that wraps a URL parse failure.
pub const URL_PARSE_ERROR_MESSAGE: &str = "unable to parse connection url";

/// Returns the current `secret -> placeholder` pairs.
pub type SecretsFn = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

pub struct ErrorSanitizer<D> {
    next: D,
    secrets: SecretsFn,
}

impl<D: Database> ErrorSanitizer<D> {
    pub fn new(next: D, secrets: SecretsFn) -> Self {
        Self { next, secrets }
    }

    pub fn inner(&self) -> &D {
        &self.next
    }

    fn sanitize(&self, err: DatabaseError) -> DatabaseError {
        sanitize_error(err, &(self.secrets)())
    }
}

/// True if `err` or anything in its source chain is a `url::ParseError`.
pub fn contains_url_error(err: &DatabaseError) -> bool {
    if matches!(err, DatabaseError::InvalidUrl(_)) {
        return true;
    }
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if e.is::<url::ParseError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Literal replacement of every non-empty secret. Longer secrets go first so
/// a secret that contains another is replaced whole.
pub fn redact(text: &str, secrets: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> =
        secrets.iter().filter(|(k, _)| !k.is_empty()).collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut out = text.to_string();
    for (secret, placeholder) in pairs {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), placeholder);
        }
    }
    out
}

/// Sanitise an error, keeping its status code.
///
/// Returns the error untouched when nothing needed replacing.
pub fn sanitize_error(err: DatabaseError, secrets: &HashMap<String, String>) -> DatabaseError {
    if contains_url_error(&err) {
        return match err {
            DatabaseError::Status(status) => {
                DatabaseError::Status(status.with_message(URL_PARSE_ERROR_MESSAGE))
            }
            _ => DatabaseError::adapter(URL_PARSE_ERROR_MESSAGE),
        };
    }

    match err {
        DatabaseError::Status(status) => {
            let message = redact(&status.message, secrets);
            if message == status.message {
                DatabaseError::Status(status)
            } else {
                DatabaseError::Status(status.with_message(message))
            }
        }
        DatabaseError::InvalidArgument(message) => {
            DatabaseError::InvalidArgument(redact(&message, secrets))
        }
        other => {
            let original = other.to_string();
            let message = redact(&original, secrets);
            if message == original {
                other
            } else {
                DatabaseError::adapter(message)
            }
        }
    }
}

#[async_trait]
impl<D: Database> Database for ErrorSanitizer<D> {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        self.next.initialize(req).await.map_err(|e| self.sanitize(e))
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        self.next.new_user(req).await.map_err(|e| self.sanitize(e))
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        self.next.update_user(req).await.map_err(|e| self.sanitize(e))
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        self.next.delete_user(req).await.map_err(|e| self.sanitize(e))
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        self.next.type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.next.close().await.map_err(|e| self.sanitize(e))
    }
}
