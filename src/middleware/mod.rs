//! Adapter middleware.
//!
//! Each wrapper implements [`Database`] around a `next` and is composed in a
//! fixed order, outermost first:
//!
//! ```text
//! ErrorSanitizer -> Tracing -> Metrics -> adapter
//! ```
//!
//! `type_name` passes straight through every layer.

pub mod metrics;
pub mod sanitize;
pub mod trace;

use std::sync::Arc;

use crate::dbplugin::Database;

pub use metrics::{DurationSummary, Metrics, MetricsRegistry};
pub use sanitize::{redact, sanitize_error, ErrorSanitizer, SecretsFn, URL_PARSE_ERROR_MESSAGE};
pub use trace::Tracing;

/// The full chain around `db`.
pub type Wrapped<D> = ErrorSanitizer<Tracing<Metrics<D>>>;

pub fn wrap<D: Database>(
    db: D,
    type_name: &str,
    secrets: SecretsFn,
    registry: Arc<MetricsRegistry>,
) -> Wrapped<D> {
    let metered = Metrics::new(db, type_name, registry);
    let traced = Tracing::new(metered, type_name).with_redaction(Arc::clone(&secrets));
    ErrorSanitizer::new(traced, secrets)
}
