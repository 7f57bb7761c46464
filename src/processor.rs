//! Per-request orchestration: validation, idempotency, and the
//! download, derive, upload, status-update sequence.
//!
//! Processing is idempotent by construction: derivative names are a pure
//! function of the source name and uploads are last-write-wins, so
//! redelivering a message any number of times yields the same result.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SOURCE_BUCKET;
use crate::derive::DerivationEngine;
use crate::error::Result;
use crate::message::JobRequest;
use crate::status::StatusStore;
use crate::storage::ObjectStore;

/// Suffix of the primary derivative name
pub const THUMB_SUFFIX: &str = ".thumb.jpg";
/// Suffix of the secondary (retina) derivative name
pub const THUMB_2X_SUFFIX: &str = ".thumb@2x.jpg";

const CONTENT_TYPE: &str = "image/jpeg";
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Why a request was skipped instead of processed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// `blob.name` absent or empty
    MissingName,
    /// `blob.container` is not the source container
    ForeignContainer,
    /// The name already carries a derivative suffix
    AlreadyDerivative,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingName => write!(f, "missing blob name"),
            SkipReason::ForeignContainer => write!(f, "not the source container"),
            SkipReason::AlreadyDerivative => write!(f, "already a derivative"),
        }
    }
}

/// Terminal result of processing one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Derivatives exist and the status record was updated
    Processed {
        thumb_url: String,
        thumb2x_url: Option<String>,
    },
    /// Request failed validation and was acknowledged without processing
    Skipped(SkipReason),
    /// Source object was gone by the time we looked
    NotFound,
}

/// Destination name for the primary derivative of `name`
pub fn primary_name(name: &str) -> String {
    format!("{name}{THUMB_SUFFIX}")
}

/// Destination name for the secondary derivative of `name`
pub fn secondary_name(name: &str) -> String {
    format!("{name}{THUMB_2X_SUFFIX}")
}

/// Whether `name` is itself a derivative. Processing one would feed the
/// pipeline its own output.
pub fn is_derivative_name(name: &str) -> bool {
    name.ends_with(THUMB_SUFFIX) || name.ends_with(THUMB_2X_SUFFIX)
}

fn normalize_container(container: &str) -> String {
    container.trim().to_ascii_lowercase()
}

/// Orchestrates the pipeline for a single decoded request
pub struct JobProcessor<S: ObjectStore, T: StatusStore> {
    store: Arc<S>,
    status: Arc<T>,
    engine: Arc<DerivationEngine>,
    thumbs_bucket: String,
}

impl<S: ObjectStore, T: StatusStore> JobProcessor<S, T> {
    pub fn new(
        store: Arc<S>,
        status: Arc<T>,
        engine: Arc<DerivationEngine>,
        thumbs_bucket: String,
    ) -> Self {
        Self {
            store,
            status,
            engine,
            thumbs_bucket,
        }
    }

    /// Run one request through validation, the idempotent cheap path, and
    /// the full derivation path.
    pub async fn process(&self, request: &JobRequest) -> Result<Outcome> {
        let name = match request.blob.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => return Ok(Outcome::Skipped(SkipReason::MissingName)),
        };

        // An absent container predates the field and always meant the
        // source container.
        let container = request.blob.container.as_deref().unwrap_or(SOURCE_BUCKET);
        if normalize_container(container) != SOURCE_BUCKET {
            return Ok(Outcome::Skipped(SkipReason::ForeignContainer));
        }

        if is_derivative_name(name) {
            return Ok(Outcome::Skipped(SkipReason::AlreadyDerivative));
        }

        let thumb_key = primary_name(name);
        let thumb2x_key = secondary_name(name);
        let thumb_url = self.store.public_url(&self.thumbs_bucket, &thumb_key);

        // Cheap path: a previous delivery already produced the primary
        // derivative, only the status record needs to converge.
        if self.store.exists(&self.thumbs_bucket, &thumb_key).await? {
            let thumb2x_url = if self.engine.secondary_enabled()
                && self.store.exists(&self.thumbs_bucket, &thumb2x_key).await?
            {
                Some(self.store.public_url(&self.thumbs_bucket, &thumb2x_key))
            } else {
                None
            };

            info!(name = %name, "Derivative already exists, refreshing status only");
            self.update_status(request, &thumb_url, thumb2x_url.as_deref())
                .await;
            return Ok(Outcome::Processed {
                thumb_url,
                thumb2x_url,
            });
        }

        let source = match self.store.download(SOURCE_BUCKET, name).await? {
            Some(bytes) => bytes,
            None => {
                warn!(name = %name, "Source object not found, skipping");
                return Ok(Outcome::NotFound);
            }
        };

        let derived = self.engine.clone().derive_async(source).await?;
        let (primary_w, primary_h) = (derived.primary.width, derived.primary.height);

        self.store
            .upload(
                &self.thumbs_bucket,
                &thumb_key,
                derived.primary.data,
                CONTENT_TYPE,
                CACHE_CONTROL,
            )
            .await?;

        let thumb2x_url = match derived.secondary {
            Some(secondary) => {
                self.store
                    .upload(
                        &self.thumbs_bucket,
                        &thumb2x_key,
                        secondary.data,
                        CONTENT_TYPE,
                        CACHE_CONTROL,
                    )
                    .await?;
                Some(self.store.public_url(&self.thumbs_bucket, &thumb2x_key))
            }
            None => None,
        };

        self.update_status(request, &thumb_url, thumb2x_url.as_deref())
            .await;

        info!(
            name = %name,
            width = primary_w,
            height = primary_h,
            thumb = %thumb_key,
            "Derivatives uploaded"
        );

        Ok(Outcome::Processed {
            thumb_url,
            thumb2x_url,
        })
    }

    /// Flip the job record to done. Store trouble is logged, never fatal:
    /// the artifact already exists and redelivery converges the record.
    async fn update_status(&self, request: &JobRequest, thumb_url: &str, thumb2x_url: Option<&str>) {
        let key = match request.key() {
            Some(key) => key,
            None => {
                warn!("Job request carries neither id nor url, status not updated");
                return;
            }
        };

        match self.status.mark_done(&key, thumb_url, thumb2x_url).await {
            Ok(rows) => debug!(key = %key, rows, "Status update applied"),
            Err(e) => {
                warn!(key = %key, error = %e, "Status update failed, leaving record to redelivery")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivative_names_are_deterministic() {
        assert_eq!(primary_name("cat.png"), "cat.png.thumb.jpg");
        assert_eq!(secondary_name("cat.png"), "cat.png.thumb@2x.jpg");
        assert_eq!(primary_name("cat.png"), primary_name("cat.png"));
    }

    #[test]
    fn test_derivative_suffixes_are_recognized() {
        assert!(is_derivative_name("cat.png.thumb.jpg"));
        assert!(is_derivative_name("cat.png.thumb@2x.jpg"));
        assert!(!is_derivative_name("cat.png"));
        assert!(!is_derivative_name("thumb.jpg.png"));
    }

    #[test]
    fn test_container_comparison_is_normalized() {
        assert_eq!(normalize_container(" Uploads "), SOURCE_BUCKET);
        assert_eq!(normalize_container("UPLOADS"), SOURCE_BUCKET);
        assert_ne!(normalize_container("archive"), SOURCE_BUCKET);
    }
}
