//! Same-page redirects: the opener navigates away, so the pending operation is
//! persisted and picked up again when the page reloads on the callback URI.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::store::{KeyValueStore, StoreError};
use crate::error::RedirectError;
use crate::identity::OperationId;
use crate::matcher::{CallbackPattern, CallbackValidator, MatchOutcome, evaluate};
use crate::resolution::Resolution;

pub const PENDING_RESUME_KEY: &str = "openagents.redirect.pending";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResume {
    pub operation_id: OperationId,
    /// Callback URI the reloaded page must match; absent means any URI.
    #[serde(default)]
    pub expected_callback: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl PendingResume {
    fn pattern(&self) -> Result<CallbackPattern, RedirectError> {
        match self.expected_callback.as_deref() {
            None => Ok(CallbackPattern::any()),
            Some(raw) => Url::parse(raw)
                .map(|uri| CallbackPattern::from_callback_uri(&uri))
                .map_err(|error| {
                    RedirectError::malformed_resume(format!("expected callback {raw}: {error}"))
                }),
        }
    }
}

pub(crate) fn persist(
    session: &dyn KeyValueStore,
    record: &PendingResume,
) -> Result<(), RedirectError> {
    let encoded = serde_json::to_string(record).map_err(|error| RedirectError::Transport {
        message: format!("failed to encode pending resume: {error}"),
    })?;
    session
        .set(PENDING_RESUME_KEY, &encoded)
        .map_err(|error| RedirectError::Transport {
            message: error.to_string(),
        })
}

/// Removes the pending record if it still belongs to `operation_id`. A record
/// written by a later operation, or one that no longer parses, is left alone.
pub(crate) fn discard(
    session: &dyn KeyValueStore,
    operation_id: &OperationId,
) -> Result<bool, StoreError> {
    let Some(raw) = session.get(PENDING_RESUME_KEY)? else {
        return Ok(false);
    };
    let owned = serde_json::from_str::<PendingResume>(&raw)
        .is_ok_and(|record| record.operation_id == *operation_id);
    if owned {
        session.remove(PENDING_RESUME_KEY)?;
    }
    Ok(owned)
}

/// Entry point for a freshly loaded page that may be the tail end of a
/// same-page redirect.
pub struct SamePageResume {
    session: Arc<dyn KeyValueStore>,
}

impl SamePageResume {
    #[must_use]
    pub fn new(session: Arc<dyn KeyValueStore>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        matches!(self.session.get(PENDING_RESUME_KEY), Ok(Some(_)))
    }

    /// Consumes the pending record, if any, and resolves it against the URI the
    /// page was loaded with. Returns `None` when nothing was pending.
    pub async fn resume_if_pending(
        &self,
        current_uri: &str,
        validator: &CallbackValidator,
    ) -> Option<Resolution> {
        let raw = match self.session.get(PENDING_RESUME_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                return Some(Resolution::Failed(RedirectError::Transport {
                    message: error.to_string(),
                }));
            }
        };
        if let Err(error) = self.session.remove(PENDING_RESUME_KEY) {
            tracing::warn!(%error, "Failed to clear pending resume record");
        }

        let resolution = Self::resolve(&raw, current_uri, validator).await;
        tracing::info!(outcome = %resolution, "Same-page redirect resumed");
        Some(resolution)
    }

    async fn resolve(raw: &str, current_uri: &str, validator: &CallbackValidator) -> Resolution {
        let record = match serde_json::from_str::<PendingResume>(raw) {
            Ok(record) => record,
            Err(error) => {
                return Resolution::Failed(RedirectError::malformed_resume(error.to_string()));
            }
        };
        if let Some(deadline) = record.deadline
            && Utc::now() > deadline
        {
            tracing::debug!(
                operation_id = %record.operation_id,
                %deadline,
                "Pending resume expired"
            );
            return Resolution::Failed(RedirectError::ResumeExpired);
        }
        let pattern = match record.pattern() {
            Ok(pattern) => pattern,
            Err(error) => return Resolution::Failed(error),
        };
        match evaluate(current_uri, &pattern, validator).await {
            MatchOutcome::Accept(uri) => Resolution::Succeeded(uri),
            MatchOutcome::SoftReject(reason) => {
                tracing::debug!(
                    operation_id = %record.operation_id,
                    reason = reason.as_str(),
                    "Resumed page does not carry the expected callback"
                );
                Resolution::Failed(RedirectError::ResumeRejected {
                    uri: current_uri.to_string(),
                })
            }
            MatchOutcome::HardFail(error) => Resolution::Failed(error),
        }
    }
}
