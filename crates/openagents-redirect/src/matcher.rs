use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use url::Url;

use crate::error::{RedirectError, ValidatorError};

/// Structural identity of the callbacks an operation will accept.
///
/// Unset fields match anything; an empty pattern accepts every syntactically
/// valid URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackPattern {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub path_prefix: Option<String>,
}

impl CallbackPattern {
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Pattern pinned to the scheme, host, port and path of `uri`. Query and
    /// fragment are ignored.
    #[must_use]
    pub fn from_callback_uri(uri: &Url) -> Self {
        Self {
            scheme: Some(uri.scheme().to_string()),
            host: uri.host_str().map(str::to_string),
            port: uri.port_or_known_default(),
            path: Some(uri.path().to_string()),
            path_prefix: None,
        }
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn matches(&self, uri: &Url) -> bool {
        if let Some(scheme) = &self.scheme
            && !scheme.eq_ignore_ascii_case(uri.scheme())
        {
            return false;
        }
        if let Some(host) = &self.host {
            let Some(candidate) = uri.host_str() else {
                return false;
            };
            if !host.eq_ignore_ascii_case(candidate) {
                return false;
            }
        }
        if let Some(port) = self.port
            && uri.port_or_known_default() != Some(port)
        {
            return false;
        }
        if let Some(path) = &self.path
            && normalize_path(path) != normalize_path(uri.path())
        {
            return false;
        }
        if let Some(prefix) = &self.path_prefix
            && !uri.path().starts_with(prefix.as_str())
        {
            return false;
        }
        true
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

#[async_trait]
pub trait AsyncCallbackValidator: Send + Sync {
    async fn validate(&self, uri: &Url) -> Result<bool, ValidatorError>;
}

type SyncValidatorFn = dyn Fn(&Url) -> Result<bool, ValidatorError> + Send + Sync;

/// Caller-supplied predicate consulted after the structural pattern matches.
#[derive(Clone, Default)]
pub enum CallbackValidator {
    #[default]
    None,
    Sync(Arc<SyncValidatorFn>),
    Async(Arc<dyn AsyncCallbackValidator>),
}

impl fmt::Debug for CallbackValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("CallbackValidator::None"),
            Self::Sync(_) => f.write_str("CallbackValidator::Sync(..)"),
            Self::Async(_) => f.write_str("CallbackValidator::Async(..)"),
        }
    }
}

impl CallbackValidator {
    pub fn fallible<F>(validator: F) -> Self
    where
        F: Fn(&Url) -> Result<bool, ValidatorError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(validator))
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(move |uri: &Url| Ok(predicate(uri))))
    }

    pub fn asynchronous(validator: impl AsyncCallbackValidator + 'static) -> Self {
        Self::Async(Arc::new(validator))
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Runs the validator. A panic inside the validator is reported as an
    /// error rather than unwinding into the transport.
    pub async fn check(&self, uri: &Url) -> Result<bool, ValidatorError> {
        match self {
            Self::None => Ok(true),
            Self::Sync(validator) => std::panic::catch_unwind(AssertUnwindSafe(|| validator(uri)))
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()))),
            Self::Async(validator) => AssertUnwindSafe(validator.validate(uri))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> ValidatorError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ValidatorError::new(format!("validator panicked: {detail}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unparsable,
    PatternMismatch,
    ValidatorDeclined,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unparsable => "unparsable",
            Self::PatternMismatch => "pattern_mismatch",
            Self::ValidatorDeclined => "validator_declined",
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Accept(Url),
    SoftReject(RejectReason),
    HardFail(RedirectError),
}

/// Decides whether `raw` is the callback an operation is waiting for.
///
/// Unparsable input, pattern mismatches and a validator answering `false` are
/// soft rejects; only a failing validator is a hard failure.
pub async fn evaluate(
    raw: &str,
    pattern: &CallbackPattern,
    validator: &CallbackValidator,
) -> MatchOutcome {
    let uri = match Url::parse(raw.trim()) {
        Ok(uri) => uri,
        Err(error) => {
            tracing::debug!(%error, candidate = %raw, "Ignoring unparsable callback candidate");
            return MatchOutcome::SoftReject(RejectReason::Unparsable);
        }
    };
    if !pattern.matches(&uri) {
        tracing::debug!(candidate = %uri, "Callback candidate does not match operation pattern");
        return MatchOutcome::SoftReject(RejectReason::PatternMismatch);
    }
    match validator.check(&uri).await {
        Ok(true) => MatchOutcome::Accept(uri),
        Ok(false) => {
            tracing::debug!(candidate = %uri, "Callback validator declined candidate");
            MatchOutcome::SoftReject(RejectReason::ValidatorDeclined)
        }
        Err(error) => MatchOutcome::HardFail(error.into()),
    }
}

/// First value of query parameter `key` in `uri`.
#[must_use]
pub fn query_param(uri: &Url, key: &str) -> Option<String> {
    uri.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}
