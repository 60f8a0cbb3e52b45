use std::sync::Arc;

use thiserror::Error;

/// Coarse error classes a caller can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectErrorKind {
    NoPortAvailable,
    LaunchError,
    ValidatorThrew,
    MalformedResumeState,
    Other,
}

impl RedirectErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPortAvailable => "no_port_available",
            Self::LaunchError => "launch_error",
            Self::ValidatorThrew => "validator_threw",
            Self::MalformedResumeState => "malformed_resume_state",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("external surface blocked: {reason}")]
    Blocked { reason: String },
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("presentation {presentation} is not supported by this launcher")]
    Unsupported { presentation: String },
    #[error("invalid launch url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// Returned by a callback validator in place of a boolean when it cannot decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidatorError {
    pub message: String,
}

impl ValidatorError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RedirectError {
    #[error("no port available on {host} (tried {candidates})")]
    NoPortAvailable { host: String, candidates: String },
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("callback validator failed: {message}")]
    ValidatorThrew { message: String },
    #[error("malformed resume state: {message}")]
    MalformedResumeState { message: String },
    #[error("resumed callback {uri} does not belong to the pending operation")]
    ResumeRejected { uri: String },
    #[error("pending operation expired before the page resumed")]
    ResumeExpired,
    #[error("begin requires a tokio runtime context")]
    NoRuntime,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("transport failed: {message}")]
    Transport { message: String },
}

impl RedirectError {
    #[must_use]
    pub fn kind(&self) -> RedirectErrorKind {
        match self {
            Self::NoPortAvailable { .. } => RedirectErrorKind::NoPortAvailable,
            Self::Launch(_) => RedirectErrorKind::LaunchError,
            Self::ValidatorThrew { .. } => RedirectErrorKind::ValidatorThrew,
            Self::MalformedResumeState { .. } => RedirectErrorKind::MalformedResumeState,
            Self::ResumeRejected { .. }
            | Self::ResumeExpired
            | Self::NoRuntime
            | Self::Io { .. }
            | Self::Transport { .. } => RedirectErrorKind::Other,
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            context,
            source: Arc::new(source),
        }
    }

    pub(crate) fn malformed_resume(message: impl Into<String>) -> Self {
        Self::MalformedResumeState {
            message: message.into(),
        }
    }
}

impl From<ValidatorError> for RedirectError {
    fn from(error: ValidatorError) -> Self {
        Self::ValidatorThrew {
            message: error.message,
        }
    }
}
