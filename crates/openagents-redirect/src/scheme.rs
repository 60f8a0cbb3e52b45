//! Host-delivered callbacks: custom URL schemes and app links, where the host
//! hands the process a URL instead of the operation owning a listener.

use std::sync::Arc;

use url::Url;

use crate::channel::{
    ChannelBinding, ChannelDescriptor, CloseOnce, ReturnChannel, ReturnTransport,
};
use crate::error::RedirectError;
use crate::identity::OperationId;
use crate::lifecycle::{OfferOutcome, PendingRegistry};
use crate::matcher::CallbackPattern;

pub struct SchemeTransport {
    scheme: String,
    callback_uri: Option<Url>,
}

impl SchemeTransport {
    #[must_use]
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into().trim().to_ascii_lowercase(),
            callback_uri: None,
        }
    }

    /// URI advertised to the external agent, e.g. `myapp://oauth/callback`.
    #[must_use]
    pub fn with_callback_uri(mut self, callback_uri: Url) -> Self {
        self.callback_uri = Some(callback_uri);
        self
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }
}

impl ReturnTransport for SchemeTransport {
    fn name(&self) -> &'static str {
        "scheme"
    }

    fn attribute(&self) -> Option<String> {
        Some(self.scheme.clone())
    }

    fn open(&self, binding: ChannelBinding) -> Result<Box<dyn ReturnChannel>, RedirectError> {
        if self.scheme.is_empty() {
            return Err(RedirectError::Transport {
                message: "scheme transport requires a non-empty scheme".to_string(),
            });
        }
        Ok(Box::new(SchemeChannel {
            operation_id: binding.operation_id,
            scheme: self.scheme.clone(),
            descriptor: ChannelDescriptor {
                callback_uri: self.callback_uri.clone(),
                ..ChannelDescriptor::default()
            },
            close: CloseOnce::default(),
        }))
    }
}

struct SchemeChannel {
    operation_id: OperationId,
    scheme: String,
    descriptor: ChannelDescriptor,
    close: CloseOnce,
}

impl ReturnChannel for SchemeChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor.clone()
    }

    fn close(&self) {
        if self.close.begin_close() {
            tracing::debug!(
                operation_id = %self.operation_id,
                scheme = %self.scheme,
                "Scheme channel closed"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub enum Delivery {
    Accepted(OperationId),
    /// The matching operation failed while evaluating the URL.
    Failed {
        operation_id: OperationId,
        error: RedirectError,
    },
    /// No pending operation claimed the URL.
    Unclaimed,
}

/// Routes URLs handed over by the host to the pending operation they belong to.
pub struct SchemeRouter {
    registry: Arc<PendingRegistry>,
}

impl SchemeRouter {
    #[must_use]
    pub fn new(registry: Arc<PendingRegistry>) -> Self {
        Self { registry }
    }

    /// Offers `raw` to every pending operation registered for its scheme, oldest
    /// first, until one accepts it. An operation whose validator rejects the
    /// URL does not stop the search.
    pub async fn deliver(&self, raw: &str) -> Delivery {
        let scheme = match Url::parse(raw.trim()) {
            Ok(uri) => uri.scheme().to_string(),
            Err(error) => {
                tracing::debug!(%error, "Ignoring unparsable host-delivered url");
                return Delivery::Unclaimed;
            }
        };
        let pattern = CallbackPattern::any().with_scheme(scheme.clone());
        for (operation_id, sink) in self.registry.matching_attribute(&scheme) {
            match sink.offer(raw, &pattern).await {
                OfferOutcome::Accepted(_) => return Delivery::Accepted(operation_id),
                OfferOutcome::Failed(error) => {
                    return Delivery::Failed {
                        operation_id,
                        error,
                    };
                }
                OfferOutcome::Rejected(_) | OfferOutcome::AlreadyResolved => {}
            }
        }
        tracing::debug!(scheme = %scheme, "No pending operation claimed host-delivered url");
        Delivery::Unclaimed
    }

    /// Reports that the host's authentication UI was dismissed for `operation_id`.
    pub fn dismissed(&self, operation_id: &OperationId) -> bool {
        self.registry
            .lookup(operation_id)
            .is_some_and(|sink| sink.dismissed())
    }
}
