use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::RedirectError;
use crate::identity::OperationId;
use crate::launcher::{ExternalSurface, Presentation};
use crate::lifecycle::CandidateSink;

/// What a freshly opened return channel tells the controller about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// URI the external agent should redirect to, when the transport has one.
    pub callback_uri: Option<Url>,
    pub channel_name: Option<String>,
    pub port: Option<u16>,
    /// The operation continues after a full page reload instead of in memory.
    pub awaits_resume: bool,
}

/// Everything a transport receives when it opens a channel for an operation.
#[derive(Clone)]
pub struct ChannelBinding {
    pub operation_id: OperationId,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub presentation: Presentation,
    pub sink: CandidateSink,
}

/// A delivery mechanism for callbacks (loopback HTTP, broadcast channel, host
/// URL events). One transport value may open channels for many operations.
pub trait ReturnTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Secondary registry key, for transports where the host routes callbacks
    /// by attribute rather than by operation id.
    fn attribute(&self) -> Option<String> {
        None
    }

    fn open(&self, binding: ChannelBinding) -> Result<Box<dyn ReturnChannel>, RedirectError>;
}

/// Listener bound to one operation. `close` must be safe to call repeatedly.
pub trait ReturnChannel: Send + Sync {
    fn descriptor(&self) -> ChannelDescriptor;

    /// Called once the external surface exists, for transports that detect
    /// user dismissal.
    fn watch_surface(&self, _surface: Arc<dyn ExternalSurface>) {}

    fn close(&self);

    /// Called instead of [`close`](Self::close) when the operation resolved as
    /// awaiting resume: state the reloaded page needs must outlive the channel.
    fn hand_off(&self) {
        self.close();
    }
}

/// Latch that lets exactly one caller run teardown.
#[derive(Debug, Default)]
pub(crate) struct CloseOnce {
    closed: AtomicBool,
}

impl CloseOnce {
    pub(crate) fn begin_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
