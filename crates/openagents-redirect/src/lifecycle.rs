//! Lifecycle controller: `begin`, timeout race, cancellation, and the single
//! cleanup pass that follows whichever resolution wins.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use url::Url;

use crate::channel::{ChannelBinding, ChannelDescriptor, ReturnChannel, ReturnTransport};
use crate::error::{LaunchError, RedirectError};
use crate::identity::OperationId;
use crate::launcher::{ExternalSurface, Launcher, Presentation};
use crate::matcher::{CallbackPattern, CallbackValidator, MatchOutcome, RejectReason, evaluate};
use crate::registry::OperationRegistry;
use crate::resolution::{CancelReason, OperationState, Resolution, ResolutionSink};

pub type PendingRegistry = OperationRegistry<CandidateSink>;

pub struct BeginOptions {
    pub transport: Arc<dyn ReturnTransport>,
    pub timeout: Option<Duration>,
    pub validator: CallbackValidator,
    pub presentation: Presentation,
    /// When set, the channel's callback URI is appended to the launch URL under
    /// this query parameter (typically `redirect_uri`).
    pub redirect_param: Option<String>,
}

impl BeginOptions {
    #[must_use]
    pub fn new(transport: Arc<dyn ReturnTransport>) -> Self {
        Self {
            transport,
            timeout: None,
            validator: CallbackValidator::None,
            presentation: Presentation::default(),
            redirect_param: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: CallbackValidator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_presentation(mut self, presentation: Presentation) -> Self {
        self.presentation = presentation;
        self
    }

    #[must_use]
    pub fn with_redirect_param(mut self, param: impl Into<String>) -> Self {
        self.redirect_param = Some(param.into());
        self
    }
}

#[derive(Default)]
struct Resources {
    released: bool,
    channel: Option<Arc<dyn ReturnChannel>>,
    surface: Option<Arc<dyn ExternalSurface>>,
    tasks: Vec<AbortHandle>,
}

struct OperationCore {
    id: OperationId,
    transport: &'static str,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    validator: CallbackValidator,
    sink: ResolutionSink,
    descriptor: OnceLock<ChannelDescriptor>,
    resources: Mutex<Resources>,
    registry: Weak<PendingRegistry>,
}

impl OperationCore {
    fn lock_resources(&self) -> MutexGuard<'_, Resources> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, resolution: Resolution) -> bool {
        let summary = resolution.to_string();
        let awaiting_resume = matches!(resolution, Resolution::AwaitingResume);
        if !self
            .sink
            .complete_after(resolution, || self.release(awaiting_resume))
        {
            tracing::debug!(
                operation_id = %self.id,
                attempted = %summary,
                "Ignoring late resolution"
            );
            return false;
        }
        tracing::info!(
            operation_id = %self.id,
            transport = self.transport,
            outcome = %summary,
            "Redirect operation resolved"
        );
        true
    }

    fn release(&self, awaiting_resume: bool) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        let (channel, surface, tasks) = {
            let mut resources = self.lock_resources();
            resources.released = true;
            (
                resources.channel.take(),
                resources.surface.take(),
                std::mem::take(&mut resources.tasks),
            )
        };
        for task in tasks {
            task.abort();
        }
        match channel {
            Some(channel) if awaiting_resume => channel.hand_off(),
            Some(channel) => channel.close(),
            None => {}
        }
        if let Some(surface) = surface
            && !awaiting_resume
        {
            surface.close();
        }
    }

    fn attach_channel(&self, channel: Arc<dyn ReturnChannel>) {
        let mut resources = self.lock_resources();
        if resources.released {
            drop(resources);
            channel.close();
            return;
        }
        resources.channel = Some(channel);
    }

    fn attach_surface(&self, surface: Arc<dyn ExternalSurface>) {
        let mut resources = self.lock_resources();
        if resources.released {
            drop(resources);
            surface.close();
            return;
        }
        resources.surface = Some(surface);
    }

    fn attach_task(&self, task: AbortHandle) {
        let mut resources = self.lock_resources();
        if resources.released {
            drop(resources);
            task.abort();
            return;
        }
        resources.tasks.push(task);
    }
}

/// Result of offering a candidate callback to an operation.
#[derive(Debug, Clone)]
pub enum OfferOutcome {
    Accepted(Url),
    Rejected(RejectReason),
    Failed(RedirectError),
    /// Another path resolved the operation first; the offer had no effect.
    AlreadyResolved,
}

/// The only handle a return channel gets on its operation: it can offer
/// candidates, report dismissal, or report a transport fault.
#[derive(Clone)]
pub struct CandidateSink {
    core: Arc<OperationCore>,
}

impl fmt::Debug for CandidateSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateSink")
            .field("operation_id", &self.core.id)
            .field("resolved", &self.core.sink.is_claimed())
            .finish()
    }
}

impl CandidateSink {
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.core.id
    }

    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.core.deadline
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.core.sink.is_claimed()
    }

    pub async fn offer(&self, raw: &str, pattern: &CallbackPattern) -> OfferOutcome {
        if self.core.sink.is_claimed() {
            return OfferOutcome::AlreadyResolved;
        }
        match evaluate(raw, pattern, &self.core.validator).await {
            MatchOutcome::Accept(uri) => {
                if self.core.resolve(Resolution::Succeeded(uri.clone())) {
                    OfferOutcome::Accepted(uri)
                } else {
                    OfferOutcome::AlreadyResolved
                }
            }
            MatchOutcome::SoftReject(reason) => {
                tracing::debug!(
                    operation_id = %self.core.id,
                    reason = reason.as_str(),
                    "Callback candidate rejected"
                );
                OfferOutcome::Rejected(reason)
            }
            MatchOutcome::HardFail(error) => {
                if self.core.resolve(Resolution::Failed(error.clone())) {
                    OfferOutcome::Failed(error)
                } else {
                    OfferOutcome::AlreadyResolved
                }
            }
        }
    }

    pub fn dismissed(&self) -> bool {
        self.core.resolve(Resolution::Cancelled(CancelReason::Dismissed))
    }

    pub fn fail(&self, error: RedirectError) -> bool {
        self.core.resolve(Resolution::Failed(error))
    }
}

/// Caller-side view of one operation. Clones share the same operation.
#[derive(Clone)]
pub struct OperationHandle {
    core: Arc<OperationCore>,
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

impl OperationHandle {
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.core.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.core.created_at
    }

    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.core.deadline
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<ChannelDescriptor> {
        self.core.descriptor.get().cloned()
    }

    /// Resolves the operation as cancelled if it is still pending. Returns
    /// whether this call was the one that resolved it.
    pub fn cancel(&self) -> bool {
        self.core.resolve(Resolution::Cancelled(CancelReason::Caller))
    }

    pub async fn result(&self) -> Resolution {
        self.core.sink.wait().await
    }

    #[must_use]
    pub fn try_result(&self) -> Option<Resolution> {
        self.core.sink.peek()
    }

    #[must_use]
    pub fn state(&self) -> OperationState {
        OperationState::from(self.core.sink.peek())
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.core.sink.is_claimed()
    }
}

/// Starts redirect operations and owns the table of pending ones.
pub struct RedirectController {
    launcher: Arc<dyn Launcher>,
    registry: Arc<PendingRegistry>,
}

impl RedirectController {
    #[must_use]
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self::with_registry(launcher, Arc::new(PendingRegistry::new()))
    }

    #[must_use]
    pub fn with_registry(launcher: Arc<dyn Launcher>, registry: Arc<PendingRegistry>) -> Self {
        Self { launcher, registry }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<PendingRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Registers an operation, opens its return channel, launches the external
    /// agent and arms the timeout. Never blocks on the callback; failures before
    /// launch are reported through the returned handle.
    pub fn begin(&self, url: &str, options: BeginOptions) -> OperationHandle {
        let started = tokio::time::Instant::now();
        let id = OperationId::generate();
        let created_at = Utc::now();
        let expiry = options
            .timeout
            .and_then(|timeout| expiry_for(started, created_at, timeout));
        if expiry.is_none() && options.timeout.is_some() {
            tracing::debug!(
                operation_id = %id,
                "Timeout exceeds representable deadline; running without one"
            );
        }
        let deadline = expiry.map(|(_, deadline)| deadline);
        let timeout = expiry.and(options.timeout);
        let BeginOptions {
            transport,
            timeout: _,
            validator,
            presentation,
            redirect_param,
        } = options;

        let core = Arc::new(OperationCore {
            id,
            transport: transport.name(),
            created_at,
            deadline,
            validator,
            sink: ResolutionSink::new(),
            descriptor: OnceLock::new(),
            resources: Mutex::new(Resources::default()),
            registry: Arc::downgrade(&self.registry),
        });
        let handle = OperationHandle {
            core: Arc::clone(&core),
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                core.resolve(Resolution::Failed(RedirectError::NoRuntime));
                return handle;
            }
        };

        let mut launch_url = match Url::parse(url.trim()) {
            Ok(parsed) => parsed,
            Err(error) => {
                core.resolve(Resolution::Failed(RedirectError::Launch(
                    LaunchError::InvalidUrl {
                        url: url.to_string(),
                        message: error.to_string(),
                    },
                )));
                return handle;
            }
        };

        let sink = CandidateSink {
            core: Arc::clone(&core),
        };
        let attribute = transport.attribute();
        if let Err(error) = self
            .registry
            .insert(id, attribute.as_deref(), sink.clone())
        {
            core.resolve(Resolution::Failed(RedirectError::Transport {
                message: error.to_string(),
            }));
            return handle;
        }
        tracing::debug!(
            operation_id = %id,
            transport = transport.name(),
            attribute = attribute.as_deref().unwrap_or(""),
            "Registered redirect operation"
        );

        let binding = ChannelBinding {
            operation_id: id,
            created_at,
            deadline,
            presentation,
            sink,
        };
        let channel: Arc<dyn ReturnChannel> = match transport.open(binding) {
            Ok(channel) => Arc::from(channel),
            Err(error) => {
                tracing::warn!(operation_id = %id, %error, "Failed to open return channel");
                core.resolve(Resolution::Failed(error));
                return handle;
            }
        };
        let descriptor = channel.descriptor();
        let _ = core.descriptor.set(descriptor.clone());
        core.attach_channel(Arc::clone(&channel));

        if let Some(param) = redirect_param.as_deref()
            && let Some(callback_uri) = descriptor.callback_uri.as_ref()
        {
            launch_url
                .query_pairs_mut()
                .append_pair(param, callback_uri.as_str());
        }

        if core.sink.is_claimed() {
            return handle;
        }

        match self.launcher.launch(&launch_url, &presentation) {
            Ok(surface) => {
                core.attach_surface(Arc::clone(&surface));
                channel.watch_surface(surface);
            }
            Err(error) => {
                tracing::warn!(operation_id = %id, %error, "Failed to launch external agent");
                core.resolve(Resolution::Failed(RedirectError::Launch(error)));
                return handle;
            }
        }

        if descriptor.awaits_resume {
            core.resolve(Resolution::AwaitingResume);
            return handle;
        }

        if let Some((wake_at, _)) = expiry {
            let weak = Arc::downgrade(&core);
            let timer = runtime.spawn(async move {
                tokio::time::sleep_until(wake_at).await;
                if let Some(core) = weak.upgrade() {
                    core.resolve(Resolution::Cancelled(CancelReason::Timeout));
                }
            });
            core.attach_task(timer.abort_handle());
        }

        tracing::info!(
            operation_id = %id,
            transport = core.transport,
            presentation = %presentation,
            timeout_ms = timeout.map(|timeout| timeout.as_millis() as u64),
            "Redirect operation started"
        );
        handle
    }
}

/// Timer instant and wall-clock deadline for `timeout`, or `None` when either
/// would overflow.
fn expiry_for(
    started: tokio::time::Instant,
    created_at: DateTime<Utc>,
    timeout: Duration,
) -> Option<(tokio::time::Instant, DateTime<Utc>)> {
    let wake_at = started.checked_add(timeout)?;
    let deadline = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| created_at.checked_add_signed(timeout))?;
    Some((wake_at, deadline))
}
