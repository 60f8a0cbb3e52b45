//! Broadcast transport for UI-hosted environments: the callback page runs in
//! an independent context and relays its URI over a named channel that the
//! opener is listening on.

pub mod hub;
pub mod names;
pub mod resume;
pub mod store;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::AbortHandle;
use url::Url;

use crate::channel::{
    ChannelBinding, ChannelDescriptor, CloseOnce, ReturnChannel, ReturnTransport,
};
use crate::error::RedirectError;
use crate::identity::OperationId;
use crate::launcher::{ExternalSurface, Presentation};
use crate::lifecycle::{CandidateSink, OfferOutcome};
use crate::matcher::CallbackPattern;

pub use hub::{BroadcastHub, HostEvent, HostEventBus};
pub use names::ChannelNameRegistry;
pub use resume::{PENDING_RESUME_KEY, PendingResume, SamePageResume};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};

pub const DEFAULT_PARTITION: &str = "default";
const CHANNEL_NAME_PREFIX: &str = "openagents-redirect";
/// Delay between noticing a closed surface and reporting dismissal, so a
/// callback relayed just before the close still wins.
const DISMISS_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// Fixed channel name. Only one pending operation may use a given name.
    pub channel_name_override: Option<String>,
    /// Origin-like scope shared by the opener and the callback context.
    pub partition: String,
    pub expected_callback: Option<Url>,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            channel_name_override: None,
            partition: DEFAULT_PARTITION.to_string(),
            expected_callback: None,
        }
    }
}

impl BroadcastOptions {
    #[must_use]
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name_override = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    #[must_use]
    pub fn with_expected_callback(mut self, callback: Url) -> Self {
        self.expected_callback = Some(callback);
        self
    }

    fn pattern(&self) -> CallbackPattern {
        self.expected_callback
            .as_ref()
            .map_or_else(CallbackPattern::any, CallbackPattern::from_callback_uri)
    }
}

pub struct BroadcastTransport {
    hub: Arc<BroadcastHub>,
    names: Arc<ChannelNameRegistry>,
    session: Arc<dyn KeyValueStore>,
    events: Option<HostEventBus>,
    options: BroadcastOptions,
}

impl BroadcastTransport {
    #[must_use]
    pub fn new(
        hub: Arc<BroadcastHub>,
        names: Arc<ChannelNameRegistry>,
        session: Arc<dyn KeyValueStore>,
        options: BroadcastOptions,
    ) -> Self {
        Self {
            hub,
            names,
            session,
            events: None,
            options,
        }
    }

    /// Enables close detection driven by host focus and visibility events.
    #[must_use]
    pub fn with_host_events(mut self, events: HostEventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn open_same_page(
        &self,
        binding: &ChannelBinding,
    ) -> Result<Box<dyn ReturnChannel>, RedirectError> {
        let record = PendingResume {
            operation_id: binding.operation_id,
            expected_callback: self.options.expected_callback.as_ref().map(Url::to_string),
            created_at: binding.created_at,
            deadline: binding.deadline,
        };
        resume::persist(self.session.as_ref(), &record)?;
        tracing::info!(operation_id = %binding.operation_id, "Persisted same-page resume record");
        Ok(Box::new(SamePageChannel {
            operation_id: binding.operation_id,
            session: Arc::clone(&self.session),
            descriptor: ChannelDescriptor {
                callback_uri: self.options.expected_callback.clone(),
                awaits_resume: true,
                ..ChannelDescriptor::default()
            },
            close: CloseOnce::default(),
        }))
    }
}

impl ReturnTransport for BroadcastTransport {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn open(&self, binding: ChannelBinding) -> Result<Box<dyn ReturnChannel>, RedirectError> {
        if binding.presentation == Presentation::SamePage {
            return self.open_same_page(&binding);
        }

        let operation_id = binding.operation_id;
        let name = self
            .options
            .channel_name_override
            .clone()
            .unwrap_or_else(|| format!("{CHANNEL_NAME_PREFIX}-{operation_id}"));
        let receiver = self.hub.subscribe(&name);
        self.names
            .register(&self.options.partition, &name)
            .map_err(|error| RedirectError::Transport {
                message: error.to_string(),
            })?;

        let listener = tokio::spawn(listen(
            receiver,
            binding.sink.clone(),
            self.options.pattern(),
            name.clone(),
        ));
        tracing::info!(
            operation_id = %operation_id,
            channel = %name,
            "Broadcast channel listening"
        );

        Ok(Box::new(BroadcastChannel {
            operation_id,
            name: name.clone(),
            partition: self.options.partition.clone(),
            descriptor: ChannelDescriptor {
                callback_uri: self.options.expected_callback.clone(),
                channel_name: Some(name),
                ..ChannelDescriptor::default()
            },
            sink: binding.sink,
            hub: Arc::clone(&self.hub),
            names: Arc::clone(&self.names),
            events: self.events.clone(),
            tasks: Mutex::new(vec![listener.abort_handle()]),
            close: CloseOnce::default(),
        }))
    }
}

async fn listen(
    mut receiver: broadcast::Receiver<String>,
    sink: CandidateSink,
    pattern: CallbackPattern,
    name: String,
) {
    loop {
        let message = match receiver.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(channel = %name, skipped, "Broadcast listener lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match sink.offer(&message, &pattern).await {
            OfferOutcome::Rejected(_) => {}
            OfferOutcome::Accepted(_) | OfferOutcome::Failed(_) | OfferOutcome::AlreadyResolved => {
                return;
            }
        }
    }
}

async fn watch_dismissal(
    mut events: broadcast::Receiver<HostEvent>,
    surface: Arc<dyn ExternalSurface>,
    sink: CandidateSink,
) {
    loop {
        match events.recv().await {
            Ok(event) if !event.may_reveal_dismissal() => continue,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
        if !surface.is_closed() {
            continue;
        }
        tokio::time::sleep(DISMISS_GRACE).await;
        if sink.dismissed() {
            tracing::info!(
                operation_id = %sink.operation_id(),
                "External surface dismissed by user"
            );
        }
        return;
    }
}

struct BroadcastChannel {
    operation_id: OperationId,
    name: String,
    partition: String,
    descriptor: ChannelDescriptor,
    sink: CandidateSink,
    hub: Arc<BroadcastHub>,
    names: Arc<ChannelNameRegistry>,
    events: Option<HostEventBus>,
    tasks: Mutex<Vec<AbortHandle>>,
    close: CloseOnce,
}

impl ReturnChannel for BroadcastChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor.clone()
    }

    fn watch_surface(&self, surface: Arc<dyn ExternalSurface>) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let watcher = tokio::spawn(watch_dismissal(
            events.subscribe(),
            surface,
            self.sink.clone(),
        ));
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.close.is_closed() {
            watcher.abort();
        } else {
            tasks.push(watcher.abort_handle());
        }
    }

    fn close(&self) {
        if !self.close.begin_close() {
            return;
        }
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        if let Err(error) = self.names.unregister(&self.partition, &self.name) {
            tracing::warn!(channel = %self.name, %error, "Failed to unregister broadcast channel");
        }
        self.hub.prune();
        tracing::debug!(
            operation_id = %self.operation_id,
            channel = %self.name,
            "Broadcast channel closed"
        );
    }
}

/// Same-page operations have nothing to listen on. A hand-off leaves the
/// persisted record for [`SamePageResume`]; any other outcome discards it.
struct SamePageChannel {
    operation_id: OperationId,
    session: Arc<dyn KeyValueStore>,
    descriptor: ChannelDescriptor,
    close: CloseOnce,
}

impl ReturnChannel for SamePageChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor.clone()
    }

    fn hand_off(&self) {
        if self.close.begin_close() {
            tracing::debug!(operation_id = %self.operation_id, "Same-page channel handed off");
        }
    }

    fn close(&self) {
        if !self.close.begin_close() {
            return;
        }
        match resume::discard(self.session.as_ref(), &self.operation_id) {
            Ok(removed) => tracing::debug!(
                operation_id = %self.operation_id,
                removed,
                "Same-page channel closed"
            ),
            Err(error) => tracing::warn!(
                operation_id = %self.operation_id,
                %error,
                "Failed to discard pending resume record"
            ),
        }
    }
}

/// Entry point for the callback context: forwards the URI it was loaded with
/// to every opener listening in the partition.
pub struct CallbackRelay {
    hub: Arc<BroadcastHub>,
    names: Arc<ChannelNameRegistry>,
}

impl CallbackRelay {
    #[must_use]
    pub fn new(hub: Arc<BroadcastHub>, names: Arc<ChannelNameRegistry>) -> Self {
        Self { hub, names }
    }

    /// Returns how many listeners received the URI.
    pub fn relay(&self, partition: &str, callback_uri: &str) -> Result<usize, StoreError> {
        let delivered = self
            .names
            .active(partition)?
            .iter()
            .map(|name| self.hub.publish(name, callback_uri))
            .sum();
        tracing::debug!(partition, delivered, "Relayed callback to broadcast channels");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::LaunchError;
    use crate::launcher::Launcher;
    use crate::lifecycle::{BeginOptions, RedirectController};
    use crate::matcher::{CallbackValidator, query_param};
    use crate::resolution::{CancelReason, Resolution};

    #[derive(Default)]
    struct PopupSurface {
        closed: AtomicBool,
    }

    impl ExternalSurface for PopupSurface {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct PopupLauncher {
        surfaces: Mutex<Vec<Arc<PopupSurface>>>,
    }

    impl Launcher for PopupLauncher {
        fn launch(
            &self,
            _url: &Url,
            _presentation: &Presentation,
        ) -> Result<Arc<dyn ExternalSurface>, LaunchError> {
            let surface = Arc::new(PopupSurface::default());
            self.surfaces.lock().expect("surfaces").push(Arc::clone(&surface));
            Ok(surface)
        }
    }

    struct Fixture {
        controller: RedirectController,
        launcher: Arc<PopupLauncher>,
        hub: Arc<BroadcastHub>,
        names: Arc<ChannelNameRegistry>,
        session: Arc<dyn KeyValueStore>,
        events: HostEventBus,
    }

    impl Fixture {
        fn new() -> Self {
            let launcher = Arc::new(PopupLauncher::default());
            Self {
                controller: RedirectController::new(launcher.clone()),
                launcher,
                hub: Arc::new(BroadcastHub::new()),
                names: Arc::new(ChannelNameRegistry::new(MemoryStore::shared())),
                session: MemoryStore::shared(),
                events: HostEventBus::new(),
            }
        }

        fn transport(&self, options: BroadcastOptions) -> Arc<BroadcastTransport> {
            Arc::new(
                BroadcastTransport::new(
                    Arc::clone(&self.hub),
                    Arc::clone(&self.names),
                    Arc::clone(&self.session),
                    options,
                )
                .with_host_events(self.events.clone()),
            )
        }

        fn relay(&self) -> CallbackRelay {
            CallbackRelay::new(Arc::clone(&self.hub), Arc::clone(&self.names))
        }
    }

    fn expected() -> Url {
        Url::parse("https://app.example/auth/done").expect("url")
    }

    #[tokio::test]
    async fn relayed_callback_resolves_popup_operation() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let handle = fixture.controller.begin(
            "https://auth.example/authorize",
            BeginOptions::new(fixture.transport(
                BroadcastOptions::default().with_expected_callback(expected()),
            ))
            .with_presentation(Presentation::Popup {
                width: 480,
                height: 640,
            }),
        );
        let channel = handle
            .descriptor()
            .and_then(|descriptor| descriptor.channel_name)
            .expect("channel name");
        assert_eq!(fixture.names.active(DEFAULT_PARTITION)?, vec![channel.clone()]);

        let relay = fixture.relay();
        assert_eq!(relay.relay(DEFAULT_PARTITION, "https://app.example/favicon.ico")?, 1);
        assert_eq!(
            relay.relay(DEFAULT_PARTITION, "https://app.example/auth/done?code=abc")?,
            1
        );

        let resolution = handle.result().await;
        let code = resolution
            .callback_uri()
            .and_then(|uri| query_param(uri, "code"));
        assert_eq!(code.as_deref(), Some("abc"));
        assert!(fixture.names.active(DEFAULT_PARTITION)?.is_empty());
        assert_eq!(fixture.hub.listener_count(&channel), 0);
        let surfaces = fixture.launcher.surfaces.lock().expect("surfaces");
        assert!(surfaces[0].is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_operations_only_accept_their_own_state() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let begin = |state: &'static str| {
            fixture.controller.begin(
                "https://auth.example/authorize",
                BeginOptions::new(fixture.transport(BroadcastOptions::default()))
                    .with_presentation(Presentation::NewTab)
                    .with_validator(CallbackValidator::predicate(move |uri| {
                        query_param(uri, "state").as_deref() == Some(state)
                    })),
            )
        };
        let first = begin("first");
        let second = begin("second");

        let relay = fixture.relay();
        assert_eq!(relay.relay(DEFAULT_PARTITION, "https://app.example/cb?state=second")?, 2);
        let resolution = second.result().await;
        assert!(resolution.is_succeeded());
        assert!(first.is_pending());

        relay.relay(DEFAULT_PARTITION, "https://app.example/cb?state=first")?;
        assert!(first.result().await.is_succeeded());
        assert_eq!(fixture.controller.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn closed_popup_is_reported_as_dismissed_on_focus() {
        let fixture = Fixture::new();
        let handle = fixture.controller.begin(
            "https://auth.example/authorize",
            BeginOptions::new(fixture.transport(BroadcastOptions::default())).with_presentation(
                Presentation::Popup {
                    width: 480,
                    height: 640,
                },
            ),
        );
        fixture.events.publish(HostEvent::FocusGained);
        tokio::task::yield_now().await;
        assert!(handle.is_pending());

        let surface = Arc::clone(&fixture.launcher.surfaces.lock().expect("surfaces")[0]);
        surface.close();
        fixture
            .events
            .publish(HostEvent::VisibilityChanged { visible: true });
        assert!(matches!(
            handle.result().await,
            Resolution::Cancelled(CancelReason::Dismissed)
        ));
    }

    #[tokio::test]
    async fn same_page_persists_resume_record_and_awaits_reload() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let handle = fixture.controller.begin(
            "https://auth.example/authorize",
            BeginOptions::new(fixture.transport(
                BroadcastOptions::default().with_expected_callback(expected()),
            ))
            .with_presentation(Presentation::SamePage)
            .with_timeout(Duration::from_secs(300)),
        );
        assert!(matches!(handle.result().await, Resolution::AwaitingResume));
        assert!(fixture.session.get(PENDING_RESUME_KEY)?.is_some());
        assert!(!fixture.launcher.surfaces.lock().expect("surfaces")[0].is_closed());

        let resume = SamePageResume::new(Arc::clone(&fixture.session));
        let resolution = resume
            .resume_if_pending(
                "https://app.example/auth/done?code=xyz",
                &CallbackValidator::None,
            )
            .await;
        assert!(matches!(resolution, Some(Resolution::Succeeded(_))));
        Ok(())
    }
}
