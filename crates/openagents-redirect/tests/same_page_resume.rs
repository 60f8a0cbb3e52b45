use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use openagents_redirect::broadcast::PENDING_RESUME_KEY;
use openagents_redirect::{
    BeginOptions, BroadcastHub, BroadcastOptions, BroadcastTransport, CallbackValidator,
    ChannelNameRegistry, DetachedSurface, ExternalSurface, FileStore, KeyValueStore, LaunchError,
    Launcher, MemoryStore, Presentation, RedirectController, RedirectError, Resolution,
    SamePageResume, query_param,
};
use url::Url;

struct NavigatingLauncher;

impl Launcher for NavigatingLauncher {
    fn launch(
        &self,
        _url: &Url,
        presentation: &Presentation,
    ) -> Result<Arc<dyn ExternalSurface>, LaunchError> {
        if *presentation != Presentation::SamePage {
            return Err(LaunchError::Unsupported {
                presentation: presentation.to_string(),
            });
        }
        Ok(Arc::new(DetachedSurface::default()))
    }
}

struct BlockedLauncher;

impl Launcher for BlockedLauncher {
    fn launch(
        &self,
        _url: &Url,
        _presentation: &Presentation,
    ) -> Result<Arc<dyn ExternalSurface>, LaunchError> {
        Err(LaunchError::Blocked {
            reason: "navigation refused".to_string(),
        })
    }
}

fn same_page_transport(session: Arc<dyn KeyValueStore>) -> Result<Arc<BroadcastTransport>> {
    let expected = Url::parse("https://app.example/auth/done")?;
    Ok(Arc::new(BroadcastTransport::new(
        Arc::new(BroadcastHub::new()),
        Arc::new(ChannelNameRegistry::new(MemoryStore::shared())),
        session,
        BroadcastOptions::default().with_expected_callback(expected),
    )))
}

#[tokio::test]
async fn same_page_operation_resumes_after_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state_path = dir.path().join("session.json");

    {
        let session: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&state_path));
        let controller = RedirectController::new(Arc::new(NavigatingLauncher));
        let handle = controller.begin(
            "https://auth.example/authorize?state=n1",
            BeginOptions::new(same_page_transport(session)?)
                .with_presentation(Presentation::SamePage)
                .with_timeout(Duration::from_secs(600)),
        );
        assert!(matches!(handle.result().await, Resolution::AwaitingResume));
        assert_eq!(controller.pending_count(), 0);
    }

    let reloaded: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&state_path));
    assert!(reloaded.get(PENDING_RESUME_KEY)?.is_some());
    let resume = SamePageResume::new(Arc::clone(&reloaded));
    let validator =
        CallbackValidator::predicate(|uri| query_param(uri, "state").as_deref() == Some("n1"));

    let resolution = resume
        .resume_if_pending("https://app.example/auth/done?code=zz&state=n1", &validator)
        .await
        .ok_or_else(|| anyhow!("nothing was pending"))?;
    assert_eq!(
        resolution
            .callback_uri()
            .and_then(|uri| query_param(uri, "code"))
            .as_deref(),
        Some("zz")
    );
    assert!(reloaded.get(PENDING_RESUME_KEY)?.is_none());
    assert!(
        resume
            .resume_if_pending("https://app.example/auth/done?code=zz&state=n1", &validator)
            .await
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn reload_on_foreign_page_rejects_pending_record() -> Result<()> {
    let session = MemoryStore::shared();
    let controller = RedirectController::new(Arc::new(NavigatingLauncher));
    let handle = controller.begin(
        "https://auth.example/authorize",
        BeginOptions::new(same_page_transport(Arc::clone(&session))?)
            .with_presentation(Presentation::SamePage),
    );
    assert!(matches!(handle.result().await, Resolution::AwaitingResume));

    let resolution = SamePageResume::new(session)
        .resume_if_pending("https://app.example/settings", &CallbackValidator::None)
        .await;
    assert!(matches!(
        resolution,
        Some(Resolution::Failed(RedirectError::ResumeRejected { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn failed_launch_leaves_nothing_to_resume() -> Result<()> {
    let session = MemoryStore::shared();
    let controller = RedirectController::new(Arc::new(BlockedLauncher));
    let handle = controller.begin(
        "https://auth.example/authorize",
        BeginOptions::new(same_page_transport(Arc::clone(&session))?)
            .with_presentation(Presentation::SamePage),
    );
    assert!(matches!(
        handle.result().await,
        Resolution::Failed(RedirectError::Launch(LaunchError::Blocked { .. }))
    ));
    assert!(session.get(PENDING_RESUME_KEY)?.is_none());

    let resume = SamePageResume::new(session);
    assert!(!resume.has_pending());
    let late = resume
        .resume_if_pending(
            "https://app.example/auth/done?code=late",
            &CallbackValidator::None,
        )
        .await;
    assert!(late.is_none());
    Ok(())
}
