use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use url::Url;

use crate::error::RedirectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the handle.
    Caller,
    /// The operation deadline elapsed.
    Timeout,
    /// The user closed the external surface without producing a callback.
    Dismissed,
}

impl CancelReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Timeout => "timeout",
            Self::Dismissed => "dismissed",
        }
    }
}

/// Terminal outcome of an operation, plus the same-page side branch.
#[derive(Debug, Clone)]
pub enum Resolution {
    Succeeded(Url),
    Cancelled(CancelReason),
    Failed(RedirectError),
    AwaitingResume,
}

impl Resolution {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Cancelled(_) => "cancelled",
            Self::Failed(_) => "failed",
            Self::AwaitingResume => "awaiting_resume",
        }
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    #[must_use]
    pub fn callback_uri(&self) -> Option<&Url> {
        match self {
            Self::Succeeded(uri) => Some(uri),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&RedirectError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded(uri) => write!(f, "succeeded: {uri}"),
            Self::Cancelled(reason) => write!(f, "cancelled ({})", reason.as_str()),
            Self::Failed(error) => write!(f, "failed ({}): {error}", error.kind().as_str()),
            Self::AwaitingResume => f.write_str("awaiting resume"),
        }
    }
}

/// Point-in-time view of an operation.
#[derive(Debug, Clone)]
pub enum OperationState {
    Pending,
    Succeeded(Url),
    Cancelled,
    Failed(RedirectError),
    AwaitingResume,
}

impl OperationState {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl From<Option<Resolution>> for OperationState {
    fn from(resolution: Option<Resolution>) -> Self {
        match resolution {
            None => Self::Pending,
            Some(Resolution::Succeeded(uri)) => Self::Succeeded(uri),
            Some(Resolution::Cancelled(_)) => Self::Cancelled,
            Some(Resolution::Failed(error)) => Self::Failed(error),
            Some(Resolution::AwaitingResume) => Self::AwaitingResume,
        }
    }
}

/// Single-assignment slot for an operation's outcome.
///
/// Writers race on a compare-exchange; only the winner publishes. Every other
/// `complete` call returns `false` and has no effect.
#[derive(Debug)]
pub struct ResolutionSink {
    claimed: AtomicBool,
    slot: watch::Sender<Option<Resolution>>,
}

impl Default for ResolutionSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionSink {
    #[must_use]
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            claimed: AtomicBool::new(false),
            slot,
        }
    }

    pub fn complete(&self, resolution: Resolution) -> bool {
        self.complete_after(resolution, || {})
    }

    /// Like [`complete`](Self::complete), but the winning writer runs `cleanup`
    /// before the outcome becomes visible to waiters.
    pub fn complete_after(&self, resolution: Resolution, cleanup: impl FnOnce()) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        cleanup();
        self.slot.send_replace(Some(resolution));
        true
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek(&self) -> Option<Resolution> {
        self.slot.borrow().clone()
    }

    pub async fn wait(&self) -> Resolution {
        let mut receiver = self.slot.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(value) => match value.as_ref() {
                Some(resolution) => resolution.clone(),
                None => sink_closed(),
            },
            Err(_) => sink_closed(),
        }
    }
}

fn sink_closed() -> Resolution {
    Resolution::Failed(RedirectError::Transport {
        message: "resolution sink closed before completion".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn only_first_completion_wins() {
        let sink = ResolutionSink::new();
        assert!(sink.peek().is_none());
        assert!(sink.complete(Resolution::Cancelled(CancelReason::Caller)));
        assert!(!sink.complete(Resolution::Cancelled(CancelReason::Timeout)));
        assert!(matches!(
            sink.peek(),
            Some(Resolution::Cancelled(CancelReason::Caller))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_settle_exactly_once() {
        for _ in 0..50 {
            let sink = Arc::new(ResolutionSink::new());
            let winners = Arc::new(AtomicUsize::new(0));
            let tasks = (0..16)
                .map(|index| {
                    let sink = Arc::clone(&sink);
                    let winners = Arc::clone(&winners);
                    tokio::spawn(async move {
                        let resolution = if index % 2 == 0 {
                            Resolution::Cancelled(CancelReason::Timeout)
                        } else {
                            Resolution::Succeeded(
                                Url::parse("http://127.0.0.1/callback?code=x").expect("url"),
                            )
                        };
                        if sink.complete(resolution) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for task in tasks {
                task.await.expect("writer task");
            }
            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(sink.peek().is_some());
        }
    }

    #[tokio::test]
    async fn wait_returns_after_completion() {
        let sink = Arc::new(ResolutionSink::new());
        let waiter = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.wait().await })
        };
        tokio::task::yield_now().await;
        sink.complete(Resolution::AwaitingResume);
        let resolved = waiter.await.expect("waiter");
        assert!(matches!(resolved, Resolution::AwaitingResume));
        assert!(matches!(sink.wait().await, Resolution::AwaitingResume));
    }

    #[test]
    fn cleanup_runs_only_for_winner_and_before_publish() {
        let sink = ResolutionSink::new();
        let mut runs = 0;
        assert!(sink.complete_after(Resolution::Cancelled(CancelReason::Caller), || {
            assert!(sink.peek().is_none());
            runs += 1;
        }));
        assert!(!sink.complete_after(Resolution::AwaitingResume, || runs += 1));
        assert_eq!(runs, 1);
    }

    #[test]
    fn state_view_erases_cancel_reason() {
        let state = OperationState::from(Some(Resolution::Cancelled(CancelReason::Dismissed)));
        assert!(matches!(state, OperationState::Cancelled));
        assert!(OperationState::from(None).is_pending());
    }
}
