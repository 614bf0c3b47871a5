//! Per-operation timeout, cancellation and progress-log controller.
//!
//! Every caller operation runs under a fresh [`ProgressController`]. The
//! controller races the operation body against its deadline and any external
//! abort signals (page disconnect, frame detach); on loss it runs the
//! cleanup callbacks registered by the body and synthesizes the matching
//! error. Cleanup callbacks are the cancellation contract: steps holding a
//! disposable resource register one instead of relying on stack unwinding.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::FrameError;

type CleanupFn = Box<dyn FnOnce() + Send>;

struct ProgressInner {
    deadline: Instant,
    timeout: Duration,
    aborted: CancellationToken,
    log: Mutex<Vec<String>>,
    cleanups: Mutex<Vec<CleanupFn>>,
}

/// Handle passed into the operation body.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

impl Progress {
    /// False once the deadline passed or an abort signal fired.
    pub fn is_running(&self) -> bool {
        !self.inner.aborted.is_cancelled() && Instant::now() < self.inner.deadline
    }

    pub fn time_remaining(&self) -> Duration {
        self.inner
            .deadline
            .saturating_duration_since(Instant::now())
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "frame-coordinator", "{message}");
        self.inner.log.lock().push(message);
    }

    /// Registers a callback run if (and only if) the operation is aborted by
    /// timeout or an external signal.
    pub fn cleanup_when_aborted(&self, cleanup: impl FnOnce() + Send + 'static) {
        if self.inner.aborted.is_cancelled() {
            cleanup();
            return;
        }
        self.inner.cleanups.lock().push(Box::new(cleanup));
    }
}

/// Owns one operation's deadline and abort wiring.
pub struct ProgressController {
    inner: Arc<ProgressInner>,
    aborts: Vec<(CancellationToken, FrameError)>,
}

impl ProgressController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                deadline: Instant::now() + timeout,
                timeout,
                aborted: CancellationToken::new(),
                log: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
            }),
            aborts: Vec::new(),
        }
    }

    /// Adds an external abort signal. When `token` fires before the body
    /// completes, the operation fails with `error`.
    pub fn abort_when(&mut self, token: CancellationToken, error: FrameError) {
        self.aborts.push((token, error));
    }

    pub fn progress(&self) -> Progress {
        Progress {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Races the body against the deadline and the abort signals.
    pub async fn run<T, Fut>(self, body: Fut) -> Result<T, FrameError>
    where
        Fut: Future<Output = Result<T, FrameError>>,
    {
        let inner = Arc::clone(&self.inner);
        let aborts = self.aborts;

        let external_abort = async {
            if aborts.is_empty() {
                return futures::future::pending::<FrameError>().await;
            }
            let waiters = aborts.into_iter().map(|(token, error)| {
                Box::pin(async move {
                    token.cancelled().await;
                    error
                })
            });
            let (error, _, _) = futures::future::select_all(waiters).await;
            error
        };

        tokio::pin!(body);
        tokio::pin!(external_abort);
        let deadline = tokio::time::sleep_until(inner.deadline);
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut body => {
                match result {
                    Ok(value) => {
                        // Success: cleanups are dropped unused.
                        inner.cleanups.lock().clear();
                        Ok(value)
                    }
                    Err(error) => {
                        Self::abort(&inner);
                        Err(error)
                    }
                }
            }
            _ = &mut deadline => {
                Self::abort(&inner);
                Err(FrameError::Timeout(Self::timeout_message(&inner)))
            }
            error = &mut external_abort => {
                Self::abort(&inner);
                Err(error)
            }
        }
    }

    fn abort(inner: &Arc<ProgressInner>) {
        inner.aborted.cancel();
        let cleanups: Vec<CleanupFn> = inner.cleanups.lock().drain(..).collect();
        for cleanup in cleanups {
            cleanup();
        }
    }

    fn timeout_message(inner: &Arc<ProgressInner>) -> String {
        let mut message = format!("Timeout {}ms exceeded.", inner.timeout.as_millis());
        for line in inner.log.lock().iter() {
            message.push_str("\n  - ");
            message.push_str(line);
        }
        message
    }
}

/// Entry point for operations without a caller-supplied progress: builds a
/// controller, wires the abort signals, and runs the body.
pub async fn run_abortable_task<T, F, Fut>(
    timeout: Duration,
    aborts: Vec<(CancellationToken, FrameError)>,
    body: F,
) -> Result<T, FrameError>
where
    F: FnOnce(Progress) -> Fut,
    Fut: Future<Output = Result<T, FrameError>>,
{
    let mut controller = ProgressController::new(timeout);
    for (token, error) in aborts {
        controller.abort_when(token, error);
    }
    let progress = controller.progress();
    controller.run(body(progress)).await
}
