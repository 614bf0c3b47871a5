//! Long-lived in-page polls that survive execution-context recycling.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use frameflow_core_types::World;

use crate::contracts::{ExecutionContext, InjectedScriptPoll, JsHandle, SchedulableTask};
use crate::errors::FrameError;
use crate::frame::Frame;
use crate::progress::Progress;

struct RerunnableInner {
    result_tx: Option<oneshot::Sender<Result<Arc<dyn JsHandle>, FrameError>>>,
    running: bool,
    /// Context installed while a rerun was still in flight; picked up once
    /// the current rerun observes its context's destruction.
    pending_context: Option<Arc<dyn ExecutionContext>>,
}

/// A task bound to one `(frame, world)` that re-executes its builder each
/// time a fresh execution context appears, until it succeeds, is terminated,
/// or fails with a non-recoverable error. Context-destruction errors are
/// absorbed and never surface to the caller.
pub struct RerunnableTask {
    frame: Arc<Frame>,
    world: World,
    builder: SchedulableTask,
    progress: Progress,
    inner: Mutex<RerunnableInner>,
}

impl RerunnableTask {
    pub(crate) fn new(
        frame: &Arc<Frame>,
        world: World,
        progress: Progress,
        builder: SchedulableTask,
    ) -> (
        Arc<Self>,
        oneshot::Receiver<Result<Arc<dyn JsHandle>, FrameError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let task = Arc::new(Self {
            frame: Arc::clone(frame),
            world,
            builder,
            progress,
            inner: Mutex::new(RerunnableInner {
                result_tx: Some(tx),
                running: false,
                pending_context: None,
            }),
        });
        (task, rx)
    }

    pub(crate) fn world(&self) -> World {
        self.world
    }

    /// Starts one poll attempt in `context`. At most one attempt runs at a
    /// time; a context arriving mid-attempt is queued and picked up when the
    /// current attempt observes its context's destruction.
    pub(crate) fn rerun(self: &Arc<Self>, context: Arc<dyn ExecutionContext>) {
        {
            let mut inner = self.inner.lock();
            if inner.result_tx.is_none() {
                return;
            }
            if inner.running {
                inner.pending_context = Some(context);
                return;
            }
            inner.running = true;
        }
        let task = Arc::clone(self);
        tokio::spawn(async move {
            task.run_once(context).await;
        });
    }

    async fn run_once(self: Arc<Self>, context: Arc<dyn ExecutionContext>) {
        let outcome = self.poll_once(context).await;

        let next = {
            let mut inner = self.inner.lock();
            inner.running = false;
            match outcome {
                Some(result) => {
                    let tx = inner.result_tx.take();
                    drop(inner);
                    self.frame.unregister_rerunnable(&self);
                    if let Some(tx) = tx {
                        let _ = tx.send(result);
                    }
                    None
                }
                None => inner.pending_context.take(),
            }
        };

        if let Some(context) = next {
            self.rerun(context);
        }
    }

    /// One attempt. `None` means the context went away and the attempt
    /// should be retried on the next context.
    async fn poll_once(&self, context: Arc<dyn ExecutionContext>) -> PollOutcome {
        let poll = match (self.builder)(context).await {
            Ok(poll) => poll,
            Err(err) if err.is_context_destroyed() => {
                debug!(
                    target: "frame-coordinator",
                    frame = %self.frame.id(),
                    world = %self.world,
                    "poll setup lost its context, waiting for the next one"
                );
                return None;
            }
            Err(err) => return Some(Err(err)),
        };

        let handler = InjectedScriptPollHandler::new(self.progress.clone(), poll);
        match handler.result().await {
            Ok(handle) => Some(Ok(handle)),
            Err(err) if err.is_context_destroyed() => {
                debug!(
                    target: "frame-coordinator",
                    frame = %self.frame.id(),
                    world = %self.world,
                    "poll lost its context, waiting for the next one"
                );
                None
            }
            Err(err) => Some(Err(err)),
        }
    }

    /// Rejects the external promise. Used on frame detach, page disconnect,
    /// and operation abort.
    pub(crate) fn terminate(&self, error: FrameError) {
        if let Some(tx) = self.inner.lock().result_tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.inner.lock().result_tx.is_none()
    }
}

type PollOutcome = Option<Result<Arc<dyn JsHandle>, FrameError>>;

/// Local wrapper around a remote poll handle: forwards the page-side
/// progress log into the operation log and cancels the in-page loop when the
/// operation aborts.
pub(crate) struct InjectedScriptPollHandler {
    poll: Arc<dyn InjectedScriptPoll>,
}

impl InjectedScriptPollHandler {
    pub(crate) fn new(progress: Progress, poll: Arc<dyn InjectedScriptPoll>) -> Self {
        let cancel_poll = Arc::clone(&poll);
        progress.cleanup_when_aborted(move || {
            tokio::spawn(async move {
                cancel_poll.cancel().await;
            });
        });

        let log_poll = Arc::clone(&poll);
        tokio::spawn(async move {
            loop {
                let lines = log_poll.take_log().await;
                if lines.is_empty() {
                    break;
                }
                for line in lines {
                    progress.log(line);
                }
            }
        });

        Self { poll }
    }

    pub(crate) async fn result(&self) -> Result<Arc<dyn JsHandle>, FrameError> {
        self.poll.result().await
    }
}
