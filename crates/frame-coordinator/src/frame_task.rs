//! One-shot navigation/lifecycle observers tied to a single caller operation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use frameflow_core_types::{DocumentId, LifecycleEvent};

use crate::contracts::Request;
use crate::errors::FrameError;
use crate::frame::Frame;
use crate::types::{DocumentInfo, UrlMatcher};

type Waiter<T> = oneshot::Sender<Result<T, FrameError>>;

#[derive(Default)]
struct TaskInner {
    same_document: Option<(UrlMatcher, Waiter<()>)>,
    specific_document: Option<(DocumentId, Waiter<DocumentInfo>)>,
    new_document: Option<(UrlMatcher, Waiter<DocumentInfo>)>,
    lifecycle: Option<(LifecycleEvent, Waiter<()>)>,
    requests: HashMap<DocumentId, Arc<Request>>,
}

/// Observer attached to exactly one frame for its lifetime. Holds at most
/// one waiter of each kind; each waiter resolves at most once. Removed from
/// the frame on [`FrameTask::done`] or when the frame rejects it.
pub struct FrameTask {
    frame: Arc<Frame>,
    inner: Mutex<TaskInner>,
}

impl FrameTask {
    pub fn new(frame: &Arc<Frame>) -> Arc<Self> {
        let task = Arc::new(Self {
            frame: Arc::clone(frame),
            inner: Mutex::new(TaskInner::default()),
        });
        frame.register_frame_task(&task);
        task
    }

    /// Detaches the observer from its frame. Pending waiters are dropped.
    pub fn done(self: &Arc<Self>) {
        self.frame.unregister_frame_task(self);
    }

    /// Resolves on the next same-document commit whose URL matches.
    pub fn wait_for_same_document(
        &self,
        matcher: UrlMatcher,
    ) -> oneshot::Receiver<Result<(), FrameError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().same_document = Some((matcher, tx));
        rx
    }

    /// Resolves when `expected` commits; rejects on a navigation error for
    /// `expected`, or with [`FrameError::NavigationInterrupted`] when a
    /// different document commits first.
    pub fn wait_for_specific_document(
        &self,
        expected: DocumentId,
    ) -> oneshot::Receiver<Result<DocumentInfo, FrameError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().specific_document = Some((expected, tx));
        rx
    }

    /// Resolves with the committing document on any new-document commit
    /// whose URL matches; rejects on any navigation error.
    pub fn wait_for_new_document(
        &self,
        matcher: UrlMatcher,
    ) -> oneshot::Receiver<Result<DocumentInfo, FrameError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().new_document = Some((matcher, tx));
        rx
    }

    /// Resolves when `event` has fired on the frame and on every descendant.
    /// The subtree predicate is recomputed on every lifecycle event anywhere
    /// in the page.
    pub fn wait_for_lifecycle(
        self: &Arc<Self>,
        event: LifecycleEvent,
    ) -> oneshot::Receiver<Result<(), FrameError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().lifecycle = Some((event, tx));
        // The predicate may already hold at registration time.
        self.on_lifecycle();
        rx
    }

    /// Top-level request observed for the given document, if any.
    pub fn request_for(&self, document_id: &DocumentId) -> Option<Arc<Request>> {
        self.inner.lock().requests.get(document_id).cloned()
    }

    /// Records top-level requests so the caller can later retrieve the one
    /// belonging to a returned document id. Redirect hops are skipped; the
    /// chain is reachable from the first request.
    pub(crate) fn on_request(&self, request: &Arc<Request>) {
        let Some(document_id) = request.document_id() else {
            return;
        };
        if request.redirected_from().is_some() {
            return;
        }
        self.inner
            .lock()
            .requests
            .insert(document_id.clone(), Arc::clone(request));
    }

    pub(crate) fn on_same_document(&self, url: &str) {
        let mut inner = self.inner.lock();
        let matched = matches!(&inner.same_document, Some((matcher, _)) if matcher.matches(url));
        if matched {
            if let Some((_, tx)) = inner.same_document.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    pub(crate) fn on_new_document(
        &self,
        document_id: &DocumentId,
        url: &str,
        error: Option<FrameError>,
    ) {
        let mut inner = self.inner.lock();
        let info = DocumentInfo {
            document_id: document_id.clone(),
            request: inner.requests.get(document_id).cloned(),
        };

        if let Some((expected, _)) = &inner.specific_document {
            let outcome = match (&error, expected == document_id) {
                (None, true) => Some(Ok(info.clone())),
                (None, false) => Some(Err(FrameError::NavigationInterrupted)),
                (Some(err), true) => Some(Err(err.clone())),
                // A failure for an unrelated document does not settle us.
                (Some(_), false) => None,
            };
            if let Some(outcome) = outcome {
                if let Some((_, tx)) = inner.specific_document.take() {
                    let _ = tx.send(outcome);
                }
            }
        }

        if let Some((matcher, _)) = &inner.new_document {
            let outcome = match &error {
                Some(err) => Some(Err(err.clone())),
                None if matcher.matches(url) => Some(Ok(info)),
                None => None,
            };
            if let Some(outcome) = outcome {
                if let Some((_, tx)) = inner.new_document.take() {
                    let _ = tx.send(outcome);
                }
            }
        }
    }

    /// Re-evaluates the subtree lifecycle predicate.
    pub(crate) fn on_lifecycle(&self) {
        let target = match &self.inner.lock().lifecycle {
            Some((event, _)) => *event,
            None => return,
        };
        if self.frame.subtree_lifecycle_complete(target) {
            if let Some((_, tx)) = self.inner.lock().lifecycle.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Rejects every pending waiter. Used on frame detach and page
    /// disconnect.
    pub(crate) fn terminate(&self, error: FrameError) {
        let mut inner = self.inner.lock();
        if let Some((_, tx)) = inner.same_document.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some((_, tx)) = inner.specific_document.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some((_, tx)) = inner.new_document.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some((_, tx)) = inner.lifecycle.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Awaits a waiter receiver, mapping a dropped channel to an internal error.
/// A waiter is only ever dropped after its operation already settled.
pub(crate) async fn await_waiter<T>(
    rx: oneshot::Receiver<Result<T, FrameError>>,
) -> Result<T, FrameError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Internal(
            "navigation observer dropped before settling".to_string(),
        )),
    }
}
