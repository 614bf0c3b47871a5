//! Interfaces of the external collaborators the coordination core consumes,
//! plus the minimal network request/response objects that cross them.
//!
//! Browser-specific modules implement these traits; the core only ever sees
//! them as capability objects behind `Arc<dyn …>`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use frameflow_core_types::{DocumentId, FrameId, World};

use crate::errors::FrameError;
use crate::types::{Polling, SelectorState};

/// Outcome of asking the browser to navigate a frame. `new_document_id` is
/// present when the browser decided to load a new document; absent when the
/// navigation will resolve same-document.
#[derive(Clone, Debug, Default)]
pub struct NavigateResult {
    pub new_document_id: Option<DocumentId>,
}

/// Capability object carrying the browser-side effects the core needs.
#[async_trait]
pub trait PageDelegate: Send + Sync {
    async fn navigate_frame(
        &self,
        frame_id: &FrameId,
        url: &str,
        referer: Option<&str>,
    ) -> Result<NavigateResult, FrameError>;

    /// Resolves the `<iframe>`/`<frame>` element owning the given frame.
    async fn frame_element(&self, frame_id: &FrameId)
        -> Result<Arc<dyn ElementHandle>, FrameError>;

    /// Re-homes an element handle into another execution context.
    async fn adopt_element_handle(
        &self,
        handle: Arc<dyn ElementHandle>,
        target: Arc<dyn ExecutionContext>,
    ) -> Result<Arc<dyn ElementHandle>, FrameError>;

    /// Awaited after every input-sourced action completes.
    async fn input_action_epilogue(&self) -> Result<(), FrameError>;

    /// Whether CSP violations for inline scripts surface asynchronously via
    /// console errors instead of through the evaluation itself.
    fn csp_errors_asynchronous_for_inline_scripts(&self) -> bool;
}

/// A live execution context inside one frame world. Created and destroyed by
/// the browser independently of the frame's lifetime; destruction is reported
/// through error messages containing "Execution context was destroyed" or
/// "Cannot find context with specified id".
#[async_trait]
pub trait ExecutionContext: Send + Sync + std::fmt::Debug {
    fn world(&self) -> World;

    async fn evaluate(&self, expression: &str, args: Vec<Value>) -> Result<Value, FrameError>;

    async fn evaluate_handle(
        &self,
        expression: &str,
        args: Vec<Value>,
    ) -> Result<Arc<dyn JsHandle>, FrameError>;

    /// Builds an in-page poll re-evaluating `expression(arg)` until truthy.
    /// The poll loop itself lives in the page-side injected script.
    async fn function_poll(
        &self,
        expression: &str,
        arg: Value,
        polling: Polling,
    ) -> Result<Arc<dyn InjectedScriptPoll>, FrameError>;
}

/// Handle to a JavaScript value living in the page.
#[async_trait]
pub trait JsHandle: Send + Sync + std::fmt::Debug {
    async fn json_value(&self) -> Result<Value, FrameError>;

    /// Downcast to an element handle; `None` when the value is not a node.
    fn as_element(self: Arc<Self>) -> Option<Arc<dyn ElementHandle>>;

    /// Releases the remote object. Idempotent.
    async fn dispose(&self);
}

/// Handle to a DOM element. Action methods return
/// [`FrameError::NotConnected`] when the node was removed from the DOM
/// between resolution and the action; the frame retry loop absorbs that.
#[async_trait]
pub trait ElementHandle: Send + Sync + std::fmt::Debug {
    fn execution_context(&self) -> Arc<dyn ExecutionContext>;

    async fn click(&self) -> Result<(), FrameError>;
    async fn dblclick(&self) -> Result<(), FrameError>;
    async fn hover(&self) -> Result<(), FrameError>;
    async fn focus(&self) -> Result<(), FrameError>;
    async fn check(&self) -> Result<(), FrameError>;
    async fn uncheck(&self) -> Result<(), FrameError>;
    async fn fill(&self, value: &str) -> Result<(), FrameError>;
    async fn type_text(&self, text: &str) -> Result<(), FrameError>;
    async fn press(&self, key: &str) -> Result<(), FrameError>;
    async fn select_option(&self, values: &[String]) -> Result<Vec<String>, FrameError>;
    async fn set_input_files(&self, files: &[PathBuf]) -> Result<(), FrameError>;
    async fn text_content(&self) -> Result<Option<String>, FrameError>;
    async fn inner_text(&self) -> Result<String, FrameError>;
    async fn inner_html(&self) -> Result<String, FrameError>;
    async fn get_attribute(&self, name: &str) -> Result<Option<String>, FrameError>;

    /// Releases the remote node. Idempotent.
    async fn dispose(&self);
}

/// Remote handle to one running in-page poll.
#[async_trait]
pub trait InjectedScriptPoll: Send + Sync {
    /// Completes when the poll settles.
    async fn result(&self) -> Result<Arc<dyn JsHandle>, FrameError>;

    /// Drains progress lines logged by the page side. Resolves with an empty
    /// vector once the poll has settled and no lines remain.
    async fn take_log(&self) -> Vec<String>;

    /// Cancels the in-page loop. Idempotent.
    async fn cancel(&self);
}

/// Factory producing a fresh in-page poll for a given execution context.
/// Invoked again each time the owning world receives a new context.
pub type SchedulableTask = Arc<
    dyn Fn(Arc<dyn ExecutionContext>) -> BoxFuture<'static, Result<Arc<dyn InjectedScriptPoll>, FrameError>>
        + Send
        + Sync,
>;

/// A schedulable task plus the world it prefers to run in.
#[derive(Clone)]
pub struct ScheduledTask {
    pub world: World,
    pub task: SchedulableTask,
}

/// Selector compilation and querying. Selector syntax is entirely the
/// engine's business; the core only routes worlds and retries.
#[async_trait]
pub trait SelectorEngine: Send + Sync {
    async fn query(
        &self,
        context: Arc<dyn ExecutionContext>,
        selector: &str,
    ) -> Result<Option<Arc<dyn ElementHandle>>, FrameError>;

    async fn query_all(
        &self,
        context: Arc<dyn ExecutionContext>,
        selector: &str,
    ) -> Result<Vec<Arc<dyn ElementHandle>>, FrameError>;

    async fn eval_on_selector(
        &self,
        context: Arc<dyn ExecutionContext>,
        selector: &str,
        expression: &str,
        arg: Value,
    ) -> Result<Value, FrameError>;

    async fn eval_on_selector_all(
        &self,
        context: Arc<dyn ExecutionContext>,
        selector: &str,
        expression: &str,
        arg: Value,
    ) -> Result<Value, FrameError>;

    fn wait_for_selector_task(
        &self,
        selector: &str,
        state: SelectorState,
    ) -> Result<ScheduledTask, FrameError>;

    fn dispatch_event_task(
        &self,
        selector: &str,
        event_type: &str,
        event_init: Value,
    ) -> Result<ScheduledTask, FrameError>;
}

static NEXT_REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Failure record attached to a request by the network layer.
#[derive(Clone, Debug)]
pub struct RequestFailure {
    pub error_text: String,
    /// Set when the failure carried the browser's cancellation marker.
    pub canceled: bool,
}

/// One network request observed by the page. Redirect hops are separate
/// requests linked through `redirected_from`/`redirected_to`.
#[derive(Debug)]
pub struct Request {
    seq: u64,
    frame_id: FrameId,
    url: String,
    document_id: Option<DocumentId>,
    is_favicon: bool,
    redirected_from: Option<Arc<Request>>,
    redirected_to: Mutex<Option<Weak<Request>>>,
    response: OnceLock<Arc<Response>>,
    failure: Mutex<Option<RequestFailure>>,
}

impl Request {
    pub fn new(
        frame_id: FrameId,
        url: impl Into<String>,
        document_id: Option<DocumentId>,
        is_favicon: bool,
        redirected_from: Option<Arc<Request>>,
    ) -> Arc<Self> {
        let request = Arc::new(Self {
            seq: NEXT_REQUEST_SEQ.fetch_add(1, Ordering::Relaxed),
            frame_id,
            url: url.into(),
            document_id,
            is_favicon,
            redirected_from: redirected_from.clone(),
            redirected_to: Mutex::new(None),
            response: OnceLock::new(),
            failure: Mutex::new(None),
        });
        if let Some(predecessor) = redirected_from {
            *predecessor.redirected_to.lock() = Some(Arc::downgrade(&request));
        }
        request
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn frame_id(&self) -> &FrameId {
        &self.frame_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_id.as_ref()
    }

    pub fn is_favicon(&self) -> bool {
        self.is_favicon
    }

    pub fn redirected_from(&self) -> Option<&Arc<Request>> {
        self.redirected_from.as_ref()
    }

    pub fn redirected_to(&self) -> Option<Arc<Request>> {
        self.redirected_to.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Last request in the redirect chain starting at this one.
    pub fn final_request(self: &Arc<Self>) -> Arc<Request> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.redirected_to() {
            current = next;
        }
        current
    }

    pub fn response(&self) -> Option<Arc<Response>> {
        self.response.get().cloned()
    }

    /// Records the response. Later calls for the same request are ignored.
    pub fn set_response(&self, response: Arc<Response>) {
        let _ = self.response.set(response);
    }

    pub fn failure(&self) -> Option<RequestFailure> {
        self.failure.lock().clone()
    }

    pub fn set_failure(&self, error_text: impl Into<String>, canceled: bool) {
        *self.failure.lock() = Some(RequestFailure {
            error_text: error_text.into(),
            canceled,
        });
    }
}

/// Response to one request hop.
#[derive(Clone, Debug)]
pub struct Response {
    url: String,
    status: u16,
    status_text: String,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16, status_text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            status,
            status_text: status_text.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status)
    }
}

/// Delegate stub that fails every browser-side effect. Useful for exercising
/// the event-routing half of the core without a browser.
#[derive(Default)]
pub struct NoopDelegate;

#[async_trait]
impl PageDelegate for NoopDelegate {
    async fn navigate_frame(
        &self,
        _frame_id: &FrameId,
        _url: &str,
        _referer: Option<&str>,
    ) -> Result<NavigateResult, FrameError> {
        Err(FrameError::Internal("page delegate not available".to_string()))
    }

    async fn frame_element(
        &self,
        _frame_id: &FrameId,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        Err(FrameError::Internal("page delegate not available".to_string()))
    }

    async fn adopt_element_handle(
        &self,
        _handle: Arc<dyn ElementHandle>,
        _target: Arc<dyn ExecutionContext>,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        Err(FrameError::Internal("page delegate not available".to_string()))
    }

    async fn input_action_epilogue(&self) -> Result<(), FrameError> {
        Ok(())
    }

    fn csp_errors_asynchronous_for_inline_scripts(&self) -> bool {
        false
    }
}

/// Selector engine stub that fails every query.
#[derive(Default)]
pub struct NoopSelectorEngine;

#[async_trait]
impl SelectorEngine for NoopSelectorEngine {
    async fn query(
        &self,
        _context: Arc<dyn ExecutionContext>,
        selector: &str,
    ) -> Result<Option<Arc<dyn ElementHandle>>, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }

    async fn query_all(
        &self,
        _context: Arc<dyn ExecutionContext>,
        selector: &str,
    ) -> Result<Vec<Arc<dyn ElementHandle>>, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }

    async fn eval_on_selector(
        &self,
        _context: Arc<dyn ExecutionContext>,
        selector: &str,
        _expression: &str,
        _arg: Value,
    ) -> Result<Value, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }

    async fn eval_on_selector_all(
        &self,
        _context: Arc<dyn ExecutionContext>,
        selector: &str,
        _expression: &str,
        _arg: Value,
    ) -> Result<Value, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }

    fn wait_for_selector_task(
        &self,
        selector: &str,
        _state: SelectorState,
    ) -> Result<ScheduledTask, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }

    fn dispatch_event_task(
        &self,
        selector: &str,
        _event_type: &str,
        _event_init: Value,
    ) -> Result<ScheduledTask, FrameError> {
        Err(FrameError::Internal(format!(
            "selector engine not available for selector {selector:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_chain_links_both_directions() {
        let frame = FrameId::new();
        let first = Request::new(frame.clone(), "https://a/", None, false, None);
        let second = Request::new(
            frame.clone(),
            "https://b/",
            None,
            false,
            Some(first.clone()),
        );
        let third = Request::new(frame, "https://c/", None, false, Some(second.clone()));

        assert!(first.redirected_from().is_none());
        assert_eq!(second.redirected_from().unwrap().url(), "https://a/");
        assert_eq!(first.final_request().url(), "https://c/");
        assert_eq!(third.final_request().url(), "https://c/");
    }

    #[test]
    fn response_is_recorded_once() {
        let request = Request::new(FrameId::new(), "https://a/", None, false, None);
        request.set_response(Response::new("https://a/", 200, "OK"));
        request.set_response(Response::new("https://a/", 500, "Internal Server Error"));
        assert_eq!(request.response().unwrap().status(), 200);
        assert!(request.response().unwrap().ok());
    }
}
