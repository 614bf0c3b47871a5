//! Frame tree ownership and browser event routing.
//!
//! All browser events enter here, update frame state, and fan out to the
//! frame tasks registered on the affected frames. Handlers are synchronous:
//! within one handler every observer notification completes before the next
//! event is processed, which is the ordering guarantee callers rely on.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use frameflow_core_types::{DocumentId, FrameId, LifecycleEvent};
use frameflow_event_bus::EventBus;

use crate::barrier::SignalBarrier;
use crate::config::TimeoutConfig;
use crate::contracts::{PageDelegate, Request, Response, SelectorEngine};
use crate::errors::FrameError;
use crate::events::{ConsoleMessageKind, PageEvent};
use crate::frame::Frame;

const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

type ConsoleTagHandler = parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>;

/// Owns the frame tree for one page and reconciles the browser's event
/// stream with the caller operations running on the frames.
pub struct FrameManager {
    delegate: Arc<dyn PageDelegate>,
    selectors: Arc<dyn SelectorEngine>,
    bus: EventBus<PageEvent>,
    timeouts: TimeoutConfig,
    disconnect: CancellationToken,
    frames: DashMap<FrameId, Arc<Frame>>,
    main_frame: Mutex<Option<FrameId>>,
    barriers: Mutex<Vec<SignalBarrier>>,
    console_tags: DashMap<String, ConsoleTagHandler>,
    extra_http_headers: RwLock<HashMap<String, String>>,
    waited_for_timeout: AtomicBool,
    console_tag_counter: AtomicU64,
}

impl FrameManager {
    pub fn new(
        delegate: Arc<dyn PageDelegate>,
        selectors: Arc<dyn SelectorEngine>,
        timeouts: TimeoutConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            selectors,
            bus: EventBus::new(256),
            timeouts,
            disconnect: CancellationToken::new(),
            frames: DashMap::new(),
            main_frame: Mutex::new(None),
            barriers: Mutex::new(Vec::new()),
            console_tags: DashMap::new(),
            extra_http_headers: RwLock::new(HashMap::new()),
            waited_for_timeout: AtomicBool::new(false),
            console_tag_counter: AtomicU64::new(0),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn bus(&self) -> EventBus<PageEvent> {
        self.bus.clone()
    }

    pub fn delegate(&self) -> Arc<dyn PageDelegate> {
        Arc::clone(&self.delegate)
    }

    pub fn selectors(&self) -> Arc<dyn SelectorEngine> {
        Arc::clone(&self.selectors)
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts
    }

    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    pub fn frame(&self, id: &FrameId) -> Option<Arc<Frame>> {
        self.frames.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        let id = self.main_frame.lock().clone()?;
        self.frame(&id)
    }

    /// All attached frames, main frame first, parents before children.
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        let mut ordered = Vec::new();
        let Some(main) = self.main_frame() else {
            return ordered;
        };
        let mut queue = VecDeque::from([main]);
        while let Some(frame) = queue.pop_front() {
            queue.extend(frame.child_frames());
            ordered.push(frame);
        }
        ordered
    }

    pub fn set_extra_http_headers(&self, headers: HashMap<String, String>) {
        *self.extra_http_headers.write() = headers;
    }

    pub fn extra_http_headers(&self) -> HashMap<String, String> {
        self.extra_http_headers.read().clone()
    }

    pub(crate) fn note_wait_for_timeout(&self) {
        if !self.waited_for_timeout.swap(true, Ordering::SeqCst) {
            warn!(
                target: "frame-coordinator",
                "wait_for_timeout used; prefer condition-based waits outside debugging"
            );
        }
    }

    /// Whether any caller used the `wait_for_timeout` anti-pattern.
    pub fn used_wait_for_timeout(&self) -> bool {
        self.waited_for_timeout.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Frame tree events
    // ---------------------------------------------------------------------

    /// Handles a frame attachment. A missing or unknown parent means the
    /// browser is (re)identifying the main frame; identity is preserved
    /// across the re-key so pending operations keep their frame.
    pub fn frame_attached(
        self: &Arc<Self>,
        frame_id: FrameId,
        parent_id: Option<FrameId>,
    ) -> Arc<Frame> {
        let parent = parent_id.as_ref().and_then(|id| self.frame(id));
        match parent {
            None => {
                let current_main = self.main_frame.lock().clone();
                match current_main {
                    Some(main_id) if main_id == frame_id => {
                        warn!(
                            target: "frame-coordinator",
                            frame = %frame_id,
                            "duplicate main frame attachment ignored"
                        );
                        self.frame(&frame_id).unwrap_or_else(|| {
                            let frame = Frame::new(self, frame_id.clone(), None);
                            self.frames.insert(frame_id, Arc::clone(&frame));
                            frame
                        })
                    }
                    Some(main_id) => self.rekey_main_frame(&main_id, frame_id),
                    None => {
                        let frame = Frame::new(self, frame_id.clone(), None);
                        self.frames.insert(frame_id.clone(), Arc::clone(&frame));
                        *self.main_frame.lock() = Some(frame_id);
                        frame
                    }
                }
            }
            Some(parent) => {
                if let Some(existing) = self.frame(&frame_id) {
                    warn!(
                        target: "frame-coordinator",
                        frame = %frame_id,
                        "frame attached twice"
                    );
                    return existing;
                }
                let frame = Frame::new(self, frame_id.clone(), Some(parent.id()));
                parent.lock_state().children.push(frame_id.clone());
                self.frames.insert(frame_id.clone(), Arc::clone(&frame));
                self.bus.emit(PageEvent::FrameAttached { frame_id });
                frame
            }
        }
    }

    fn rekey_main_frame(self: &Arc<Self>, old_id: &FrameId, new_id: FrameId) -> Arc<Frame> {
        let frame = match self.frames.remove(old_id) {
            Some((_, frame)) => frame,
            None => {
                // Main-frame pointer and frame map are updated together, so
                // this only happens on a corrupted event stream. Recover by
                // starting over with a fresh main frame.
                warn!(
                    target: "frame-coordinator",
                    frame = %old_id,
                    "main frame missing from map, recreating"
                );
                let frame = Frame::new(self, new_id.clone(), None);
                self.frames.insert(new_id.clone(), Arc::clone(&frame));
                *self.main_frame.lock() = Some(new_id);
                return frame;
            }
        };
        frame.set_id(new_id.clone());
        for entry in self.frames.iter() {
            let mut state = entry.value().lock_state();
            if state.parent.as_ref() == Some(old_id) {
                state.parent = Some(new_id.clone());
            }
        }
        debug!(
            target: "frame-coordinator",
            old = %old_id,
            new = %new_id,
            "main frame re-keyed across process swap"
        );
        self.frames.insert(new_id.clone(), Arc::clone(&frame));
        *self.main_frame.lock() = Some(new_id);
        frame
    }

    pub fn frame_detached(self: &Arc<Self>, frame_id: &FrameId) {
        if let Some(frame) = self.frame(frame_id) {
            self.remove_frames_recursively(&frame);
        }
    }

    fn remove_frames_recursively(self: &Arc<Self>, frame: &Arc<Frame>) {
        let children = frame.lock_state().children.clone();
        for child_id in children {
            if let Some(child) = self.frame(&child_id) {
                self.remove_frames_recursively(&child);
            }
        }
        self.detach_frame(frame);
    }

    fn detach_frame(self: &Arc<Self>, frame: &Arc<Frame>) {
        let id = frame.id();

        // Tree pointers are cleared before any task observes detachment.
        let parent_id = frame.lock_state().parent.take();
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.frame(&parent_id) {
                parent.lock_state().children.retain(|child| child != &id);
            }
        }
        self.frames.remove(&id);
        {
            let mut main = self.main_frame.lock();
            if main.as_ref() == Some(&id) {
                *main = None;
            }
        }
        if let Some(timer) = frame.lock_state().network_idle_timer.take() {
            timer.abort();
        }

        frame.mark_detached();
        frame.terminate_rerunnables(FrameError::FrameDetached(
            "waitForFunction failed: frame got detached".to_string(),
        ));
        frame.terminate_frame_tasks(FrameError::frame_detached());

        self.bus.emit(PageEvent::FrameDetached { frame_id: id });
    }

    // ---------------------------------------------------------------------
    // Navigation events
    // ---------------------------------------------------------------------

    pub fn frame_requested_navigation(&self, frame_id: &FrameId, document_id: DocumentId) {
        let Some(frame) = self.frame(frame_id) else {
            return;
        };
        frame.lock_state().pending_document_id = Some(document_id);
        let barriers = self.barriers.lock().clone();
        for barrier in barriers {
            barrier.add_frame_navigation(&frame);
        }
    }

    /// The browser changed its mind about which document id will commit.
    pub fn frame_updated_document_id_for_navigation(
        &self,
        frame_id: &FrameId,
        document_id: DocumentId,
    ) {
        if let Some(frame) = self.frame(frame_id) {
            frame.lock_state().pending_document_id = Some(document_id);
        }
    }

    pub fn frame_committed_new_document(
        self: &Arc<Self>,
        frame_id: &FrameId,
        url: &str,
        name: &str,
        document_id: DocumentId,
        initial: bool,
    ) {
        let Some(frame) = self.frame(frame_id) else {
            warn!(
                target: "frame-coordinator",
                frame = %frame_id,
                "commit for unknown frame dropped"
            );
            return;
        };

        // A new document means a new subtree.
        let children = frame.lock_state().children.clone();
        for child_id in children {
            if let Some(child) = self.frame(&child_id) {
                self.remove_frames_recursively(&child);
            }
        }

        {
            let mut state = frame.lock_state();
            if let Some(pending) = &state.pending_document_id {
                if *pending != document_id {
                    // Cross-process navigations and updated-id events can
                    // legitimately commit a different id than last requested.
                    debug!(
                        target: "frame-coordinator",
                        frame = %frame_id,
                        pending = %pending,
                        committed = %document_id,
                        "committed document id differs from pending id"
                    );
                }
            }
            state.url = url.to_string();
            state.name = name.to_string();
            state.last_document_id = Some(document_id.clone());
            state.pending_document_id = None;
        }

        for task in frame.frame_tasks() {
            task.on_new_document(&document_id, url, None);
        }

        self.clear_frame_lifecycle(&frame);

        if !initial {
            self.bus.emit(PageEvent::FrameNavigated {
                frame_id: frame.id(),
                url: url.to_string(),
            });
        }
    }

    pub fn frame_committed_same_document(&self, frame_id: &FrameId, url: &str) {
        let Some(frame) = self.frame(frame_id) else {
            return;
        };
        frame.lock_state().url = url.to_string();
        for task in frame.frame_tasks() {
            task.on_same_document(url);
        }
        self.bus.emit(PageEvent::FrameNavigated {
            frame_id: frame.id(),
            url: url.to_string(),
        });
    }

    /// A provisional load failed before producing a request failure.
    pub fn provisional_load_failed(
        &self,
        frame_id: &FrameId,
        document_id: &DocumentId,
        error_text: &str,
    ) {
        let Some(frame) = self.frame(frame_id) else {
            return;
        };
        for task in frame.frame_tasks() {
            task.on_new_document(
                document_id,
                "",
                Some(FrameError::Navigation(error_text.to_string())),
            );
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle events
    // ---------------------------------------------------------------------

    /// The browser stopped loading without reporting the usual milestones.
    pub fn frame_stopped_loading(self: &Arc<Self>, frame_id: &FrameId) {
        self.frame_lifecycle_event(frame_id, LifecycleEvent::DomContentLoaded);
        self.frame_lifecycle_event(frame_id, LifecycleEvent::Load);
    }

    pub fn frame_lifecycle_event(self: &Arc<Self>, frame_id: &FrameId, event: LifecycleEvent) {
        let Some(frame) = self.frame(frame_id) else {
            return;
        };
        let inserted = frame.lock_state().fired_lifecycle.insert(event);
        if !inserted {
            return;
        }

        // Walk from the firing frame up to the root: ancestors' tasks may
        // wait on descendant events, and must observe them after this
        // frame's own state is updated.
        let mut current = Some(Arc::clone(&frame));
        while let Some(node) = current {
            for task in node.frame_tasks() {
                task.on_lifecycle();
            }
            current = node.parent_frame();
        }

        let is_main = self.main_frame.lock().as_ref() == Some(&frame.id());
        if is_main {
            match event {
                LifecycleEvent::Load => self.bus.emit(PageEvent::Load),
                LifecycleEvent::DomContentLoaded => {
                    self.bus.emit(PageEvent::DomContentLoaded)
                }
                LifecycleEvent::NetworkIdle => {}
            }
        }
    }

    /// Resets lifecycle bookkeeping on new-document commit and on content
    /// rewrite: requests of the old document stop counting toward idleness.
    pub fn clear_frame_lifecycle(self: &Arc<Self>, frame: &Arc<Frame>) {
        let idle = {
            let mut state = frame.lock_state();
            state.fired_lifecycle.clear();
            let committed = state.last_document_id.clone();
            state
                .inflight
                .retain(|_, request| request.document_id() == committed.as_ref());
            if let Some(timer) = state.network_idle_timer.take() {
                timer.abort();
            }
            state.inflight.is_empty()
        };
        if idle {
            self.start_network_idle_timer(frame);
        }
    }

    // ---------------------------------------------------------------------
    // Network events
    // ---------------------------------------------------------------------

    pub fn request_started(self: &Arc<Self>, request: Arc<Request>) {
        if request.is_favicon() {
            // Favicon fetches are invisible to idleness and to listeners.
            debug!(target: "frame-coordinator", url = request.url(), "favicon request skipped");
            return;
        }
        let Some(frame) = self.frame(request.frame_id()) else {
            return;
        };
        let became_busy = {
            let mut state = frame.lock_state();
            state.inflight.insert(request.seq(), Arc::clone(&request));
            state.inflight.len() == 1
        };
        if became_busy {
            Self::stop_network_idle_timer(&frame);
        }
        for task in frame.frame_tasks() {
            task.on_request(&request);
        }
        self.bus.emit(PageEvent::Request { request });
    }

    pub fn request_received_response(&self, request: &Arc<Request>, response: Arc<Response>) {
        request.set_response(Arc::clone(&response));
        if request.is_favicon() {
            return;
        }
        self.bus.emit(PageEvent::Response { response });
    }

    pub fn request_finished(self: &Arc<Self>, request: &Arc<Request>) {
        if request.is_favicon() {
            return;
        }
        self.settle_request(request);
        self.bus.emit(PageEvent::RequestFinished {
            request: Arc::clone(request),
        });
    }

    /// A request failed. When it carried the frame's pending document id,
    /// the navigation itself failed and the waiting tasks are told so.
    pub fn request_failed(self: &Arc<Self>, request: &Arc<Request>) {
        if request.is_favicon() {
            return;
        }
        self.settle_request(request);

        if let Some(frame) = self.frame(request.frame_id()) {
            if let Some(document_id) = request.document_id() {
                let was_pending = {
                    let mut state = frame.lock_state();
                    if state.pending_document_id.as_ref() == Some(document_id) {
                        state.pending_document_id = None;
                        true
                    } else {
                        false
                    }
                };
                if was_pending {
                    let failure = request.failure();
                    let mut text = failure
                        .as_ref()
                        .map(|failure| failure.error_text.clone())
                        .unwrap_or_else(|| "request failed".to_string());
                    if failure.map(|failure| failure.canceled).unwrap_or(false) {
                        text.push_str("; maybe frame was detached?");
                    }
                    for task in frame.frame_tasks() {
                        task.on_new_document(
                            document_id,
                            request.url(),
                            Some(FrameError::Navigation(text.clone())),
                        );
                    }
                }
            }
        }

        self.bus.emit(PageEvent::RequestFailed {
            request: Arc::clone(request),
        });
    }

    fn settle_request(self: &Arc<Self>, request: &Arc<Request>) {
        let Some(frame) = self.frame(request.frame_id()) else {
            return;
        };
        let idle = {
            let mut state = frame.lock_state();
            state.inflight.remove(&request.seq());
            state.inflight.is_empty()
        };
        if idle {
            self.start_network_idle_timer(&frame);
        }
    }

    // ---------------------------------------------------------------------
    // Network-idle timer
    // ---------------------------------------------------------------------

    fn start_network_idle_timer(self: &Arc<Self>, frame: &Arc<Frame>) {
        let mut state = frame.lock_state();
        if state
            .fired_lifecycle
            .contains(&LifecycleEvent::NetworkIdle)
            || state.network_idle_timer.is_some()
        {
            return;
        }
        let manager = Arc::downgrade(self);
        let frame_id = frame.id();
        state.network_idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(NETWORK_IDLE_TIMEOUT).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Some(frame) = manager.frame(&frame_id) {
                frame.lock_state().network_idle_timer = None;
            }
            manager.frame_lifecycle_event(&frame_id, LifecycleEvent::NetworkIdle);
        }));
    }

    fn stop_network_idle_timer(frame: &Arc<Frame>) {
        if let Some(timer) = frame.lock_state().network_idle_timer.take() {
            timer.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Console routing
    // ---------------------------------------------------------------------

    /// Entry point for console output. Tagged debug messages are consumed by
    /// their one-shot handler and suppressed; everything else is emitted.
    pub fn console_message(&self, kind: ConsoleMessageKind, text: &str) {
        if self.intercept_console_message(kind, text) {
            return;
        }
        self.bus.emit(PageEvent::Console {
            kind,
            text: text.to_string(),
        });
    }

    /// Returns true when the message was a registered one-shot tag and its
    /// handler consumed it.
    pub fn intercept_console_message(&self, kind: ConsoleMessageKind, text: &str) -> bool {
        if kind != ConsoleMessageKind::Debug {
            return false;
        }
        match self.console_tags.remove(text) {
            Some((_, handler)) => {
                if let Some(handler) = handler.lock().take() {
                    handler();
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn next_console_tag(&self, frame_id: &FrameId) -> String {
        let counter = self.console_tag_counter.fetch_add(1, Ordering::SeqCst);
        format!("--playwright--set--content--{frame_id}--{counter}--")
    }

    pub(crate) fn register_console_tag(&self, tag: String, handler: Box<dyn FnOnce() + Send>) {
        self.console_tags
            .insert(tag, parking_lot::Mutex::new(Some(handler)));
    }

    pub(crate) fn take_console_tag(&self, tag: &str) {
        self.console_tags.remove(tag);
    }

    // ---------------------------------------------------------------------
    // Signal barriers and input actions
    // ---------------------------------------------------------------------

    /// Announced by the delegate immediately before dispatching an input,
    /// closing the window between the browser accepting the input and the
    /// first navigation request it produces.
    pub fn frame_will_potentially_request_navigation(&self) {
        for barrier in self.barriers.lock().iter() {
            barrier.retain();
        }
    }

    pub fn frame_did_potentially_request_navigation(&self) {
        for barrier in self.barriers.lock().iter() {
            barrier.release();
        }
    }

    /// Runs `action`, then waits until every navigation it may have
    /// triggered settles, plus one extra scheduler turn so synchronously
    /// chained waits observe final state.
    pub async fn wait_for_signals_created_by<T>(
        &self,
        action: impl Future<Output = Result<T, FrameError>>,
    ) -> Result<T, FrameError> {
        let barrier = SignalBarrier::new();
        self.barriers.lock().push(barrier.clone());

        let result = action.await;

        if result.is_ok() {
            if let Err(epilogue_error) = self.delegate.input_action_epilogue().await {
                self.remove_barrier(&barrier);
                return Err(epilogue_error);
            }
            barrier.wait_for().await;
            tokio::task::yield_now().await;
        }

        self.remove_barrier(&barrier);
        result
    }

    fn remove_barrier(&self, barrier: &SignalBarrier) {
        self.barriers
            .lock()
            .retain(|existing| !existing.ptr_eq(barrier));
    }

    // ---------------------------------------------------------------------
    // Disconnect
    // ---------------------------------------------------------------------

    /// The browser transport went away: every pending waiter on every frame
    /// is rejected and no further operations can start.
    pub fn on_page_disconnected(&self) {
        self.disconnect.cancel();
        for entry in self.frames.iter() {
            let frame = entry.value();
            if let Some(timer) = frame.lock_state().network_idle_timer.take() {
                timer.abort();
            }
            frame.terminate_frame_tasks(FrameError::PageDisconnected);
            frame.terminate_rerunnables(FrameError::PageDisconnected);
        }
    }
}
