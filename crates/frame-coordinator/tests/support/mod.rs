//! Scripted collaborators for exercising the coordination core without a
//! browser. Each mock replays queued outcomes pushed by the test.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use frame_coordinator::{
    DocumentId, ElementHandle, ExecutionContext, FrameError, FrameId, FrameManager,
    InjectedScriptPoll, JsHandle, NavigateResult, PageDelegate, Polling, ScheduledTask,
    SelectorEngine, SelectorState, TimeoutConfig, World,
};

/// Gives spawned operations enough scheduler turns to reach their await
/// points before the test fires browser events. Tests run on the default
/// current-thread runtime, so this is deterministic.
pub async fn yield_many() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

// -------------------------------------------------------------------------
// Delegate
// -------------------------------------------------------------------------

pub struct MockDelegate {
    navigate_results: Mutex<VecDeque<NavigateResult>>,
    pub navigations: Mutex<Vec<(FrameId, String, Option<String>)>>,
    pub epilogues: AtomicUsize,
    pub csp_async: bool,
}

impl MockDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            navigate_results: Mutex::new(VecDeque::new()),
            navigations: Mutex::new(Vec::new()),
            epilogues: AtomicUsize::new(0),
            csp_async: false,
        })
    }

    pub fn with_async_csp() -> Arc<Self> {
        Arc::new(Self {
            navigate_results: Mutex::new(VecDeque::new()),
            navigations: Mutex::new(Vec::new()),
            epilogues: AtomicUsize::new(0),
            csp_async: true,
        })
    }

    pub fn push_navigate_result(&self, result: NavigateResult) {
        self.navigate_results.lock().push_back(result);
    }

    pub fn push_new_document(&self, document_id: &DocumentId) {
        self.push_navigate_result(NavigateResult {
            new_document_id: Some(document_id.clone()),
        });
    }
}

#[async_trait]
impl PageDelegate for MockDelegate {
    async fn navigate_frame(
        &self,
        frame_id: &FrameId,
        url: &str,
        referer: Option<&str>,
    ) -> Result<NavigateResult, FrameError> {
        self.navigations.lock().push((
            frame_id.clone(),
            url.to_string(),
            referer.map(str::to_string),
        ));
        Ok(self.navigate_results.lock().pop_front().unwrap_or_default())
    }

    async fn frame_element(
        &self,
        _frame_id: &FrameId,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        Err(FrameError::Internal("no frame element scripted".to_string()))
    }

    async fn adopt_element_handle(
        &self,
        _handle: Arc<dyn ElementHandle>,
        target: Arc<dyn ExecutionContext>,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        Ok(MockElement::connected(target) as Arc<dyn ElementHandle>)
    }

    async fn input_action_epilogue(&self) -> Result<(), FrameError> {
        self.epilogues.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn csp_errors_asynchronous_for_inline_scripts(&self) -> bool {
        self.csp_async
    }
}

// -------------------------------------------------------------------------
// Execution context
// -------------------------------------------------------------------------

type EvalHook = Box<dyn Fn(&str, &[Value]) + Send + Sync>;

pub struct MockContext {
    world: World,
    /// Every evaluate/evaluate_handle call, in order.
    pub calls: Mutex<Vec<(String, Vec<Value>)>>,
    eval_hook: Mutex<Option<EvalHook>>,
    eval_results: Mutex<VecDeque<Result<Value, FrameError>>>,
    handle_results: Mutex<VecDeque<Result<Arc<dyn JsHandle>, FrameError>>>,
    function_polls: Mutex<VecDeque<Arc<dyn InjectedScriptPoll>>>,
}

impl MockContext {
    pub fn new(world: World) -> Arc<Self> {
        Arc::new(Self {
            world,
            calls: Mutex::new(Vec::new()),
            eval_hook: Mutex::new(None),
            eval_results: Mutex::new(VecDeque::new()),
            handle_results: Mutex::new(VecDeque::new()),
            function_polls: Mutex::new(VecDeque::new()),
        })
    }

    /// Invoked synchronously on every evaluation, before the scripted result
    /// is produced. Used to observe arguments such as console tags.
    pub fn set_eval_hook(&self, hook: impl Fn(&str, &[Value]) + Send + Sync + 'static) {
        *self.eval_hook.lock() = Some(Box::new(hook));
    }

    pub fn push_eval_result(&self, result: Result<Value, FrameError>) {
        self.eval_results.lock().push_back(result);
    }

    pub fn push_handle_result(&self, result: Result<Arc<dyn JsHandle>, FrameError>) {
        self.handle_results.lock().push_back(result);
    }

    pub fn push_function_poll(&self, poll: Arc<dyn InjectedScriptPoll>) {
        self.function_polls.lock().push_back(poll);
    }
}

#[async_trait]
impl ExecutionContext for MockContext {
    fn world(&self) -> World {
        self.world
    }

    async fn evaluate(&self, expression: &str, args: Vec<Value>) -> Result<Value, FrameError> {
        if let Some(hook) = self.eval_hook.lock().as_ref() {
            hook(expression, &args);
        }
        self.calls.lock().push((expression.to_string(), args));
        match self.eval_results.lock().pop_front() {
            Some(result) => result,
            None => Ok(Value::Null),
        }
    }

    async fn evaluate_handle(
        &self,
        expression: &str,
        args: Vec<Value>,
    ) -> Result<Arc<dyn JsHandle>, FrameError> {
        if let Some(hook) = self.eval_hook.lock().as_ref() {
            hook(expression, &args);
        }
        self.calls.lock().push((expression.to_string(), args));
        let next = self.handle_results.lock().pop_front();
        match next {
            Some(result) => result,
            // Unscripted evaluations hang, letting races resolve first.
            None => futures::future::pending().await,
        }
    }

    async fn function_poll(
        &self,
        _expression: &str,
        _arg: Value,
        _polling: Polling,
    ) -> Result<Arc<dyn InjectedScriptPoll>, FrameError> {
        match self.function_polls.lock().pop_front() {
            Some(poll) => Ok(poll),
            None => Ok(MockPoll::pending() as Arc<dyn InjectedScriptPoll>),
        }
    }
}

// -------------------------------------------------------------------------
// Handles
// -------------------------------------------------------------------------

pub struct MockHandle {
    value: Value,
    element: Option<Arc<MockElement>>,
}

impl MockHandle {
    pub fn value(value: Value) -> Arc<Self> {
        Arc::new(Self {
            value,
            element: None,
        })
    }

    pub fn element(element: Arc<MockElement>) -> Arc<Self> {
        Arc::new(Self {
            value: Value::Null,
            element: Some(element),
        })
    }
}

#[async_trait]
impl JsHandle for MockHandle {
    async fn json_value(&self) -> Result<Value, FrameError> {
        Ok(self.value.clone())
    }

    fn as_element(self: Arc<Self>) -> Option<Arc<dyn ElementHandle>> {
        self.element
            .clone()
            .map(|element| element as Arc<dyn ElementHandle>)
    }

    async fn dispose(&self) {}
}

type ClickHook = Box<dyn FnOnce() + Send>;

pub struct MockElement {
    context: Arc<dyn ExecutionContext>,
    connected: AtomicBool,
    pub clicks: AtomicUsize,
    pub disposed: AtomicBool,
    text: Option<String>,
    on_click: Mutex<Option<ClickHook>>,
}

impl std::fmt::Debug for MockElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockElement")
            .field("connected", &self.connected)
            .field("clicks", &self.clicks)
            .field("disposed", &self.disposed)
            .field("text", &self.text)
            .finish()
    }
}

impl MockElement {
    pub fn connected(context: Arc<dyn ExecutionContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            connected: AtomicBool::new(true),
            clicks: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            text: None,
            on_click: Mutex::new(None),
        })
    }

    /// An element whose node is already gone: every action reports
    /// NotConnected.
    pub fn detached(context: Arc<dyn ExecutionContext>) -> Arc<Self> {
        let element = Self::connected(context);
        element.connected.store(false, Ordering::SeqCst);
        element
    }

    pub fn with_text(context: Arc<dyn ExecutionContext>, text: &str) -> Arc<Self> {
        Arc::new(Self {
            context,
            connected: AtomicBool::new(true),
            clicks: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            text: Some(text.to_string()),
            on_click: Mutex::new(None),
        })
    }

    /// Runs `hook` on the first click, before the click is counted. Used to
    /// simulate input-triggered navigations.
    pub fn set_click_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_click.lock() = Some(Box::new(hook));
    }

    fn ensure_connected(&self) -> Result<(), FrameError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FrameError::not_connected())
        }
    }
}

#[async_trait]
impl ElementHandle for MockElement {
    fn execution_context(&self) -> Arc<dyn ExecutionContext> {
        Arc::clone(&self.context)
    }

    async fn click(&self) -> Result<(), FrameError> {
        self.ensure_connected()?;
        if let Some(hook) = self.on_click.lock().take() {
            hook();
        }
        self.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dblclick(&self) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn hover(&self) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn focus(&self) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn check(&self) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn uncheck(&self) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn fill(&self, _value: &str) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn type_text(&self, _text: &str) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn press(&self, _key: &str) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn select_option(&self, values: &[String]) -> Result<Vec<String>, FrameError> {
        self.ensure_connected()?;
        Ok(values.to_vec())
    }

    async fn set_input_files(&self, _files: &[PathBuf]) -> Result<(), FrameError> {
        self.ensure_connected()
    }

    async fn text_content(&self) -> Result<Option<String>, FrameError> {
        self.ensure_connected()?;
        Ok(self.text.clone())
    }

    async fn inner_text(&self) -> Result<String, FrameError> {
        self.ensure_connected()?;
        Ok(self.text.clone().unwrap_or_default())
    }

    async fn inner_html(&self) -> Result<String, FrameError> {
        self.ensure_connected()?;
        Ok(self.text.clone().unwrap_or_default())
    }

    async fn get_attribute(&self, _name: &str) -> Result<Option<String>, FrameError> {
        self.ensure_connected()?;
        Ok(None)
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

// -------------------------------------------------------------------------
// Polls
// -------------------------------------------------------------------------

pub struct MockPoll {
    outcome: Mutex<Option<Result<Arc<dyn JsHandle>, FrameError>>>,
    pub canceled: AtomicBool,
}

impl MockPoll {
    pub fn resolved(handle: Arc<dyn JsHandle>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(Ok(handle))),
            canceled: AtomicBool::new(false),
        })
    }

    pub fn failing(error: FrameError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(Err(error))),
            canceled: AtomicBool::new(false),
        })
    }

    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            canceled: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl InjectedScriptPoll for MockPoll {
    async fn result(&self) -> Result<Arc<dyn JsHandle>, FrameError> {
        let outcome = self.outcome.lock().take();
        match outcome {
            Some(outcome) => outcome,
            None => futures::future::pending().await,
        }
    }

    async fn take_log(&self) -> Vec<String> {
        Vec::new()
    }

    async fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

// -------------------------------------------------------------------------
// Selector engine
// -------------------------------------------------------------------------

type WaitQueue = Arc<Mutex<VecDeque<Result<Arc<dyn JsHandle>, FrameError>>>>;

pub struct MockSelectorEngine {
    /// Outcome of each successive poll spawned by a wait task.
    wait_results: WaitQueue,
    /// World advertised for scheduled tasks.
    pub task_world: Mutex<World>,
}

impl MockSelectorEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wait_results: Arc::new(Mutex::new(VecDeque::new())),
            task_world: Mutex::new(World::Main),
        })
    }

    pub fn in_world(world: World) -> Arc<Self> {
        let engine = Self::new();
        *engine.task_world.lock() = world;
        engine
    }

    pub fn push_wait_result(&self, result: Result<Arc<dyn JsHandle>, FrameError>) {
        self.wait_results.lock().push_back(result);
    }

    pub fn push_element(&self, element: Arc<MockElement>) {
        self.push_wait_result(Ok(MockHandle::element(element) as Arc<dyn JsHandle>));
    }

    fn scheduled(&self) -> ScheduledTask {
        let queue = Arc::clone(&self.wait_results);
        let world = *self.task_world.lock();
        ScheduledTask {
            world,
            task: Arc::new(move |_context| {
                let next = queue.lock().pop_front();
                Box::pin(async move {
                    let poll = match next {
                        Some(Ok(handle)) => MockPoll::resolved(handle),
                        Some(Err(error)) => MockPoll::failing(error),
                        None => MockPoll::pending(),
                    };
                    Ok(poll as Arc<dyn InjectedScriptPoll>)
                })
            }),
        }
    }
}

#[async_trait]
impl SelectorEngine for MockSelectorEngine {
    async fn query(
        &self,
        _context: Arc<dyn ExecutionContext>,
        _selector: &str,
    ) -> Result<Option<Arc<dyn ElementHandle>>, FrameError> {
        Ok(None)
    }

    async fn query_all(
        &self,
        _context: Arc<dyn ExecutionContext>,
        _selector: &str,
    ) -> Result<Vec<Arc<dyn ElementHandle>>, FrameError> {
        Ok(Vec::new())
    }

    async fn eval_on_selector(
        &self,
        _context: Arc<dyn ExecutionContext>,
        _selector: &str,
        _expression: &str,
        _arg: Value,
    ) -> Result<Value, FrameError> {
        Ok(Value::Null)
    }

    async fn eval_on_selector_all(
        &self,
        _context: Arc<dyn ExecutionContext>,
        _selector: &str,
        _expression: &str,
        _arg: Value,
    ) -> Result<Value, FrameError> {
        Ok(Value::Null)
    }

    fn wait_for_selector_task(
        &self,
        _selector: &str,
        _state: SelectorState,
    ) -> Result<ScheduledTask, FrameError> {
        Ok(self.scheduled())
    }

    fn dispatch_event_task(
        &self,
        _selector: &str,
        _event_type: &str,
        _event_init: Value,
    ) -> Result<ScheduledTask, FrameError> {
        Ok(self.scheduled())
    }
}

// -------------------------------------------------------------------------
// Wiring helpers
// -------------------------------------------------------------------------

pub struct Harness {
    pub manager: Arc<FrameManager>,
    pub delegate: Arc<MockDelegate>,
    pub engine: Arc<MockSelectorEngine>,
}

pub fn harness() -> Harness {
    harness_with(MockDelegate::new(), MockSelectorEngine::new())
}

pub fn harness_with(delegate: Arc<MockDelegate>, engine: Arc<MockSelectorEngine>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let manager = FrameManager::new(
        Arc::clone(&delegate) as Arc<dyn PageDelegate>,
        Arc::clone(&engine) as Arc<dyn SelectorEngine>,
        TimeoutConfig::default(),
    );
    Harness {
        manager,
        delegate,
        engine,
    }
}

pub fn doc(id: &str) -> DocumentId {
    DocumentId(id.to_string())
}

pub fn fid(id: &str) -> FrameId {
    FrameId(id.to_string())
}
