//! One navigable frame: lifecycle state, context slots, and the
//! caller-facing operation surface.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use frameflow_core_types::{DocumentId, FrameId, LifecycleEvent, World};

use crate::contracts::{
    ElementHandle, ExecutionContext, JsHandle, Request, Response, SchedulableTask,
};
use crate::errors::FrameError;
use crate::events::{ConsoleMessageKind, PageEvent};
use crate::frame_task::{await_waiter, FrameTask};
use crate::manager::FrameManager;
use crate::progress::{run_abortable_task, Progress};
use crate::rerunnable::RerunnableTask;
use crate::types::{
    AddTagOptions, GotoOptions, SelectorState, SetContentOptions, UrlMatcher,
    WaitForFunctionOptions, WaitForNavigationOptions, WaitForSelectorOptions,
};

const CONTENT_JS: &str = r#"() => {
  let retVal = '';
  if (document.doctype)
    retVal = new XMLSerializer().serializeToString(document.doctype);
  if (document.documentElement)
    retVal += document.documentElement.outerHTML;
  return retVal;
}"#;

const TITLE_JS: &str = "() => document.title";

const SET_CONTENT_JS: &str = r#"(html, tag) => {
  window.stop();
  document.open();
  console.debug(tag);
  document.write(html);
  document.close();
}"#;

const ADD_SCRIPT_URL_JS: &str = r#"async ({ url, type }) => {
  const script = document.createElement('script');
  script.src = url;
  if (type)
    script.type = type;
  const promise = new Promise((res, rej) => {
    script.onload = res;
    script.onerror = () => rej(new Error(`Failed to load script at ${script.src}`));
  });
  document.head.appendChild(script);
  await promise;
  return script;
}"#;

const ADD_SCRIPT_CONTENT_JS: &str = r#"({ content, type }) => {
  const script = document.createElement('script');
  script.type = type || 'text/javascript';
  script.text = content;
  let error = null;
  script.onerror = e => error = e;
  document.head.appendChild(script);
  if (error)
    throw error;
  return script;
}"#;

const ADD_STYLE_URL_JS: &str = r#"async url => {
  const link = document.createElement('link');
  link.rel = 'stylesheet';
  link.href = url;
  const promise = new Promise((res, rej) => {
    link.onload = res;
    link.onerror = rej;
  });
  document.head.appendChild(link);
  await promise;
  return link;
}"#;

const ADD_STYLE_CONTENT_JS: &str = r#"async content => {
  const style = document.createElement('style');
  style.type = 'text/css';
  style.appendChild(document.createTextNode(content));
  const promise = new Promise((res, rej) => {
    style.onload = res;
    style.onerror = rej;
  });
  document.head.appendChild(style);
  await promise;
  return style;
}"#;

pub(crate) struct FrameState {
    pub url: String,
    pub name: String,
    pub parent: Option<FrameId>,
    pub children: Vec<FrameId>,
    pub last_document_id: Option<DocumentId>,
    pub pending_document_id: Option<DocumentId>,
    pub fired_lifecycle: HashSet<LifecycleEvent>,
    pub inflight: HashMap<u64, Arc<Request>>,
    pub network_idle_timer: Option<JoinHandle<()>>,
}

struct ContextSlot {
    context: watch::Sender<Option<Arc<dyn ExecutionContext>>>,
    tasks: Mutex<Vec<Arc<RerunnableTask>>>,
}

impl ContextSlot {
    fn new() -> Self {
        let (context, _) = watch::channel(None);
        Self {
            context,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// One navigable browsing context inside the page.
pub struct Frame {
    manager: Weak<FrameManager>,
    id: RwLock<FrameId>,
    detached: AtomicBool,
    detach_token: CancellationToken,
    state: Mutex<FrameState>,
    main_slot: ContextSlot,
    utility_slot: ContextSlot,
    frame_tasks: Mutex<Vec<Arc<FrameTask>>>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id())
            .field("url", &self.url())
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Frame {
    pub(crate) fn new(
        manager: &Arc<FrameManager>,
        id: FrameId,
        parent: Option<FrameId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
            id: RwLock::new(id),
            detached: AtomicBool::new(false),
            detach_token: CancellationToken::new(),
            state: Mutex::new(FrameState {
                url: String::new(),
                name: String::new(),
                parent,
                children: Vec::new(),
                last_document_id: None,
                pending_document_id: None,
                fired_lifecycle: HashSet::new(),
                inflight: HashMap::new(),
                network_idle_timer: None,
            }),
            main_slot: ContextSlot::new(),
            utility_slot: ContextSlot::new(),
            frame_tasks: Mutex::new(Vec::new()),
        })
    }

    // ---------------------------------------------------------------------
    // Identity and tree accessors
    // ---------------------------------------------------------------------

    pub fn id(&self) -> FrameId {
        self.id.read().clone()
    }

    /// Re-keys the frame. Only the main frame is ever re-keyed, when the
    /// browser re-identifies it across a cross-process navigation.
    pub(crate) fn set_id(&self, id: FrameId) {
        *self.id.write() = id;
    }

    pub fn url(&self) -> String {
        self.state.lock().url.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn last_document_id(&self) -> Option<DocumentId> {
        self.state.lock().last_document_id.clone()
    }

    pub fn pending_document_id(&self) -> Option<DocumentId> {
        self.state.lock().pending_document_id.clone()
    }

    pub fn has_fired(&self, event: LifecycleEvent) -> bool {
        self.state.lock().fired_lifecycle.contains(&event)
    }

    pub fn inflight_request_count(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn parent_frame(&self) -> Option<Arc<Frame>> {
        let parent_id = self.state.lock().parent.clone()?;
        self.manager.upgrade()?.frame(&parent_id)
    }

    pub fn child_frames(&self) -> Vec<Arc<Frame>> {
        let Some(manager) = self.manager.upgrade() else {
            return Vec::new();
        };
        let children = self.state.lock().children.clone();
        children
            .iter()
            .filter_map(|id| manager.frame(id))
            .collect()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock()
    }

    pub(crate) fn manager(&self) -> Result<Arc<FrameManager>, FrameError> {
        self.manager.upgrade().ok_or(FrameError::PageDisconnected)
    }

    pub(crate) fn detach_token(&self) -> CancellationToken {
        self.detach_token.clone()
    }

    pub(crate) fn page_disconnect_token(&self) -> CancellationToken {
        match self.manager.upgrade() {
            Some(manager) => manager.disconnect_token(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Marks the frame detached. Tree pointers must already be cleared; the
    /// token cancellation is what pending operations observe.
    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.detach_token.cancel();
    }

    /// True when `event` has fired on this frame and recursively on every
    /// attached descendant.
    pub(crate) fn subtree_lifecycle_complete(&self, event: LifecycleEvent) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut pending_children = {
            let state = self.state.lock();
            if !state.fired_lifecycle.contains(&event) {
                return false;
            }
            state.children.clone()
        };
        while let Some(id) = pending_children.pop() {
            let Some(child) = manager.frame(&id) else {
                continue;
            };
            let state = child.state.lock();
            if !state.fired_lifecycle.contains(&event) {
                return false;
            }
            pending_children.extend(state.children.iter().cloned());
        }
        true
    }

    // ---------------------------------------------------------------------
    // Frame task registry
    // ---------------------------------------------------------------------

    pub(crate) fn register_frame_task(&self, task: &Arc<FrameTask>) {
        self.frame_tasks.lock().push(Arc::clone(task));
    }

    pub(crate) fn unregister_frame_task(&self, task: &Arc<FrameTask>) {
        self.frame_tasks
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, task));
    }

    pub(crate) fn frame_tasks(&self) -> Vec<Arc<FrameTask>> {
        self.frame_tasks.lock().clone()
    }

    pub(crate) fn terminate_frame_tasks(&self, error: FrameError) {
        let tasks: Vec<_> = self.frame_tasks.lock().drain(..).collect();
        for task in tasks {
            task.terminate(error.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Context slots
    // ---------------------------------------------------------------------

    fn slot(&self, world: World) -> &ContextSlot {
        match world {
            World::Main => &self.main_slot,
            World::Utility => &self.utility_slot,
        }
    }

    /// Resolves with the context active in `world` at the moment of
    /// resolution, suspending until one exists.
    pub async fn context(&self, world: World) -> Result<Arc<dyn ExecutionContext>, FrameError> {
        if self.is_detached() {
            return Err(self.detached_context_error());
        }
        let mut rx = self.slot(world).context.subscribe();
        tokio::select! {
            result = rx.wait_for(|context| context.is_some()) => match result {
                Ok(guard) => guard
                    .as_ref()
                    .cloned()
                    .ok_or_else(|| FrameError::Internal("context slot emptied mid-wait".to_string())),
                Err(_) => Err(self.detached_context_error()),
            },
            _ = self.detach_token.cancelled() => Err(self.detached_context_error()),
        }
    }

    fn detached_context_error(&self) -> FrameError {
        FrameError::FrameDetached(format!(
            "Execution Context is not available in detached frame '{}'",
            self.url()
        ))
    }

    /// Installs a freshly-created context. A racey duplicate creation on a
    /// reconnected session tears the slot down first so that waiters drain
    /// through one code path.
    pub fn context_created(&self, world: World, context: Arc<dyn ExecutionContext>) {
        let had_context = self.slot(world).context.borrow().is_some();
        if had_context {
            self.set_context(world, None);
        }
        self.set_context(world, Some(context));
    }

    /// Clears whichever world slot currently holds `context`.
    pub fn context_destroyed(&self, context: &Arc<dyn ExecutionContext>) {
        for world in [World::Main, World::Utility] {
            let held = self
                .slot(world)
                .context
                .borrow()
                .as_ref()
                .map(|current| Arc::ptr_eq(current, context))
                .unwrap_or(false);
            if held {
                self.set_context(world, None);
            }
        }
    }

    pub(crate) fn set_context(&self, world: World, context: Option<Arc<dyn ExecutionContext>>) {
        let slot = self.slot(world);
        slot.context.send_replace(context.clone());
        if let Some(context) = context {
            let tasks: Vec<_> = slot.tasks.lock().clone();
            for task in tasks {
                task.rerun(Arc::clone(&context));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Rerunnable task registry
    // ---------------------------------------------------------------------

    /// Registers a rerunnable task in `world` and kicks it off if a context
    /// is already live. The task is terminated when the operation aborts.
    pub(crate) fn schedule_rerunnable(
        self: &Arc<Self>,
        world: World,
        builder: SchedulableTask,
        progress: &Progress,
    ) -> Result<oneshot::Receiver<Result<Arc<dyn JsHandle>, FrameError>>, FrameError> {
        if self.is_detached() {
            return Err(FrameError::frame_detached());
        }
        let (task, rx) = RerunnableTask::new(self, world, progress.clone(), builder);
        self.slot(world).tasks.lock().push(Arc::clone(&task));

        let abort_task = Arc::clone(&task);
        progress.cleanup_when_aborted(move || {
            abort_task.terminate(FrameError::Internal("operation aborted".to_string()));
        });

        let current = self.slot(world).context.borrow().clone();
        if let Some(context) = current {
            task.rerun(context);
        }
        Ok(rx)
    }

    pub(crate) fn unregister_rerunnable(&self, task: &Arc<RerunnableTask>) {
        self.slot(task.world())
            .tasks
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, task));
    }

    pub(crate) fn terminate_rerunnables(&self, error: FrameError) {
        for world in [World::Main, World::Utility] {
            let tasks: Vec<_> = self.slot(world).tasks.lock().drain(..).collect();
            for task in tasks {
                if !task.is_settled() {
                    task.terminate(error.clone());
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operation plumbing
    // ---------------------------------------------------------------------

    async fn with_progress<T, F, Fut>(&self, timeout: Duration, body: F) -> Result<T, FrameError>
    where
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = Result<T, FrameError>>,
    {
        let manager = self.manager()?;
        run_abortable_task(
            timeout,
            vec![
                (manager.disconnect_token(), FrameError::PageDisconnected),
                (self.detach_token(), FrameError::frame_detached()),
            ],
            body,
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Navigation operations
    // ---------------------------------------------------------------------

    /// Navigates the frame and waits for the requested lifecycle state.
    /// Returns the final response of the top-level request, when one exists.
    pub async fn goto(
        self: &Arc<Self>,
        url: &str,
        options: GotoOptions,
    ) -> Result<Option<Arc<Response>>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().navigation_timeout(options.timeout);
        let wait_until = options.wait_until.unwrap_or(LifecycleEvent::Load);
        let referer = reconcile_referer(options.referer, manager.extra_http_headers())?;

        let frame = Arc::clone(self);
        let url = url.to_string();
        self.with_progress(timeout, move |progress| async move {
            progress.log(format!(
                "navigating to \"{url}\", waiting until \"{wait_until}\""
            ));
            let task = FrameTask::new(&frame);
            let cleanup_task = Arc::clone(&task);
            progress.cleanup_when_aborted(move || cleanup_task.done());

            // Registered up front to soak up a same-document outcome the
            // browser may produce instead of a new document.
            let same_document = task.wait_for_same_document(UrlMatcher::Any);

            let delegate = frame.manager()?.delegate();
            let navigate = delegate
                .navigate_frame(&frame.id(), &url, referer.as_deref())
                .await?;

            let document = match navigate.new_document_id {
                Some(expected) => {
                    progress.log(format!("waiting for document {expected} to commit"));
                    let committed =
                        await_waiter(task.wait_for_specific_document(expected)).await?;
                    Some(committed)
                }
                None => {
                    await_waiter(same_document).await?;
                    None
                }
            };

            await_waiter(task.wait_for_lifecycle(wait_until)).await?;

            let response = document
                .and_then(|info| info.request)
                .and_then(|request| request.final_request().response());
            task.done();
            Ok(response)
        })
        .await
    }

    /// Waits for the next navigation matching `options.url` (either shape),
    /// then for the requested lifecycle state. Returns the top-level
    /// response for a new document, `None` for a same-document navigation.
    pub async fn wait_for_navigation(
        self: &Arc<Self>,
        options: WaitForNavigationOptions,
    ) -> Result<Option<Arc<Response>>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().navigation_timeout(options.timeout);
        let wait_until = options.wait_until.unwrap_or(LifecycleEvent::Load);
        let matcher = options.url;

        let frame = Arc::clone(self);
        self.with_progress(timeout, move |progress| async move {
            progress.log("waiting for navigation");
            let task = FrameTask::new(&frame);
            let cleanup_task = Arc::clone(&task);
            progress.cleanup_when_aborted(move || cleanup_task.done());

            let mut new_document = task.wait_for_new_document(matcher.clone());
            let mut same_document = task.wait_for_same_document(matcher);

            let document = tokio::select! {
                result = &mut new_document => Some(await_waiter_result(result)?),
                result = &mut same_document => {
                    await_waiter_result(result)?;
                    None
                }
            };

            await_waiter(task.wait_for_lifecycle(wait_until)).await?;

            let response = document
                .and_then(|info| info.request)
                .and_then(|request| request.final_request().response());
            task.done();
            Ok(response)
        })
        .await
    }

    /// Waits until `state` has fired on this frame and its whole subtree.
    pub async fn wait_for_load_state(
        self: &Arc<Self>,
        state: LifecycleEvent,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().navigation_timeout(timeout);
        let frame = Arc::clone(self);
        self.with_progress(timeout, move |progress| async move {
            progress.log(format!("waiting for load state \"{state}\""));
            let task = FrameTask::new(&frame);
            let cleanup_task = Arc::clone(&task);
            progress.cleanup_when_aborted(move || cleanup_task.done());
            await_waiter(task.wait_for_lifecycle(state)).await?;
            task.done();
            Ok(())
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Selector operations
    // ---------------------------------------------------------------------

    pub async fn query_selector(
        self: &Arc<Self>,
        selector: &str,
    ) -> Result<Option<Arc<dyn ElementHandle>>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            frame.manager()?.selectors().query(context, &selector).await
        })
        .await
    }

    pub async fn query_selector_all(
        self: &Arc<Self>,
        selector: &str,
    ) -> Result<Vec<Arc<dyn ElementHandle>>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            frame
                .manager()?
                .selectors()
                .query_all(context, &selector)
                .await
        })
        .await
    }

    pub async fn eval_on_selector(
        self: &Arc<Self>,
        selector: &str,
        expression: &str,
        arg: Value,
    ) -> Result<Value, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        let expression = expression.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            frame
                .manager()?
                .selectors()
                .eval_on_selector(context, &selector, &expression, arg)
                .await
        })
        .await
    }

    pub async fn eval_on_selector_all(
        self: &Arc<Self>,
        selector: &str,
        expression: &str,
        arg: Value,
    ) -> Result<Value, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        let expression = expression.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            frame
                .manager()?
                .selectors()
                .eval_on_selector_all(context, &selector, &expression, arg)
                .await
        })
        .await
    }

    pub async fn dispatch_event(
        self: &Arc<Self>,
        selector: &str,
        event_type: &str,
        event_init: Value,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(timeout);
        let frame = Arc::clone(self);
        let scheduled = manager
            .selectors()
            .dispatch_event_task(selector, event_type, event_init)?;
        self.with_progress(timeout, move |progress| async move {
            let rx = frame.schedule_rerunnable(scheduled.world, scheduled.task, &progress)?;
            let handle = await_waiter(rx).await?;
            handle.dispose().await;
            Ok(())
        })
        .await
    }

    /// Waits for `selector` to reach `options.state`. Handles resolved in a
    /// non-main world are adopted into the main world before returning.
    pub async fn wait_for_selector(
        self: &Arc<Self>,
        selector: &str,
        options: WaitForSelectorOptions,
    ) -> Result<Option<Arc<dyn ElementHandle>>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(options.timeout);
        let state = options.state;
        let scheduled = manager.selectors().wait_for_selector_task(selector, state)?;
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        self.with_progress(timeout, move |progress| async move {
            progress.log(format!(
                "waiting for selector \"{selector}\" to be {}",
                state.as_str()
            ));
            let task_world = scheduled.world;
            let rx = frame.schedule_rerunnable(task_world, scheduled.task, &progress)?;
            let handle = await_waiter(rx).await?;

            let Some(element) = Arc::clone(&handle).as_element() else {
                // `detached` / `hidden` resolve without an element.
                handle.dispose().await;
                return Ok(None);
            };

            if task_world != World::Main {
                let main_context = frame.context(World::Main).await?;
                let adopted = frame
                    .manager()?
                    .delegate()
                    .adopt_element_handle(Arc::clone(&element), main_context)
                    .await?;
                element.dispose().await;
                Ok(Some(adopted))
            } else {
                Ok(Some(element))
            }
        })
        .await
    }

    /// Polls `expression(arg)` in the main world until it produces a truthy
    /// value.
    pub async fn wait_for_function(
        self: &Arc<Self>,
        expression: &str,
        arg: Value,
        options: WaitForFunctionOptions,
    ) -> Result<Arc<dyn JsHandle>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(options.timeout);
        let polling = options.polling;
        let frame = Arc::clone(self);
        let expression = expression.to_string();
        self.with_progress(timeout, move |progress| async move {
            progress.log("waiting for function to become truthy");
            let builder: SchedulableTask = Arc::new(move |context: Arc<dyn ExecutionContext>| {
                let expression = expression.clone();
                let arg = arg.clone();
                Box::pin(async move { context.function_poll(&expression, arg, polling).await })
            });
            let rx = frame.schedule_rerunnable(World::Main, builder, &progress)?;
            await_waiter(rx).await
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Content operations
    // ---------------------------------------------------------------------

    /// Serializes the frame's document: doctype plus documentElement HTML.
    pub async fn content(self: &Arc<Self>) -> Result<String, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Utility).await?;
            let value = context.evaluate(CONTENT_JS, Vec::new()).await?;
            match value {
                Value::String(html) => Ok(html),
                other => Err(FrameError::Evaluation(format!(
                    "expected string content, got {other}"
                ))),
            }
        })
        .await
    }

    pub async fn title(self: &Arc<Self>) -> Result<String, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Utility).await?;
            let value = context.evaluate(TITLE_JS, Vec::new()).await?;
            Ok(value.as_str().unwrap_or_default().to_string())
        })
        .await
    }

    /// Replaces the document with `html`. A unique console tag written by
    /// the in-page script tells us when the browser flushed the rewrite, at
    /// which point the lifecycle state restarts and the load wait begins.
    pub async fn set_content(
        self: &Arc<Self>,
        html: &str,
        options: SetContentOptions,
    ) -> Result<(), FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().navigation_timeout(options.timeout);
        let wait_until = options.wait_until.unwrap_or(LifecycleEvent::Load);
        let frame = Arc::clone(self);
        let html = html.to_string();
        self.with_progress(timeout, move |progress| async move {
            progress.log(format!(
                "setting frame content, waiting until \"{wait_until}\""
            ));
            let manager = frame.manager()?;
            let tag = manager.next_console_tag(&frame.id());

            let (flushed_tx, flushed_rx) = oneshot::channel();
            {
                let handler_manager = Arc::clone(&manager);
                let handler_frame = Arc::clone(&frame);
                manager.register_console_tag(
                    tag.clone(),
                    Box::new(move || {
                        handler_manager.clear_frame_lifecycle(&handler_frame);
                        let _ = flushed_tx.send(());
                    }),
                );
            }
            let cleanup_manager = Arc::clone(&manager);
            let cleanup_tag = tag.clone();
            progress.cleanup_when_aborted(move || {
                cleanup_manager.take_console_tag(&cleanup_tag);
            });

            let context = frame.context(World::Utility).await?;
            let evaluation = context.evaluate(SET_CONTENT_JS, vec![json!(html), json!(tag)]);

            let lifecycle_frame = Arc::clone(&frame);
            let lifecycle = async move {
                if flushed_rx.await.is_err() {
                    // The tag never flushed; nothing to wait on.
                    return Ok(());
                }
                let task = FrameTask::new(&lifecycle_frame);
                let result = await_waiter(task.wait_for_lifecycle(wait_until)).await;
                task.done();
                result
            };

            let (evaluated, waited) = tokio::join!(evaluation, lifecycle);
            evaluated?;
            waited
        })
        .await
    }

    /// Appends a `<script>` element built from exactly one of url, path or
    /// content. A path source gets a `sourceURL` annotation so the page's
    /// devtools attribute it correctly.
    pub async fn add_script_tag(
        self: &Arc<Self>,
        options: AddTagOptions,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        self.with_progress(timeout, move |_progress| async move {
            let manager = frame.manager()?;
            let AddTagOptions {
                url,
                path,
                content,
                tag_type,
            } = validate_tag_options(options)?;

            let context = frame.context(World::Main).await?;
            if let Some(url) = url {
                let handle = context
                    .evaluate_handle(
                        ADD_SCRIPT_URL_JS,
                        vec![json!({ "url": url, "type": tag_type })],
                    )
                    .await?;
                return element_from(handle, "script");
            }

            let content = match path {
                Some(path) => {
                    let mut text = read_tag_source(&path).await?;
                    text.push_str(&script_source_url(&path));
                    text
                }
                None => content.unwrap_or_default(),
            };

            let evaluation = context.evaluate_handle(
                ADD_SCRIPT_CONTENT_JS,
                vec![json!({ "content": content, "type": tag_type })],
            );
            let handle = if manager
                .delegate()
                .csp_errors_asynchronous_for_inline_scripts()
            {
                race_against_csp_error(&manager, evaluation).await?
            } else {
                evaluation.await?
            };
            element_from(handle, "script")
        })
        .await
    }

    /// Appends a `<link>`/`<style>` element, mirroring `add_script_tag`.
    pub async fn add_style_tag(
        self: &Arc<Self>,
        options: AddTagOptions,
    ) -> Result<Arc<dyn ElementHandle>, FrameError> {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        self.with_progress(timeout, move |_progress| async move {
            let manager = frame.manager()?;
            let AddTagOptions {
                url,
                path,
                content,
                tag_type: _,
            } = validate_tag_options(options)?;

            let context = frame.context(World::Main).await?;
            if let Some(url) = url {
                let handle = context
                    .evaluate_handle(ADD_STYLE_URL_JS, vec![json!(url)])
                    .await?;
                return element_from(handle, "style");
            }

            let content = match path {
                Some(path) => {
                    let mut text = read_tag_source(&path).await?;
                    text.push_str(&style_source_url(&path));
                    text
                }
                None => content.unwrap_or_default(),
            };

            let evaluation = context.evaluate_handle(ADD_STYLE_CONTENT_JS, vec![json!(content)]);
            let handle = if manager
                .delegate()
                .csp_errors_asynchronous_for_inline_scripts()
            {
                race_against_csp_error(&manager, evaluation).await?
            } else {
                evaluation.await?
            };
            element_from(handle, "style")
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------------

    pub async fn evaluate(
        self: &Arc<Self>,
        expression: &str,
        args: Vec<Value>,
    ) -> Result<Value, FrameError> {
        check_arg_count(&args)?;
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let expression = expression.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            context.evaluate(&expression, args).await
        })
        .await
    }

    pub async fn evaluate_handle(
        self: &Arc<Self>,
        expression: &str,
        args: Vec<Value>,
    ) -> Result<Arc<dyn JsHandle>, FrameError> {
        check_arg_count(&args)?;
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(None);
        let frame = Arc::clone(self);
        let expression = expression.to_string();
        self.with_progress(timeout, move |_progress| async move {
            let context = frame.context(World::Main).await?;
            context.evaluate_handle(&expression, args).await
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Misc operations
    // ---------------------------------------------------------------------

    /// Sleeps for `duration`. Discouraged outside debugging; the page notes
    /// the use so the hint subsystem can warn.
    pub async fn wait_for_timeout(&self, duration: Duration) -> Result<(), FrameError> {
        let manager = self.manager()?;
        manager.note_wait_for_timeout();
        let disconnect_token = manager.disconnect_token();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = disconnect_token.cancelled() => Err(FrameError::PageDisconnected),
            _ = self.detach_token.cancelled() => Err(FrameError::frame_detached()),
        }
    }

    /// Resolves the `<iframe>`/`<frame>` element hosting this frame.
    pub async fn frame_element(self: &Arc<Self>) -> Result<Arc<dyn ElementHandle>, FrameError> {
        let manager = self.manager()?;
        manager.delegate().frame_element(&self.id()).await
    }

    // ---------------------------------------------------------------------
    // Element actions (retry-with-selector protocol)
    // ---------------------------------------------------------------------

    /// Runs `action` against the element currently matching `selector`,
    /// re-resolving and retrying under the same deadline whenever the node
    /// is detached between resolution and the action.
    async fn retry_action<T, F>(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
        action_name: &'static str,
        action: F,
    ) -> Result<T, FrameError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ElementHandle>) -> BoxFuture<'static, Result<T, FrameError>> + Send + Sync,
    {
        let manager = self.manager()?;
        let timeout = manager.timeouts().operation_timeout(timeout);
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        self.with_progress(timeout, move |progress| async move {
            progress.log(format!(
                "waiting for selector \"{selector}\" before {action_name}"
            ));
            while progress.is_running() {
                let scheduled = frame
                    .manager()?
                    .selectors()
                    .wait_for_selector_task(&selector, SelectorState::Attached)?;
                let rx = frame.schedule_rerunnable(scheduled.world, scheduled.task, &progress)?;
                let handle = await_waiter(rx).await?;
                let Some(element) = Arc::clone(&handle).as_element() else {
                    handle.dispose().await;
                    continue;
                };

                let abort_element = Arc::clone(&element);
                progress.cleanup_when_aborted(move || {
                    tokio::spawn(async move {
                        abort_element.dispose().await;
                    });
                });

                match action(Arc::clone(&element)).await {
                    Ok(value) => {
                        element.dispose().await;
                        return Ok(value);
                    }
                    Err(FrameError::NotConnected(_)) => {
                        progress.log("element was detached from the DOM, retrying");
                        element.dispose().await;
                    }
                    Err(error) => {
                        element.dispose().await;
                        return Err(error);
                    }
                }
            }
            Err(FrameError::Timeout(format!(
                "Timeout {}ms exceeded.",
                timeout.as_millis()
            )))
        })
        .await
    }

    async fn input_action<T, F>(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
        action_name: &'static str,
        action: F,
    ) -> Result<T, FrameError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ElementHandle>) -> BoxFuture<'static, Result<T, FrameError>> + Send + Sync,
    {
        let manager = self.manager()?;
        let frame = Arc::clone(self);
        let selector = selector.to_string();
        manager
            .wait_for_signals_created_by(async move {
                frame
                    .retry_action(&selector, timeout, action_name, action)
                    .await
            })
            .await
    }

    pub async fn click(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "click", |element| {
            Box::pin(async move { element.click().await })
        })
        .await
    }

    pub async fn dblclick(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "dblclick", |element| {
            Box::pin(async move { element.dblclick().await })
        })
        .await
    }

    pub async fn hover(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "hover", |element| {
            Box::pin(async move { element.hover().await })
        })
        .await
    }

    pub async fn focus(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "focus", |element| {
            Box::pin(async move { element.focus().await })
        })
        .await
    }

    pub async fn check(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "check", |element| {
            Box::pin(async move { element.check().await })
        })
        .await
    }

    pub async fn uncheck(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "uncheck", |element| {
            Box::pin(async move { element.uncheck().await })
        })
        .await
    }

    pub async fn fill(
        self: &Arc<Self>,
        selector: &str,
        value: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        let value = value.to_string();
        self.input_action(selector, timeout, "fill", move |element| {
            let value = value.clone();
            Box::pin(async move { element.fill(&value).await })
        })
        .await
    }

    pub async fn type_text(
        self: &Arc<Self>,
        selector: &str,
        text: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        let text = text.to_string();
        self.input_action(selector, timeout, "type", move |element| {
            let text = text.clone();
            Box::pin(async move { element.type_text(&text).await })
        })
        .await
    }

    pub async fn press(
        self: &Arc<Self>,
        selector: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        let key = key.to_string();
        self.input_action(selector, timeout, "press", move |element| {
            let key = key.clone();
            Box::pin(async move { element.press(&key).await })
        })
        .await
    }

    pub async fn select_option(
        self: &Arc<Self>,
        selector: &str,
        values: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, FrameError> {
        self.input_action(selector, timeout, "selectOption", move |element| {
            let values = values.clone();
            Box::pin(async move { element.select_option(&values).await })
        })
        .await
    }

    pub async fn set_input_files(
        self: &Arc<Self>,
        selector: &str,
        files: Vec<std::path::PathBuf>,
        timeout: Option<Duration>,
    ) -> Result<(), FrameError> {
        self.input_action(selector, timeout, "setInputFiles", move |element| {
            let files = files.clone();
            Box::pin(async move { element.set_input_files(&files).await })
        })
        .await
    }

    pub async fn text_content(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, FrameError> {
        self.retry_action(selector, timeout, "textContent", |element| {
            Box::pin(async move { element.text_content().await })
        })
        .await
    }

    pub async fn inner_text(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<String, FrameError> {
        self.retry_action(selector, timeout, "innerText", |element| {
            Box::pin(async move { element.inner_text().await })
        })
        .await
    }

    pub async fn inner_html(
        self: &Arc<Self>,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<String, FrameError> {
        self.retry_action(selector, timeout, "innerHTML", |element| {
            Box::pin(async move { element.inner_html().await })
        })
        .await
    }

    pub async fn get_attribute(
        self: &Arc<Self>,
        selector: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, FrameError> {
        let name = name.to_string();
        self.retry_action(selector, timeout, "getAttribute", move |element| {
            let name = name.clone();
            Box::pin(async move { element.get_attribute(&name).await })
        })
        .await
    }
}

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn check_arg_count(args: &[Value]) -> Result<(), FrameError> {
    if args.len() > 2 {
        return Err(FrameError::invalid_argument(
            "evaluation accepts at most two arguments",
        ));
    }
    Ok(())
}

fn reconcile_referer(
    explicit: Option<String>,
    headers: HashMap<String, String>,
) -> Result<Option<String>, FrameError> {
    let header_referer = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("referer"))
        .map(|(_, value)| value.clone());
    match (explicit, header_referer) {
        (Some(explicit), Some(header)) if explicit != header => Err(
            FrameError::invalid_argument("\"referer\" is already specified as extra HTTP header"),
        ),
        (Some(explicit), _) => Ok(Some(explicit)),
        (None, header) => Ok(header),
    }
}

fn validate_tag_options(options: AddTagOptions) -> Result<AddTagOptions, FrameError> {
    let provided = [
        options.url.is_some(),
        options.path.is_some(),
        options.content.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if provided != 1 {
        return Err(FrameError::invalid_argument(
            "provide exactly one of \"url\", \"path\" or \"content\"",
        ));
    }
    Ok(options)
}

async fn read_tag_source(path: &Path) -> Result<String, FrameError> {
    tokio::fs::read_to_string(path).await.map_err(|err| {
        FrameError::invalid_argument(format!("failed to read {}: {err}", path.display()))
    })
}

fn sanitized_source_path(path: &Path) -> String {
    path.display().to_string().replace(['\n', '\r'], "")
}

fn script_source_url(path: &Path) -> String {
    format!("\n//# sourceURL={}", sanitized_source_path(path))
}

fn style_source_url(path: &Path) -> String {
    format!("\n/*# sourceURL={}*/", sanitized_source_path(path))
}

fn element_from(
    handle: Arc<dyn JsHandle>,
    kind: &str,
) -> Result<Arc<dyn ElementHandle>, FrameError> {
    Arc::clone(&handle).as_element().ok_or_else(|| {
        FrameError::Evaluation(format!("in-page builder did not produce a {kind} element"))
    })
}

fn await_waiter_result<T>(
    result: Result<Result<T, FrameError>, oneshot::error::RecvError>,
) -> Result<T, FrameError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(FrameError::Internal(
            "navigation observer dropped before settling".to_string(),
        )),
    }
}

/// Races an evaluation against a console error mentioning Content Security
/// Policy; the console message wins with a [`FrameError::Csp`].
async fn race_against_csp_error<T>(
    manager: &Arc<FrameManager>,
    evaluation: impl Future<Output = Result<T, FrameError>>,
) -> Result<T, FrameError> {
    let mut events = manager.bus().listen();
    tokio::pin!(evaluation);
    loop {
        tokio::select! {
            result = &mut evaluation => return result,
            event = events.next() => match event {
                Some(PageEvent::Console { kind: ConsoleMessageKind::Error, text })
                    if text.contains("Content Security Policy") =>
                {
                    return Err(FrameError::Csp(text));
                }
                Some(_) => continue,
                None => return evaluation.await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::contracts::{NoopDelegate, NoopSelectorEngine};
    use crate::manager::FrameManager;
    use async_trait::async_trait;
    use frameflow_core_types::FrameId;

    #[derive(Debug)]
    struct TestContext {
        world: World,
    }

    #[async_trait]
    impl ExecutionContext for TestContext {
        fn world(&self) -> World {
            self.world
        }

        async fn evaluate(
            &self,
            _expression: &str,
            _args: Vec<Value>,
        ) -> Result<Value, FrameError> {
            Ok(Value::Null)
        }

        async fn evaluate_handle(
            &self,
            _expression: &str,
            _args: Vec<Value>,
        ) -> Result<Arc<dyn JsHandle>, FrameError> {
            Err(FrameError::Internal("not implemented".to_string()))
        }

        async fn function_poll(
            &self,
            _expression: &str,
            _arg: Value,
            _polling: crate::types::Polling,
        ) -> Result<Arc<dyn crate::contracts::InjectedScriptPoll>, FrameError> {
            Err(FrameError::Internal("not implemented".to_string()))
        }
    }

    fn test_frame() -> (Arc<FrameManager>, Arc<Frame>) {
        let manager = FrameManager::new(
            Arc::new(NoopDelegate),
            Arc::new(NoopSelectorEngine),
            TimeoutConfig::default(),
        );
        let frame = manager.frame_attached(FrameId("main".to_string()), None);
        (manager, frame)
    }

    fn test_context(world: World) -> Arc<dyn ExecutionContext> {
        Arc::new(TestContext { world })
    }

    #[tokio::test]
    async fn context_waiters_resolve_with_installed_context() {
        let (_manager, frame) = test_frame();

        let waiter_frame = Arc::clone(&frame);
        let waiter = tokio::spawn(async move { waiter_frame.context(World::Main).await });
        tokio::task::yield_now().await;

        let context = test_context(World::Main);
        frame.context_created(World::Main, Arc::clone(&context));

        let resolved = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&resolved, &context));
    }

    #[tokio::test]
    async fn duplicate_context_creation_replaces_through_null() {
        let (_manager, frame) = test_frame();

        let first = test_context(World::Utility);
        let second = test_context(World::Utility);
        frame.context_created(World::Utility, Arc::clone(&first));
        frame.context_created(World::Utility, Arc::clone(&second));

        let resolved = frame.context(World::Utility).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &second));
    }

    #[tokio::test]
    async fn destroying_the_current_context_empties_the_slot() {
        let (_manager, frame) = test_frame();

        let context = test_context(World::Main);
        frame.context_created(World::Main, Arc::clone(&context));
        frame.context_destroyed(&context);

        // The slot is empty again: a fresh waiter stays pending until a new
        // context arrives.
        let waiter_frame = Arc::clone(&frame);
        let waiter = tokio::spawn(async move { waiter_frame.context(World::Main).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let replacement = test_context(World::Main);
        frame.context_created(World::Main, Arc::clone(&replacement));
        let resolved = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&resolved, &replacement));
    }

    #[tokio::test]
    async fn destroying_a_stale_context_leaves_the_slot_alone() {
        let (_manager, frame) = test_frame();

        let old = test_context(World::Main);
        let current = test_context(World::Main);
        frame.context_created(World::Main, Arc::clone(&old));
        frame.context_created(World::Main, Arc::clone(&current));

        frame.context_destroyed(&old);

        let resolved = frame.context(World::Main).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &current));
    }

    #[tokio::test]
    async fn detached_frame_rejects_context_acquisition() {
        let (manager, frame) = test_frame();
        manager.frame_committed_new_document(
            &frame.id(),
            "https://a/",
            "",
            DocumentId("doc".to_string()),
            true,
        );
        manager.frame_detached(&frame.id());

        let error = frame.context(World::Main).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Execution Context is not available in detached frame 'https://a/'"
        );
    }

    #[tokio::test]
    async fn detach_during_context_wait_rejects_the_waiter() {
        let (manager, frame) = test_frame();

        let waiter_frame = Arc::clone(&frame);
        let waiter = tokio::spawn(async move { waiter_frame.context(World::Utility).await });
        tokio::task::yield_now().await;

        manager.frame_detached(&frame.id());

        let error = waiter.await.unwrap().unwrap_err();
        assert!(matches!(error, FrameError::FrameDetached(_)));
    }

    #[tokio::test]
    async fn subtree_lifecycle_requires_all_descendants() {
        let (manager, main) = test_frame();
        let child = manager.frame_attached(
            FrameId("child".to_string()),
            Some(FrameId("main".to_string())),
        );

        manager.frame_lifecycle_event(&main.id(), LifecycleEvent::Load);
        assert!(!main.subtree_lifecycle_complete(LifecycleEvent::Load));

        manager.frame_lifecycle_event(&child.id(), LifecycleEvent::Load);
        assert!(main.subtree_lifecycle_complete(LifecycleEvent::Load));
        assert!(child.subtree_lifecycle_complete(LifecycleEvent::Load));
    }

    #[tokio::test]
    async fn referer_conflict_is_rejected() {
        let mut headers = HashMap::new();
        headers.insert("Referer".to_string(), "https://a/".to_string());
        let err =
            reconcile_referer(Some("https://b/".to_string()), headers.clone()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidArgument { .. }));

        // Matching values and header-only values are both fine.
        assert_eq!(
            reconcile_referer(Some("https://a/".to_string()), headers.clone()).unwrap(),
            Some("https://a/".to_string())
        );
        assert_eq!(
            reconcile_referer(None, headers).unwrap(),
            Some("https://a/".to_string())
        );
    }

    #[tokio::test]
    async fn evaluation_arg_count_is_bounded() {
        let (_manager, frame) = test_frame();
        frame.context_created(World::Main, test_context(World::Main));
        let err = frame
            .evaluate("() => 1", vec![Value::Null, Value::Null, Value::Null])
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidArgument { .. }));
    }

    #[test]
    fn source_url_annotations_strip_newlines() {
        let path = std::path::Path::new("dir\nwith/newline.js");
        assert_eq!(script_source_url(path), "\n//# sourceURL=dirwith/newline.js");
        assert_eq!(
            style_source_url(std::path::Path::new("a.css")),
            "\n/*# sourceURL=a.css*/"
        );
    }
}
