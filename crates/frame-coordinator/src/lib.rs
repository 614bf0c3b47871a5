//! Frame coordination core for a remote browser-automation engine.
//!
//! The browser hosts a tree of navigable frames and reports what happens to
//! them as an asynchronous event stream: frames attach and detach,
//! navigations are requested and committed, requests start and finish,
//! execution contexts come and go. Callers meanwhile run long, cancellable,
//! deadline-bounded operations against that tree: navigate, wait for
//! selectors, retry element actions. This crate reconciles the two.
//!
//! The browser transport, the selector engine and the DOM-handle layer are
//! external collaborators, consumed through the traits in [`contracts`].

mod barrier;
mod config;
mod contracts;
mod errors;
mod events;
mod frame;
mod frame_task;
mod manager;
mod progress;
mod rerunnable;
mod types;

pub use barrier::SignalBarrier;
pub use config::TimeoutConfig;
pub use contracts::{
    ElementHandle, ExecutionContext, InjectedScriptPoll, JsHandle, NavigateResult, NoopDelegate,
    NoopSelectorEngine, PageDelegate, Request, RequestFailure, Response, SchedulableTask,
    ScheduledTask, SelectorEngine,
};
pub use errors::FrameError;
pub use events::{ConsoleMessageKind, PageEvent};
pub use frame::Frame;
pub use frame_task::FrameTask;
pub use manager::FrameManager;
pub use progress::{run_abortable_task, Progress, ProgressController};
pub use rerunnable::RerunnableTask;
pub use types::{
    parse_wait_until, AddTagOptions, DocumentInfo, GotoOptions, Polling, SelectorState,
    SetContentOptions, UrlMatcher, WaitForFunctionOptions, WaitForNavigationOptions,
    WaitForSelectorOptions,
};

pub use frameflow_core_types::{DocumentId, FrameId, LifecycleEvent, World};
pub use frameflow_event_bus::{EventBus, EventStream};
