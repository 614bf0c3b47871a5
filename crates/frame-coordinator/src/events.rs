//! Page-level events emitted to the embedder.

use std::sync::Arc;

use frameflow_core_types::FrameId;

use crate::contracts::{Request, Response};

/// Console message categories the core cares about. The browser reports many
/// more; everything unrecognised lands in `Other`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsoleMessageKind {
    Log,
    Debug,
    Info,
    Warning,
    Error,
    Other,
}

impl ConsoleMessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "log" => ConsoleMessageKind::Log,
            "debug" => ConsoleMessageKind::Debug,
            "info" => ConsoleMessageKind::Info,
            "warning" => ConsoleMessageKind::Warning,
            "error" => ConsoleMessageKind::Error,
            _ => ConsoleMessageKind::Other,
        }
    }
}

/// Event surface published on the page bus. The names are part of the
/// public embedder contract.
#[derive(Clone, Debug)]
pub enum PageEvent {
    FrameAttached {
        frame_id: FrameId,
    },
    FrameDetached {
        frame_id: FrameId,
    },
    FrameNavigated {
        frame_id: FrameId,
        url: String,
    },
    DomContentLoaded,
    Load,
    Request {
        request: Arc<Request>,
    },
    Response {
        response: Arc<Response>,
    },
    RequestFinished {
        request: Arc<Request>,
    },
    RequestFailed {
        request: Arc<Request>,
    },
    Console {
        kind: ConsoleMessageKind,
        text: String,
    },
}
