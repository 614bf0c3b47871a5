//! Caller-facing option and matcher types.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use frameflow_core_types::{DocumentId, LifecycleEvent};

use crate::contracts::Request;
use crate::errors::FrameError;

/// URL filter applied by navigation waits.
#[derive(Clone)]
pub enum UrlMatcher {
    /// Matches every URL.
    Any,
    /// Exact string equality.
    Exact(String),
    /// Glob pattern (`*` and `**` wildcards).
    Glob(Arc<glob::Pattern>),
    /// Arbitrary caller predicate.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl UrlMatcher {
    /// Builds a glob matcher; an invalid pattern falls back to exact
    /// matching of the literal text.
    pub fn glob(pattern: &str) -> Self {
        match glob::Pattern::new(pattern) {
            Ok(compiled) => UrlMatcher::Glob(Arc::new(compiled)),
            Err(_) => UrlMatcher::Exact(pattern.to_string()),
        }
    }

    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        UrlMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Any => true,
            UrlMatcher::Exact(expected) => expected == url,
            UrlMatcher::Glob(pattern) => pattern.matches(url),
            UrlMatcher::Predicate(f) => f(url),
        }
    }
}

impl fmt::Debug for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlMatcher::Any => f.write_str("UrlMatcher::Any"),
            UrlMatcher::Exact(s) => write!(f, "UrlMatcher::Exact({s:?})"),
            UrlMatcher::Glob(p) => write!(f, "UrlMatcher::Glob({:?})", p.as_str()),
            UrlMatcher::Predicate(_) => f.write_str("UrlMatcher::Predicate(..)"),
        }
    }
}

impl Default for UrlMatcher {
    fn default() -> Self {
        UrlMatcher::Any
    }
}

/// Target state for `wait_for_selector`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SelectorState {
    Attached,
    Detached,
    Visible,
    Hidden,
}

impl SelectorState {
    pub fn parse(value: &str) -> Result<Self, FrameError> {
        match value {
            "attached" => Ok(SelectorState::Attached),
            "detached" => Ok(SelectorState::Detached),
            "visible" => Ok(SelectorState::Visible),
            "hidden" => Ok(SelectorState::Hidden),
            other => Err(FrameError::invalid_argument(format!(
                "state: expected one of (attached|detached|visible|hidden), got {other:?}"
            ))),
        }
    }

    /// Resolves the selector state from raw caller options, rejecting the
    /// legacy spellings with a hint toward `state`.
    pub fn from_raw_options(
        state: Option<&str>,
        visibility: Option<&str>,
        wait_for: Option<&str>,
    ) -> Result<Self, FrameError> {
        if visibility.is_some() {
            return Err(FrameError::invalid_argument_with_hint(
                "options.visibility is not supported",
                "did you mean options.state?",
            ));
        }
        if let Some(wait_for) = wait_for {
            if wait_for != "visible" {
                return Err(FrameError::invalid_argument_with_hint(
                    "options.waitFor is not supported",
                    "did you mean options.state?",
                ));
            }
        }
        match state {
            Some(raw) => Self::parse(raw),
            None => Ok(SelectorState::Visible),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorState::Attached => "attached",
            SelectorState::Detached => "detached",
            SelectorState::Visible => "visible",
            SelectorState::Hidden => "hidden",
        }
    }
}

/// Polling cadence for `wait_for_function`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Polling {
    /// Re-evaluate on every animation frame.
    Raf,
    /// Re-evaluate on a fixed interval.
    Interval(Duration),
}

impl Polling {
    pub fn interval_ms(ms: u64) -> Result<Self, FrameError> {
        if ms == 0 {
            return Err(FrameError::invalid_argument(
                "polling interval must be a positive number of milliseconds",
            ));
        }
        Ok(Polling::Interval(Duration::from_millis(ms)))
    }
}

impl Default for Polling {
    fn default() -> Self {
        Polling::Raf
    }
}

/// Parses an embedder-facing `waitUntil` value. `networkidle0` is accepted
/// as a legacy alias; anything else is a caller error.
pub fn parse_wait_until(raw: &str) -> Result<LifecycleEvent, FrameError> {
    LifecycleEvent::parse(raw).ok_or_else(|| {
        FrameError::invalid_argument(format!(
            "waitUntil: expected one of (load|domcontentloaded|networkidle), got {raw:?}"
        ))
    })
}

/// A committed document paired with the top-level request that produced it.
/// Same-document navigations and provisional failures carry no request.
#[derive(Clone, Debug)]
pub struct DocumentInfo {
    pub document_id: DocumentId,
    pub request: Option<Arc<Request>>,
}

/// Options for `Frame::goto`.
#[derive(Clone, Debug, Default)]
pub struct GotoOptions {
    pub timeout: Option<Duration>,
    pub wait_until: Option<LifecycleEvent>,
    pub referer: Option<String>,
}

/// Options for `Frame::wait_for_navigation`.
#[derive(Clone, Debug, Default)]
pub struct WaitForNavigationOptions {
    pub timeout: Option<Duration>,
    pub wait_until: Option<LifecycleEvent>,
    pub url: UrlMatcher,
}

/// Options for `Frame::wait_for_selector`.
#[derive(Clone, Debug)]
pub struct WaitForSelectorOptions {
    pub timeout: Option<Duration>,
    pub state: SelectorState,
}

impl Default for WaitForSelectorOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            state: SelectorState::Visible,
        }
    }
}

/// Options for `Frame::wait_for_function`.
#[derive(Clone, Debug, Default)]
pub struct WaitForFunctionOptions {
    pub timeout: Option<Duration>,
    pub polling: Polling,
}

/// Options for `Frame::set_content`.
#[derive(Clone, Debug, Default)]
pub struct SetContentOptions {
    pub timeout: Option<Duration>,
    pub wait_until: Option<LifecycleEvent>,
}

/// Source for `add_script_tag` / `add_style_tag`. Exactly one of `url`,
/// `path`, `content` must be provided.
#[derive(Clone, Debug, Default)]
pub struct AddTagOptions {
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub content: Option<String>,
    /// `type` attribute, scripts only.
    pub tag_type: Option<String>,
}
