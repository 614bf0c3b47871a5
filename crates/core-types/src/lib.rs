//! Shared identifier and enum types for the frame coordination crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one navigable frame inside a page.
///
/// The browser may re-key the main frame across a cross-process navigation;
/// the id is therefore an opaque string rather than a stable handle.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier minted by the browser when a new top-level document load
/// begins. Same-document navigations do not mint a new id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolated JavaScript global scope used to evaluate code inside a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum World {
    /// The page's own scope.
    Main,
    /// A private scope reserved for the automation engine.
    Utility,
}

impl World {
    pub fn as_str(&self) -> &'static str {
        match self {
            World::Main => "main",
            World::Utility => "utility",
        }
    }
}

impl fmt::Display for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame lifecycle milestones observed as independent set-membership
/// predicates. `networkidle` is derived from request-idle rather than
/// reported by the browser.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 3] = [
        LifecycleEvent::DomContentLoaded,
        LifecycleEvent::Load,
        LifecycleEvent::NetworkIdle,
    ];

    /// Parses the embedder-facing spelling. `networkidle0` is accepted as a
    /// legacy alias for `networkidle`; anything else is a caller error.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "domcontentloaded" => Some(LifecycleEvent::DomContentLoaded),
            "load" => Some(LifecycleEvent::Load),
            "networkidle" | "networkidle0" => Some(LifecycleEvent::NetworkIdle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::DomContentLoaded => "domcontentloaded",
            LifecycleEvent::Load => "load",
            LifecycleEvent::NetworkIdle => "networkidle",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
