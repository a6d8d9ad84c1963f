//! Events consumed by the coordinator and notifications it publishes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::downstream::{DownstreamStateMachine, InterfaceStatus};
use crate::error::{NetShareError, ShareErrorType};
use crate::upstream::UpstreamChange;

/// Global sharing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No sharing session.
    Init,
    /// Sharing session running; forwarding depends on upstream availability.
    Alive,
    /// A systemic fault occurred; teardown in progress or done.
    Error,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Init => f.write_str("init"),
            CoordinatorState::Alive => f.write_str("alive"),
            CoordinatorState::Error => f.write_str("error"),
        }
    }
}

/// Everything that can drive the coordinator.
#[derive(Debug, Clone)]
pub enum ShareEvent {
    /// A caller asks to share through `interfaces`.
    EnableRequest {
        requester: String,
        interfaces: Vec<String>,
    },
    /// The owning caller asks to stop sharing.
    DisableRequest { requester: String },
    /// A downstream interface changed status.
    InterfaceActiveChanged {
        status: InterfaceStatus,
        downstream: Arc<DownstreamStateMachine>,
    },
    /// The upstream monitor reported a change.
    UpstreamInfoChanged(UpstreamChange),
    /// The upstream monitor can no longer track networks.
    UpstreamFault { reason: String },
    /// Re-run upstream selection.
    UpstreamRecheck,
    /// The last active downstream went away.
    SessionIdle,
    /// Error cleanup is done; return to Init.
    ErrorClear,
}

/// Table key derived from a [`ShareEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EnableRequest,
    DisableRequest,
    InterfaceActive,
    InterfaceInactive,
    UpstreamInfoChanged,
    UpstreamFault,
    UpstreamRecheck,
    SessionIdle,
    ErrorClear,
}

impl ShareEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ShareEvent::EnableRequest { .. } => EventKind::EnableRequest,
            ShareEvent::DisableRequest { .. } => EventKind::DisableRequest,
            ShareEvent::InterfaceActiveChanged {
                status: InterfaceStatus::Active,
                ..
            } => EventKind::InterfaceActive,
            ShareEvent::InterfaceActiveChanged {
                status: InterfaceStatus::Inactive,
                ..
            } => EventKind::InterfaceInactive,
            ShareEvent::UpstreamInfoChanged(_) => EventKind::UpstreamInfoChanged,
            ShareEvent::UpstreamFault { .. } => EventKind::UpstreamFault,
            ShareEvent::UpstreamRecheck => EventKind::UpstreamRecheck,
            ShareEvent::SessionIdle => EventKind::SessionIdle,
            ShareEvent::ErrorClear => EventKind::ErrorClear,
        }
    }
}

/// What a handler tells the dispatcher.
#[derive(Debug)]
pub(crate) enum HandlerResult {
    /// Move to the row's next state.
    Success,
    /// Stay put; the event's source delivers it again later if it still matters.
    Defer,
    /// Stay put and hand the request error back to the caller.
    Rejected(NetShareError),
    /// Systemic failure; go to Error.
    Fatal(ShareErrorType),
}

/// Outward status-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShareNotification {
    SharingStarted { requester: String },
    SharingStopped { requester: String },
    SharingError { error: ShareErrorType },
    Recovered,
    UpstreamChanged { upstream: Option<String> },
}

/// Synchronous status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ShareStatus {
    pub state: CoordinatorState,
    pub requester: Option<String>,
    pub active_interfaces: Vec<String>,
    pub current_upstream: Option<String>,
    pub forwarding: bool,
    pub error: Option<ShareErrorType>,
    pub since: Option<DateTime<Local>>,
}
