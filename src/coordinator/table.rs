//! Transition table: (event, current state) -> (handler, next state).

use super::event::{CoordinatorState, EventKind};

/// Handler invoked for a matched row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    InitEnable,
    InitDisable,
    InitInterfaceActive,
    InitInterfaceInactive,
    AliveEnable,
    AliveDisable,
    AliveInterfaceActive,
    AliveInterfaceInactive,
    AliveUpstreamChanged,
    AliveUpstreamFault,
    AliveSessionIdle,
    ErrorEnable,
    ErrorInterfaceActive,
    ErrorInterfaceInactive,
    ErrorClear,
}

#[derive(Debug)]
pub(crate) struct TransitionRow {
    pub event: EventKind,
    pub current: CoordinatorState,
    pub next: CoordinatorState,
    pub handler: Handler,
}

const fn row(
    event: EventKind,
    current: CoordinatorState,
    next: CoordinatorState,
    handler: Handler,
) -> TransitionRow {
    TransitionRow {
        event,
        current,
        next,
        handler,
    }
}

use CoordinatorState::{Alive, Error, Init};

pub(crate) static TRANSITIONS: &[TransitionRow] = &[
    row(EventKind::EnableRequest, Init, Alive, Handler::InitEnable),
    row(EventKind::EnableRequest, Alive, Alive, Handler::AliveEnable),
    row(EventKind::EnableRequest, Error, Error, Handler::ErrorEnable),
    row(EventKind::DisableRequest, Init, Init, Handler::InitDisable),
    row(EventKind::DisableRequest, Alive, Init, Handler::AliveDisable),
    row(EventKind::InterfaceActive, Init, Alive, Handler::InitInterfaceActive),
    row(EventKind::InterfaceInactive, Init, Init, Handler::InitInterfaceInactive),
    row(EventKind::InterfaceActive, Alive, Alive, Handler::AliveInterfaceActive),
    row(EventKind::InterfaceInactive, Alive, Alive, Handler::AliveInterfaceInactive),
    row(EventKind::InterfaceActive, Error, Error, Handler::ErrorInterfaceActive),
    row(EventKind::InterfaceInactive, Error, Error, Handler::ErrorInterfaceInactive),
    row(EventKind::UpstreamInfoChanged, Alive, Alive, Handler::AliveUpstreamChanged),
    row(EventKind::UpstreamRecheck, Alive, Alive, Handler::AliveUpstreamChanged),
    row(EventKind::UpstreamFault, Alive, Error, Handler::AliveUpstreamFault),
    row(EventKind::SessionIdle, Alive, Init, Handler::AliveSessionIdle),
    row(EventKind::ErrorClear, Error, Init, Handler::ErrorClear),
];

pub(crate) fn lookup(event: EventKind, current: CoordinatorState) -> Option<&'static TransitionRow> {
    TRANSITIONS
        .iter()
        .find(|r| r.event == event && r.current == current)
}
