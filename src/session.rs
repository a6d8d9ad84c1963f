//! Sharing session: the transient state that exists while sharing is
//! requested or running, reset whenever the coordinator enters Init.

use std::collections::BTreeSet;

use chrono::{DateTime, Local};

use crate::upstream::UpstreamInfo;

/// Per-session fields owned by the coordinator.
#[derive(Debug, Default)]
pub struct SharingSession {
    /// Caller that requested sharing. Set while a request is pending in Init
    /// or a session is Alive.
    pub requester: Option<String>,
    /// Downstreams named by the requester. Only these may join on link-up.
    pub interfaces: BTreeSet<String>,
    /// Upstream selected for forwarding.
    pub upstream: Option<UpstreamInfo>,
    /// Forwarding is applied against `upstream`.
    has_set_forward: bool,
    /// When the session became Alive.
    pub started_at: Option<DateTime<Local>>,
}

impl SharingSession {
    pub fn has_set_forward(&self) -> bool {
        self.has_set_forward
    }

    /// Only the coordinator's turn-on/turn-off paths call this.
    pub(crate) fn set_forward(&mut self, applied: bool) {
        self.has_set_forward = applied;
    }

    pub fn upstream_iface(&self) -> Option<&str> {
        self.upstream.as_ref().map(|u| u.iface.as_str())
    }

    pub fn is_requested_by(&self, requester: &str) -> bool {
        self.requester.as_deref() == Some(requester)
    }

    /// Whether `iface` belongs to the current request.
    pub fn wants(&self, iface: &str) -> bool {
        self.requester.is_some() && self.interfaces.contains(iface)
    }

    /// Forget the requester and its interfaces.
    pub fn release(&mut self) {
        self.requester = None;
        self.interfaces.clear();
    }
}
