//! Permission-gated facade over the coordinator, the surface handed to
//! callers that request sharing.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, ShareNotification, ShareStatus};
use crate::error::{NetShareError, Result, ShareErrorType};

/// What a caller is asking to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Start or stop sharing.
    ManageSharing,
    /// Read the sharing status.
    QueryStatus,
}

pub trait PermissionCheck: Send + Sync {
    fn check_permission(&self, caller: &str, capability: Capability) -> bool;
}

/// Permits only listed callers to manage sharing. Anyone may query status.
/// Without a list every caller is permitted.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    callers: Option<HashSet<String>>,
}

impl AllowList {
    pub fn new(callers: Option<Vec<String>>) -> Self {
        Self {
            callers: callers.map(|c| c.into_iter().collect()),
        }
    }
}

impl PermissionCheck for AllowList {
    fn check_permission(&self, caller: &str, capability: Capability) -> bool {
        match (capability, &self.callers) {
            (Capability::QueryStatus, _) | (_, None) => true,
            (Capability::ManageSharing, Some(callers)) => callers.contains(caller),
        }
    }
}

pub struct NetShareService {
    coordinator: Arc<Coordinator>,
    permissions: Arc<dyn PermissionCheck>,
}

impl NetShareService {
    pub fn new(coordinator: Arc<Coordinator>, permissions: Arc<dyn PermissionCheck>) -> Self {
        Self {
            coordinator,
            permissions,
        }
    }

    fn check(&self, caller: &str, capability: Capability) -> Result<()> {
        if self.permissions.check_permission(caller, capability) {
            Ok(())
        } else {
            warn!(%caller, ?capability, "permission denied");
            Err(NetShareError::PermissionDenied)
        }
    }

    pub async fn enable(&self, caller: &str, interfaces: &[String]) -> Result<()> {
        self.check(caller, Capability::ManageSharing)?;
        self.coordinator.enable(caller, interfaces).await
    }

    pub async fn disable(&self, caller: &str) -> Result<()> {
        self.check(caller, Capability::ManageSharing)?;
        self.coordinator.disable(caller).await
    }

    pub async fn status(&self, caller: &str) -> Result<ShareStatus> {
        self.check(caller, Capability::QueryStatus)?;
        Ok(self.coordinator.status().await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareNotification> {
        self.coordinator.subscribe()
    }

    /// Tear down a running session whose owner lost the right to share.
    /// Returns whether the session was affected.
    pub async fn permission_revoked(&self, caller: &str) -> bool {
        let status = self.coordinator.status().await;
        if status.requester.as_deref() != Some(caller) {
            return false;
        }
        info!(%caller, "session owner lost permission");
        self.coordinator
            .switch_to_error_state(ShareErrorType::PermissionLost)
            .await;
        true
    }
}

/// Log each notification as a JSON line until the channel closes. A
/// receiver that falls behind skips ahead and keeps going. Returns the
/// number of notifications logged.
pub async fn log_notifications(mut notifications: broadcast::Receiver<ShareNotification>) -> usize {
    let mut logged = 0;
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "status log fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match serde_json::to_string(&notification) {
            Ok(line) => {
                info!(target: "netshare::status", "{}", line);
                logged += 1;
            }
            Err(e) => warn!("failed to encode notification: {}", e),
        }
    }
    logged
}
