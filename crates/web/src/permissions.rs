//! Per-VM permission gate.
//!
//! Global admins may do anything. Everyone else needs an assignment for the
//! exact (vm id, node) pair that contains the capability the requested action
//! maps to. A missing assignment and an assignment lacking the capability are
//! both reported as the same `Forbidden` so callers cannot probe which VMs
//! exist.

use tracing::{debug, warn};

use crate::blocking;
use vmrelay_common::{Capability, Database, Error, Result, VmAction};

/// Authorizes capabilities against VMs
#[derive(Clone)]
pub struct PermissionGate {
    db: Database,
}

impl PermissionGate {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Check that `user_id` holds `capability` on VM `vmid` of `node`
    pub async fn authorize(&self, user_id: &str, node: &str, vmid: u32, capability: Capability) -> Result<()> {
        let (uid, node_name) = (user_id.to_string(), node.to_string());
        let allowed = blocking(&self.db, move |db| {
            let Some(user) = db.get_user(&uid)? else {
                return Ok(false);
            };
            if user.is_admin() {
                return Ok(true);
            }
            Ok(db
                .get_vm_permissions(&uid, vmid, &node_name)?
                .map(|a| a.allows(capability))
                .unwrap_or(false))
        })
        .await?;

        if allowed {
            debug!(user_id, node, vmid, capability = capability.as_str(), "permission granted");
            Ok(())
        } else {
            warn!(user_id, node, vmid, capability = capability.as_str(), "permission denied");
            Err(Error::Authorization(format!(
                "{} access to VM {} on {} is not permitted",
                capability.as_str(),
                vmid,
                node
            )))
        }
    }

    /// Check the capability a VM action maps to
    pub async fn authorize_action(&self, user_id: &str, node: &str, vmid: u32, action: VmAction) -> Result<()> {
        self.authorize(user_id, node, vmid, action.capability()).await
    }

    /// Whether the user holds the global admin role
    pub async fn is_admin(&self, user_id: &str) -> Result<bool> {
        let uid = user_id.to_string();
        blocking(&self.db, move |db| Ok(db.get_user(&uid)?.map(|u| u.is_admin()).unwrap_or(false))).await
    }
}
