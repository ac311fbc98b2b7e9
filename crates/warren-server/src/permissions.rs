//! Module/operation permission checks

use std::sync::Arc;

use warren_core::error::{Error, Result};

use crate::queries;
use crate::store::{LockingStrength, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Peers,
    Groups,
    Policies,
    Routers,
    SetupKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Update,
    Delete,
}

pub struct PermissionsManager {
    store: Arc<Store>,
}

impl PermissionsManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Maps (user, module, operation) to allow/deny. Admins and owners are
    /// allowed everything; regular users are denied here and fall back to
    /// ownership-scoped paths. A missing user or an account mismatch is a
    /// validation failure, not a denial.
    pub async fn validate_user_permissions(
        &self,
        account_id: &str,
        user_id: &str,
        _module: Module,
        _operation: Operation,
    ) -> Result<bool> {
        let mut conn = self.store.acquire().await?;
        let user = queries::get_user_by_id(&mut conn, LockingStrength::Share, user_id)
            .await
            .map_err(|e| Error::PermissionValidation(e.to_string()))?;

        if user.account_id != account_id {
            return Err(Error::PermissionValidation(format!(
                "user {user_id} does not belong to account {account_id}"
            )));
        }
        if user.is_blocked() {
            return Err(Error::PermissionValidation(format!(
                "user {user_id} is blocked"
            )));
        }

        Ok(user.is_admin_or_owner())
    }
}
