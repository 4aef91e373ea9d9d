//! Tenant identity propagation
//!
//! Every tenant-scoped repository call takes a `TenantContext` by reference.
//! The context is built at the boundary (CLI command, task dispatcher) and
//! passed down explicitly; there is no request-local storage to leak between
//! operations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a core operation runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Tenant every query is scoped to
    pub tenant_id: Uuid,

    /// Acting user, when the operation originates from an API call
    pub user_id: Option<Uuid>,

    /// Role claim carried from the boundary
    pub role: Option<String>,
}

impl TenantContext {
    /// Context for a tenant with no acting user (background work)
    pub fn system(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id: None,
            role: Some("system".to_string()),
        }
    }

    /// Context carrying the acting user from the boundary
    pub fn for_user(tenant_id: Uuid, user_id: Uuid, role: impl Into<String>) -> Self {
        Self {
            tenant_id,
            user_id: Some(user_id),
            role: Some(role.into()),
        }
    }

    /// Label recorded in audit history rows
    pub fn actor(&self) -> String {
        match self.user_id {
            Some(user_id) => user_id.to_string(),
            None => "system".to_string(),
        }
    }

    /// Actor type recorded in audit history rows
    pub fn actor_type(&self) -> &'static str {
        if self.user_id.is_some() {
            "user"
        } else {
            "system"
        }
    }
}
