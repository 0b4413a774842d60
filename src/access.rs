//! Role checks for callers of the administrative surface.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UserId;

/// Resolved role of the calling user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Platform operator.
    SuperAdmin,
    /// Runs one or more competitions.
    CompetitionDirector,
    /// Runs a studio; no administrative capacity access.
    StudioDirector,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SuperAdmin => "super_admin",
            Self::CompetitionDirector => "competition_director",
            Self::StudioDirector => "studio_director",
        })
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id recorded as `created_by` on ledger entries.
    pub user_id: UserId,
    /// Resolved role.
    pub role: Role,
}

impl Actor {
    /// Builds an actor.
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// Gated capacity operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read the live counter.
    GetAvailable,
    /// Read the audit trail.
    GetLedger,
    /// Run drift detection.
    Reconcile,
    /// Apply a manual pool adjustment.
    Adjust,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GetAvailable => "get_available",
            Self::GetLedger => "get_ledger",
            Self::Reconcile => "reconcile",
            Self::Adjust => "adjust",
        })
    }
}

/// Role check failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The role may not perform the operation.
    #[error("{role} may not {operation}")]
    Forbidden {
        /// Attempted operation.
        operation: Operation,
        /// Caller role.
        role: Role,
    },
}

/// Roles allowed to perform `operation`.
pub fn allowed_roles(operation: Operation) -> &'static [Role] {
    match operation {
        Operation::GetLedger | Operation::Reconcile => &[Role::SuperAdmin],
        Operation::GetAvailable | Operation::Adjust => {
            &[Role::SuperAdmin, Role::CompetitionDirector]
        }
    }
}

/// Fails unless `actor` may perform `operation`.
pub fn authorize(actor: &Actor, operation: Operation) -> Result<(), AccessError> {
    if allowed_roles(operation).contains(&actor.role) {
        Ok(())
    } else {
        Err(AccessError::Forbidden {
            operation,
            role: actor.role,
        })
    }
}
