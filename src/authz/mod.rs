//! Authorization module
//!
//! Permission gate applied after a token has been verified. A route declares
//! the permissions it needs at startup; a request is allowed when its
//! validated `permissions` claim covers all of them.

use crate::auth::{AuthError, ValidatedClaims};
use serde::Serialize;
use std::collections::BTreeSet;

/// Permissions a route requires; fixed for the life of the process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRequirement {
    required: BTreeSet<String>,
}

impl PermissionRequirement {
    pub fn new<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: permissions.into_iter().map(Into::into).collect(),
        }
    }

    /// Requirement satisfied by any verified token
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { missing: Vec<String> },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert a denial into `AuthError::InsufficientPermission`
    pub fn into_result(self) -> Result<(), AuthError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny { missing } => Err(AuthError::InsufficientPermission(missing)),
        }
    }
}

/// Check the claim set's permissions against a requirement.
///
/// Pure: no I/O, no side effects. Missing permissions are reported in
/// sorted order.
pub fn authorize(claims: &ValidatedClaims, required: &PermissionRequirement) -> Decision {
    let missing: Vec<String> = required
        .required
        .difference(claims.permissions())
        .cloned()
        .collect();

    if missing.is_empty() {
        Decision::Allow
    } else {
        Decision::Deny { missing }
    }
}
