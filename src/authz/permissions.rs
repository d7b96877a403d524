//! Role → operation permission table
//!
//! This is the minimum contract from the access policy; extensions may add
//! operations but must never weaken an existing grant.

use crate::model::{Operation, Role};

/// Operations available through a standing guest grant
///
/// Guests never get settings or administrative operations, only status
/// reads and lock toggles.
pub const GUEST_GRANT_OPERATIONS: [Operation; 3] =
    [Operation::ReadStatus, Operation::Lock, Operation::Unlock];

/// Whether a role grants an operation on a device inside its scope
///
/// Scope matching (which devices a role association reaches) is the
/// engine's job; this table only answers "once matched, what may the role
/// do".
#[must_use]
pub const fn permits(role: Role, operation: Operation) -> bool {
    match role {
        // Full control over everything in scope
        Role::Owner | Role::PortfolioAdmin | Role::PropertyManager => true,
        // Residents operate their locks but never administer them
        Role::Tenant | Role::Guest => matches!(
            operation,
            Operation::ReadStatus | Operation::Lock | Operation::Unlock
        ),
    }
}

/// Whether an operation is reachable through a guest grant at all
#[must_use]
pub fn guest_grant_permits(operation: Operation) -> bool {
    GUEST_GRANT_OPERATIONS.contains(&operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_OPERATIONS: [Operation; 7] = [
        Operation::ReadStatus,
        Operation::Lock,
        Operation::Unlock,
        Operation::ChangeSettings,
        Operation::ManageAccess,
        Operation::Rename,
        Operation::Remove,
    ];

    #[test]
    fn managers_and_above_get_everything() {
        for role in [Role::Owner, Role::PortfolioAdmin, Role::PropertyManager] {
            for op in ALL_OPERATIONS {
                assert!(permits(role, op), "{role:?} should permit {op}");
            }
        }
    }

    #[test]
    fn tenant_gets_status_and_toggles_only() {
        assert!(permits(Role::Tenant, Operation::ReadStatus));
        assert!(permits(Role::Tenant, Operation::Lock));
        assert!(permits(Role::Tenant, Operation::Unlock));
        assert!(!permits(Role::Tenant, Operation::ChangeSettings));
        assert!(!permits(Role::Tenant, Operation::ManageAccess));
        assert!(!permits(Role::Tenant, Operation::Rename));
        assert!(!permits(Role::Tenant, Operation::Remove));
    }

    #[test]
    fn guest_role_matches_tenant_surface() {
        for op in ALL_OPERATIONS {
            assert_eq!(permits(Role::Guest, op), permits(Role::Tenant, op));
        }
    }

    #[test]
    fn guest_grants_never_reach_settings() {
        assert!(guest_grant_permits(Operation::Lock));
        assert!(guest_grant_permits(Operation::Unlock));
        assert!(guest_grant_permits(Operation::ReadStatus));
        assert!(!guest_grant_permits(Operation::ChangeSettings));
        assert!(!guest_grant_permits(Operation::ManageAccess));
        assert!(!guest_grant_permits(Operation::Remove));
    }
}
