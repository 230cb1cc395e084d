//! Membership snapshot types consumed by the linker sync engine's
//! reconciliation workflow (C7). Pure data — no diffing logic lives here;
//! see `evlog-reconcile` for that.

use std::collections::BTreeSet;

/// The authoritative set of platform identities holding a realm role,
/// as resolved from the remote realm query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeMembership {
    pub realm_path: String,
    pub realm_role_name: String,
    pub member_platform_ids: BTreeSet<String>,
}

/// The observed set of platform identities currently bearing the
/// corresponding platform role, as resolved from the platform adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMembership {
    pub platform_scope_id: String,
    pub platform_role_id: String,
    pub member_platform_ids: BTreeSet<String>,
}
