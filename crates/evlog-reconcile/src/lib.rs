//! Reconciliation Workflow (C7): diffs the realm's authoritative role
//! membership against the platform's observed membership and applies the
//! minimal set of role grants/revocations to close the gap.
//!
//! The diff itself is pure set arithmetic over `BTreeSet<String>` so two
//! runs over the same inputs always produce the same ordered op list (P5).
//! Applying those ops against the platform is the only part that does I/O,
//! and each op is retried and reported independently — one failing op never
//! hides the outcome of the others (§4.7 step 5).

use std::fmt;

use async_trait::async_trait;
use evlog_schemas::reconcile::{AuthoritativeMembership, ObservedMembership};

/// One role-membership change to apply against the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOp {
    AddRole { platform_id: String, role_id: String },
    RemoveRole { platform_id: String, role_id: String },
}

/// The trait boundary onto `UserIdentity`: lets the diff step ask whether a
/// platform id observed in a role still corresponds to a known identity,
/// without depending on however identities are actually stored.
pub trait IdentityMapping: Send + Sync {
    fn is_mapped(&self, platform_id: &str) -> bool;
}

/// Computes the minimal add/remove set taking `observed` to `authoritative`.
///
/// Per the resolved Open Question on missing mappings: an observed member
/// with no corresponding identity mapping is never targeted for
/// `RemoveRole` — we cannot be sure de-authorizing them is safe, so the
/// diff skips it and lets the next reconciliation pass reconsider.
pub fn diff(
    authoritative: &AuthoritativeMembership,
    observed: &ObservedMembership,
    mapping: &dyn IdentityMapping,
) -> Vec<ApplyOp> {
    let mut ops = Vec::new();

    for platform_id in authoritative
        .member_platform_ids
        .difference(&observed.member_platform_ids)
    {
        ops.push(ApplyOp::AddRole {
            platform_id: platform_id.clone(),
            role_id: observed.platform_role_id.clone(),
        });
    }

    for platform_id in observed
        .member_platform_ids
        .difference(&authoritative.member_platform_ids)
    {
        if mapping.is_mapped(platform_id) {
            ops.push(ApplyOp::RemoveRole {
                platform_id: platform_id.clone(),
                role_id: observed.platform_role_id.clone(),
            });
        } else {
            tracing::warn!(platform_id = %platform_id, "skipping remove_role for unmapped identity");
        }
    }

    ops
}

#[derive(Debug)]
pub struct ApplyError(pub String);

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role apply failed: {}", self.0)
    }
}

impl std::error::Error for ApplyError {}

/// The platform-side mutation surface `apply_ops` drives. A real
/// implementation calls out to the platform's role-management API; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait RoleApplier: Send + Sync {
    async fn add_role(&self, platform_id: &str, role_id: &str) -> Result<(), ApplyError>;
    async fn remove_role(&self, platform_id: &str, role_id: &str) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyOp),
    Failed { op: ApplyOp, error: String },
}

/// Applies every op independently with bounded retry. A failing op never
/// aborts the batch or gets folded into a single aggregate error — the
/// caller gets a per-op verdict and decides what to do with failures.
pub async fn apply_ops(applier: &dyn RoleApplier, ops: Vec<ApplyOp>, max_attempts: u32) -> Vec<ApplyOutcome> {
    let mut outcomes = Vec::with_capacity(ops.len());

    for op in ops {
        let mut last_err: Option<ApplyError> = None;
        let mut applied = false;

        for attempt in 0..max_attempts {
            let result = match &op {
                ApplyOp::AddRole { platform_id, role_id } => applier.add_role(platform_id, role_id).await,
                ApplyOp::RemoveRole { platform_id, role_id } => applier.remove_role(platform_id, role_id).await,
            };

            match result {
                Ok(()) => {
                    applied = true;
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempt))).await;
                    }
                }
            }
        }

        if applied {
            outcomes.push(ApplyOutcome::Applied(op));
        } else {
            outcomes.push(ApplyOutcome::Failed {
                op,
                error: last_err.map(|e| e.0).unwrap_or_default(),
            });
        }
    }

    outcomes
}
