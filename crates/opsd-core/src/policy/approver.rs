//! Separation-of-powers approver rules.
//!
//! The gate-to-approver mapping is fixed: `Security` is approved by the
//! security group; `RevOps`, `Claims`, and `Product` are founder calls.
//! `main` may approve any gate. Independently of group authority, an
//! approver may never be the task's executor - `main` included.

use crate::group::MAIN;
use crate::task::Gate;

/// Reason an approval was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproverDenial {
    /// The actor's group does not approve this gate.
    WrongGroup,
    /// The gate is `None`; there is nothing to approve.
    NoGate,
    /// The approver is the task's executor.
    ApproverIsExecutor,
}

impl ApproverDenial {
    /// Returns the wire code for this denial.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WrongGroup | Self::NoGate => "FORBIDDEN",
            Self::ApproverIsExecutor => "FORBIDDEN_executor",
        }
    }
}

/// Returns the group entitled to approve `gate`, or `None` for `Gate::None`.
#[must_use]
pub const fn required_approver(gate: Gate) -> Option<&'static str> {
    match gate {
        Gate::None => None,
        Gate::Security => Some("security"),
        Gate::RevOps | Gate::Claims | Gate::Product => Some(MAIN),
    }
}

/// Checks whether `actor_group` may approve `gate`.
///
/// Returns `None` when allowed, or the denial otherwise.
#[must_use]
pub fn check_approver(gate: Gate, actor_group: &str, is_main: bool) -> Option<ApproverDenial> {
    if is_main {
        return None;
    }
    match required_approver(gate) {
        None => Some(ApproverDenial::NoGate),
        Some(required) if required == actor_group => None,
        Some(_) => Some(ApproverDenial::WrongGroup),
    }
}

/// Checks the separation-of-powers rule: the approver must not be the
/// task's executor.
///
/// Returns `None` when allowed, or the denial otherwise.
#[must_use]
pub fn check_approver_not_executor(
    actor_group: &str,
    executor: Option<&str>,
) -> Option<ApproverDenial> {
    match executor {
        Some(exec) if exec == actor_group => Some(ApproverDenial::ApproverIsExecutor),
        _ => None,
    }
}
