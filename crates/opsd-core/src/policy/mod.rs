//! Policy kernel for the governance workflow.
//!
//! The kernel is pure: every function here evaluates
//! `(task, transition, actor)` data to a decision with reason codes and
//! performs no I/O. The governance engine calls it before persisting
//! anything, so a denial leaves the store untouched.
//!
//! # Properties
//!
//! - **Fixed graph**: the workflow edge set is compiled in; there is no
//!   runtime-configurable workflow.
//! - **Deterministic**: the same inputs always produce the same decision.
//! - **Fail-closed**: unknown states and missing edges are denials, never
//!   silent passes.

mod approver;
mod transition;

pub use approver::{check_approver, check_approver_not_executor, required_approver, ApproverDenial};
pub use transition::{
    allowed_targets, validate_transition, PolicyCode, TransitionCheck, TransitionFacts,
};

/// Version string the kernel stamps into `metadata.policy_version` on task
/// creation. Bumped whenever a validator or the graph changes meaning.
pub const POLICY_VERSION: &str = "policy-v3";
