//! # opsd-core
//!
//! Core library for opsd - the governance control plane of a
//! single-founder, multi-product operations platform.
//!
//! This crate provides the pure building blocks the daemon composes:
//!
//! - **Domain model**: tasks, products, activities, approvals,
//!   notifications, and the capability records that govern external access
//! - **Policy kernel**: the fixed workflow graph, strict-mode validators,
//!   and the separation-of-powers approver rules
//! - **Event bus**: typed in-process fan-out with secret scrubbing applied
//!   before any subscriber sees a payload
//! - **Alert rules**: worker-offline grace, dispatch-failure threshold,
//!   and breaker-open alerting with per-subject deduplication
//!
//! Everything here is synchronous and I/O-free except the event bus, which
//! wraps a broadcast channel. Persistence, HTTP, and the external-access
//! broker live in `opsd-daemon`.
//!
//! ## Example
//!
//! ```rust
//! use opsd_core::policy::{validate_transition, TransitionFacts};
//! use opsd_core::task::TaskState;
//!
//! let check = validate_transition(
//!     TaskState::Inbox,
//!     TaskState::Triaged,
//!     &TransitionFacts::default(),
//!     false,
//! );
//! assert!(check.ok);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alerts;
pub mod canonical;
pub mod capability;
pub mod digest;
pub mod events;
pub mod group;
pub mod id;
pub mod policy;
pub mod product;
pub mod record;
pub mod scrub;
pub mod task;

pub use group::GroupRegistry;
pub use task::{Task, TaskMetadata, TaskState};
