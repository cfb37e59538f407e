//! Actor groups and the group registry.
//!
//! A group is the unit of authorization and approval: tasks are assigned
//! to groups, capabilities are granted to groups, and gates are approved
//! by groups. The registry carries the five built-in groups and may be
//! extended at construction time; unknown group names are rejected at
//! every ingress point rather than deep in a transaction.

use std::collections::BTreeSet;

use thiserror::Error;

/// The founder group. May create, assign, override, and approve any gate.
pub const MAIN: &str = "main";

/// Actor label used for engine-initiated activities (scope coercion).
/// Not a member of the registry - nothing can be assigned to it.
pub const SYSTEM_ACTOR: &str = "system";

/// The five built-in groups.
pub const BUILTIN_GROUPS: [&str; 5] = ["main", "developer", "security", "revops", "product"];

/// Maximum length of a group name accepted at ingress.
pub const MAX_GROUP_LEN: usize = 50;

/// Errors produced by group validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// The group name is not in the registry.
    #[error("unknown group: {name}")]
    Unknown {
        /// The rejected name.
        name: String,
    },

    /// The group name is empty, too long, or not lowercase ASCII.
    #[error("invalid group name: {name:?}")]
    Invalid {
        /// The rejected name.
        name: String,
    },
}

/// Registry of known actor groups.
///
/// Holds the built-in five plus any extras injected from configuration.
#[derive(Debug, Clone)]
pub struct GroupRegistry {
    groups: BTreeSet<String>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self {
            groups: BUILTIN_GROUPS.iter().map(|g| (*g).to_string()).collect(),
        }
    }
}

impl GroupRegistry {
    /// Creates a registry with the built-in groups plus `extra`.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Invalid`] when an extra name is empty, longer
    /// than [`MAX_GROUP_LEN`], or not lowercase ASCII alphanumeric.
    pub fn with_extra<I, S>(extra: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::default();
        for name in extra {
            let name = name.as_ref();
            if !is_well_formed(name) {
                return Err(GroupError::Invalid {
                    name: name.to_string(),
                });
            }
            registry.groups.insert(name.to_string());
        }
        Ok(registry)
    }

    /// Returns true when `name` is a registered group.
    #[must_use]
    pub fn is_known(&self, name: &str) -> bool {
        self.groups.contains(name)
    }

    /// Validates `name` at ingress, distinguishing malformed names from
    /// well-formed-but-unknown ones.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Invalid`] for malformed names and
    /// [`GroupError::Unknown`] for names outside the registry.
    pub fn require(&self, name: &str) -> Result<(), GroupError> {
        if !is_well_formed(name) {
            return Err(GroupError::Invalid {
                name: name.to_string(),
            });
        }
        if !self.groups.contains(name) {
            return Err(GroupError::Unknown {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Iterates the registered group names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

fn is_well_formed(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_GROUP_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}
