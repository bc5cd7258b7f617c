//! Configuration errors detected before any mutating call.

use thiserror::Error;

/// A desired-state problem that no amount of retrying will fix.
///
/// Reconciliation of the affected scale set stops for the tick and resumes
/// only once the declared state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Extensions whose `depends_on` edges form a cycle, in cycle order.
    #[error("cyclic extension dependency: {}", .members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    /// An extension lists a dependency that is not declared on the scale set.
    #[error("extension '{extension}' depends on unknown extension '{missing}'")]
    UnknownDependency { extension: String, missing: String },

    #[error("extension '{0}' is declared more than once")]
    DuplicateExtension(String),

    /// A rolling policy percentage outside its accepted range.
    #[error("`{field}` must be between {min} and 100 (got {value})")]
    InvalidPolicyPercent {
        field: &'static str,
        value: u32,
        min: u32,
    },

    #[error("invalid upgrade policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl ConfigError {
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::InvalidPolicy(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    pub fn duration(msg: impl Into<String>) -> Self {
        Self::InvalidDuration(msg.into())
    }

    pub fn name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_members_in_order() {
        let err = ConfigError::CyclicDependency {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic extension dependency: a -> b -> a");
    }

    #[test]
    fn percent_message_names_field() {
        let err = ConfigError::InvalidPolicyPercent {
            field: "max_batch_instance_percent",
            value: 0,
            min: 1,
        };
        assert!(err.to_string().contains("max_batch_instance_percent"));
        assert!(err.to_string().contains("got 0"));
    }
}
