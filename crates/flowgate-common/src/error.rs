//! Error types for the Flowgate core
//!
//! Configuration and command errors are reported synchronously with a
//! structured kind and message. The hot path (batch processing, scheduler
//! iteration) never returns these: malformed packets fall through to the
//! default gate and invariant violations are programming bugs.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad field definitions or other invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A priority value is already taken by a sibling.
    #[error("duplicate priority {priority} under '{parent}'")]
    DuplicatePriority {
        /// Name of the parent class.
        parent: String,
        /// The conflicting priority.
        priority: i32,
    },

    /// A traffic class with this name is already registered.
    #[error("duplicate traffic class name: {0}")]
    DuplicateName(String),

    /// The child already has a parent, or the parent's slot is occupied.
    #[error("already attached: {0}")]
    AlreadyAttached(String),

    /// A bounded table ran out of slots.
    #[error("table full: {0}")]
    TableFull(String),

    /// Delete or lookup on an absent key or class.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type for the Flowgate core.
pub type CoreResult<T> = Result<T, CoreError>;
