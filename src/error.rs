//! Errors surfaced to the person editing rules
//!
//! Everything else (SQLite, file I/O, JSON) travels as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please enter a group name")]
    GroupNameRequired,

    #[error("Group with this name already exists: {0}")]
    DuplicateGroupName(String),

    #[error("Please select a group")]
    GroupNotSelected,

    #[error("Selected group not found")]
    GroupNotFound,

    #[error("Please enter text to match in the URL")]
    PatternRequired,

    #[error("Please enter the redirect URL")]
    RedirectRequired,
}
