//! Error types and result handling for pg-apply.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Conflicts and trigger vetoes are not errors: they surface as
//! [`ApplyOutcome`](crate::apply::ApplyOutcome) variants. Everything that
//! reaches this enum aborts the apply transaction it occurred in.
//!
//! # Example
//!
//! ```rust
//! use pg_apply::{Error, ErrorClass, Result};
//!
//! fn apply_row() -> Result<()> {
//!     Err(Error::DeferrableIndex {
//!         relation: "public.accounts".to_string(),
//!         indexes: "accounts_email_key".to_string(),
//!     })
//! }
//!
//! match apply_row() {
//!     Ok(()) => println!("Applied"),
//!     Err(e) if e.class() == ErrorClass::Configuration => eprintln!("Fix the schema: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

use crate::conflict::ConflictKind;

/// The main error type for pg-apply operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error, typically from reading a replay stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error when decoding stream messages or encoding reports.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The target relation has deferrable unique indexes, which cannot be
    /// checked row by row during apply.
    #[error("deferrable indexes are not supported: relation {relation} has deferrable indexes: {indexes}")]
    DeferrableIndex {
        /// Quoted `schema.table` of the target relation
        relation: String,
        /// Comma separated, quoted index names
        indexes: String,
    },

    /// Update or delete arrived for a relation with no usable key index.
    #[error("relation {relation} has no replica identity index")]
    MissingReplicaIdentity {
        /// Quoted `schema.table` of the target relation
        relation: String,
    },

    /// A NOT NULL column received a null value.
    #[error("null value in column {column} of relation {relation} violates not-null constraint")]
    NotNullViolation {
        /// Quoted `schema.table` of the target relation
        relation: String,
        /// Quoted column name
        column: String,
    },

    /// Index maintenance hit an existing entry in a unique index.
    #[error("duplicate key value violates unique constraint {index} on relation {relation}: key ({key})")]
    UniqueViolation {
        /// Quoted `schema.table` of the target relation
        relation: String,
        /// Quoted index name
        index: String,
        /// Rendered key values
        key: String,
    },

    /// Generic table constraint failure raised by a constraint checker.
    #[error("new row for relation {relation} violates constraint {constraint}: {detail}")]
    ConstraintViolation {
        /// Quoted `schema.table` of the target relation
        relation: String,
        /// Constraint name
        constraint: String,
        /// Human readable detail
        detail: String,
    },

    /// The configured resolver refuses to resolve conflicts.
    #[error("unresolvable {kind} conflict on relation {relation}")]
    UnresolvableConflict {
        /// Conflict that could not be resolved
        kind: ConflictKind,
        /// Quoted `schema.table` of the target relation
        relation: String,
    },

    /// A trigger raised an error.
    #[error("trigger failed on relation {relation}: {message}")]
    Trigger {
        /// Quoted `schema.table` of the target relation
        relation: String,
        /// Error raised by the trigger
        message: String,
    },

    /// Storage layer failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },

    /// A change referenced a relation that was never announced.
    #[error("unknown relation: {name}")]
    UnknownRelation {
        /// Relation id or name as received
        name: String,
    },

    /// A row image does not fit the relation it targets.
    #[error("Invalid row image: {message}")]
    InvalidRow {
        /// Description of what was invalid
        message: String,
    },

    /// Invalid or malformed replication stream message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },
}

/// Coarse classification of an [`Error`], following how the outer worker
/// should react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unsupported schema or bad configuration; retrying cannot help.
    Configuration,
    /// A row violates a table constraint.
    Constraint,
    /// A conflict the resolver refused to handle.
    Conflict,
    /// Storage, trigger or I/O failure.
    Resource,
    /// Malformed input from the replication stream.
    Input,
}

impl Error {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_)
            | Error::DeferrableIndex { .. }
            | Error::MissingReplicaIdentity { .. } => {
                ErrorClass::Configuration
            }
            Error::NotNullViolation { .. }
            | Error::UniqueViolation { .. }
            | Error::ConstraintViolation { .. } => ErrorClass::Constraint,
            Error::UnresolvableConflict { .. } => ErrorClass::Conflict,
            Error::Io(_) | Error::Trigger { .. } | Error::Storage { .. } => ErrorClass::Resource,
            Error::Serialization(_)
            | Error::UnknownRelation { .. }
            | Error::InvalidRow { .. }
            | Error::InvalidMessage { .. } => ErrorClass::Input,
        }
    }
}

/// A convenient Result type alias for pg-apply operations.
///
/// This is equivalent to `std::result::Result<T, pg_apply::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
