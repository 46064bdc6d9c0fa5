//! Conflict kinds, resolution outcomes, and the resolver/reporter seams.

pub mod reporter;
pub mod resolver;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::apply::relation::{IndexId, Relation};
use crate::apply::row::{LocalRow, OriginId, RowImage, RowOrigin, TransactionId};
use crate::Result;

pub use reporter::ConflictLogger;
pub use resolver::PolicyResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Remote insert hit an existing key.
    InsertInsert,
    /// Remote update hit a row last written by another node.
    UpdateUpdate,
    /// Remote update found no row to update.
    UpdateDelete,
    /// Remote delete found no row to delete.
    DeleteDelete,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::InsertInsert => "insert_exists",
            ConflictKind::UpdateUpdate => "update_update",
            ConflictKind::UpdateDelete => "update_delete",
            ConflictKind::DeleteDelete => "delete_delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ApplyRemote,
    KeepLocal,
    Merged,
    Skip,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::ApplyRemote => "apply_remote",
            Resolution::KeepLocal => "keep_local",
            Resolution::Merged => "merged",
            Resolution::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// Decision for a conflict against an existing local row.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// Apply the remote row (possibly rewritten by triggers).
    ApplyRemote(RowImage),
    /// Apply a row synthesized from both sides.
    Merged(RowImage),
    KeepLocal,
}

impl ConflictOutcome {
    pub fn resolution(&self) -> Resolution {
        match self {
            ConflictOutcome::ApplyRemote(_) => Resolution::ApplyRemote,
            ConflictOutcome::Merged(_) => Resolution::Merged,
            ConflictOutcome::KeepLocal => Resolution::KeepLocal,
        }
    }

    /// The row to write, `None` when the local row wins.
    pub fn winner(&self) -> Option<&RowImage> {
        match self {
            ConflictOutcome::ApplyRemote(row) | ConflictOutcome::Merged(row) => Some(row),
            ConflictOutcome::KeepLocal => None,
        }
    }
}

/// Everything a resolver sees about a row-present conflict.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    pub kind: ConflictKind,
    pub relation: &'a Relation,
    pub local: &'a LocalRow,
    pub remote: &'a RowImage,
    pub remote_origin: OriginId,
    pub remote_commit_ts: Option<DateTime<Utc>>,
}

pub trait ConflictResolver {
    /// Picks a winner between a local row and the incoming remote row.
    fn resolve(&self, conflict: &Conflict<'_>) -> Result<ConflictOutcome>;

    /// Called when an update or delete finds no local row. Returning `Ok`
    /// skips the change; an error aborts the transaction.
    fn on_missing_row(&self, _kind: ConflictKind, _relation: &Relation) -> Result<()> {
        Ok(())
    }
}

/// Full record of one detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictReport {
    pub kind: ConflictKind,
    pub relation: String,
    pub local: Option<RowImage>,
    pub local_xid: Option<TransactionId>,
    pub local_origin: Option<RowOrigin>,
    pub old_key: Option<RowImage>,
    pub remote: RowImage,
    pub remote_origin: OriginId,
    pub applied: Option<RowImage>,
    pub resolution: Resolution,
    /// Index that matched the local row.
    pub index: Option<String>,
    pub has_before_triggers: bool,
}

pub trait ConflictReporter {
    fn report(&mut self, report: &ConflictReport);
}

/// Resolution policy selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Any row-present conflict aborts the transaction.
    Error,
    ApplyRemote,
    KeepLocal,
    #[default]
    LastUpdateWins,
    FirstUpdateWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

pub(crate) fn index_name(relation: &Relation, index: IndexId) -> Option<String> {
    relation.index(index).map(|i| i.name.clone())
}
