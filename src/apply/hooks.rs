//! Contracts of the collaborators the applier drives.
//!
//! Storage, lookup, triggers and constraints belong to the host database;
//! the applier only decides when each of them runs. [`crate::memory`]
//! provides in-process implementations.

use chrono::{DateTime, Utc};

use super::relation::{IndexId, Relation, RelationId};
use super::row::{CommandId, Datum, LocalRow, OriginId, RowId, RowImage, TransactionId, WriteStamp};
use crate::conflict::{ConflictReporter, ConflictResolver};
use crate::Result;

/// Result of a before-row trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Proceed,
    /// Skip the operation without raising an error.
    Suppress,
}

/// Outcome of a physical update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    /// Index entries must be inserted for the new row version.
    pub update_indexes: bool,
}

/// Handle held across one multi-insert episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInsertState {
    pub relation: RelationId,
    /// Rows written through this handle so far.
    pub rows_written: u64,
    /// Bulk writes issued through this handle so far.
    pub batches: u64,
}

impl BulkInsertState {
    pub fn new(relation: RelationId) -> Self {
        Self {
            relation,
            rows_written: 0,
            batches: 0,
        }
    }
}

pub trait TableStorage {
    /// Prepares the relation's indexes for maintenance and returns how many
    /// there are.
    fn open_indexes(&mut self, relation: &Relation) -> Result<usize>;

    fn close_indexes(&mut self, relation: &Relation);

    /// Places a row without touching indexes.
    fn insert(&mut self, relation: &Relation, row: &RowImage, stamp: WriteStamp) -> Result<RowId>;

    /// Replaces the row version at `id`; the old version's index entries are
    /// gone afterwards.
    fn update(
        &mut self,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        stamp: WriteStamp,
    ) -> Result<UpdateResult>;

    fn delete(&mut self, relation: &Relation, id: RowId) -> Result<()>;

    fn begin_bulk_insert(&mut self, relation: &Relation) -> Result<BulkInsertState>;

    fn end_bulk_insert(&mut self, state: BulkInsertState);

    /// Places all rows in one storage operation and returns their ids in
    /// input order.
    fn multi_insert(
        &mut self,
        relation: &Relation,
        rows: &[RowImage],
        stamp: WriteStamp,
        bulk: &mut BulkInsertState,
    ) -> Result<Vec<RowId>>;

    /// Adds index entries for a placed row. Returns the indexes whose
    /// uniqueness could not be checked immediately.
    fn insert_index_entries(
        &mut self,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        update: bool,
    ) -> Result<Vec<IndexId>>;

    /// Finds the live row whose key in `index` equals `key`.
    fn index_probe(
        &self,
        relation: &Relation,
        index: IndexId,
        key: &[&Datum],
    ) -> Result<Option<LocalRow>>;
}

/// Result of a replica identity lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaMatch {
    pub index: IndexId,
    pub row: Option<LocalRow>,
}

pub trait RowLookup {
    /// Finds a local row colliding with `row` on any unique index, preferring
    /// the replica identity index.
    fn find_conflict(
        &self,
        storage: &dyn TableStorage,
        relation: &Relation,
        row: &RowImage,
    ) -> Result<Option<(LocalRow, IndexId)>>;

    /// Locates the row identified by an old-key image.
    fn find_replica_identity(
        &self,
        storage: &dyn TableStorage,
        relation: &Relation,
        key: &RowImage,
    ) -> Result<ReplicaMatch>;
}

/// Carries the identity of the row a before-row update or delete trigger
/// runs against, so it can re-read the latest version if needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecheckState {
    target: Option<RowId>,
}

impl RecheckState {
    pub fn set_target(&mut self, id: RowId) {
        self.target = Some(id);
    }

    pub fn target(&self) -> Option<RowId> {
        self.target
    }

    pub fn clear(&mut self) {
        self.target = None;
    }
}

pub trait TriggerExecutor {
    /// Opens a scope collecting after-row events.
    fn begin_query(&mut self, relation: &Relation);

    /// Closes the scope, firing anything still queued.
    fn end_query(&mut self, relation: &Relation) -> Result<()>;

    fn before_insert(&mut self, relation: &Relation, row: &mut RowImage) -> Result<TriggerAction>;

    fn before_update(
        &mut self,
        relation: &Relation,
        recheck: &mut RecheckState,
        old: &LocalRow,
        new: &mut RowImage,
    ) -> Result<TriggerAction>;

    fn before_delete(
        &mut self,
        relation: &Relation,
        recheck: &mut RecheckState,
        old: &LocalRow,
    ) -> Result<TriggerAction>;

    fn after_insert(
        &mut self,
        storage: &dyn TableStorage,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        recheck_indexes: &[IndexId],
    ) -> Result<()>;

    fn after_update(
        &mut self,
        storage: &dyn TableStorage,
        relation: &Relation,
        old: &LocalRow,
        new: &RowImage,
        recheck_indexes: &[IndexId],
    ) -> Result<()>;

    fn after_delete(
        &mut self,
        storage: &dyn TableStorage,
        relation: &Relation,
        old: &LocalRow,
    ) -> Result<()>;
}

pub trait ConstraintChecker {
    fn check(&self, relation: &Relation, row: &RowImage) -> Result<()>;
}

/// State of the local transaction the remote changes are applied in.
pub trait TransactionContext {
    fn top_xid(&self) -> TransactionId;

    /// Origin of the stream currently being applied.
    fn session_origin(&self) -> OriginId;

    /// Commit time of the remote transaction being applied.
    fn remote_commit_ts(&self) -> Option<DateTime<Utc>>;

    fn current_command_id(&self) -> CommandId;

    /// Makes everything written so far visible to later lookups.
    fn command_counter_increment(&mut self);

    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64>;

    fn transaction_timestamp(&self) -> DateTime<Utc>;

    fn write_stamp(&self) -> WriteStamp {
        WriteStamp {
            xid: self.top_xid(),
            origin: self.session_origin(),
            commit_ts: self.remote_commit_ts(),
            command_id: self.current_command_id(),
        }
    }
}

/// Borrowed collaborators for one apply call.
pub struct ApplyHooks<'a> {
    pub storage: &'a mut dyn TableStorage,
    pub lookup: &'a dyn RowLookup,
    pub triggers: &'a mut dyn TriggerExecutor,
    pub constraints: &'a dyn ConstraintChecker,
    pub resolver: &'a dyn ConflictResolver,
    pub reporter: &'a mut dyn ConflictReporter,
    pub txn: &'a mut dyn TransactionContext,
}
