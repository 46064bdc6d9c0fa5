use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

use crate::apply::hooks::{BulkInsertState, TableStorage, UpdateResult};
use crate::apply::relation::{quote_identifier, IndexId, Relation, RelationId};
use crate::apply::row::{
    CommandId, Datum, LocalRow, OriginId, RowId, RowImage, RowOrigin, TransactionId, WriteStamp,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredRow {
    image: RowImage,
    xmin: TransactionId,
    origin: OriginId,
    commit_ts: Option<DateTime<Utc>>,
    cmin: CommandId,
}

type IndexKey = Vec<String>;

#[derive(Debug, Clone, Default)]
struct MemTable {
    rows: BTreeMap<RowId, StoredRow>,
    indexes: HashMap<IndexId, HashMap<IndexKey, Vec<RowId>>>,
}

impl MemTable {
    fn remove_index_entries(&mut self, id: RowId) {
        for entries in self.indexes.values_mut() {
            entries.retain(|_, ids| {
                ids.retain(|other| *other != id);
                !ids.is_empty()
            });
        }
    }
}

/// Counters exposed for tests and the replay summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub multi_insert_batches: u64,
    pub multi_inserted_rows: u64,
    pub bulk_states_opened: u64,
    pub bulk_states_closed: u64,
}

/// Heap-like in-memory tables with unique and deferrable indexes.
///
/// Rows are placed by [`TableStorage::insert`] and become reachable through
/// indexes only after [`TableStorage::insert_index_entries`].
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    tables: HashMap<RelationId, MemTable>,
    next_row_id: RowId,
    track_commit_timestamp: bool,
    open: HashSet<RelationId>,
    saved: Option<(HashMap<RelationId, MemTable>, RowId)>,
    stats: StorageStats,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            next_row_id: 1,
            track_commit_timestamp: true,
            open: HashSet::new(),
            saved: None,
            stats: StorageStats::default(),
        }
    }

    /// Without commit timestamp tracking, rows report no origin and can never
    /// be detected as concurrently updated.
    pub fn with_commit_timestamps(mut self, track: bool) -> Self {
        self.track_commit_timestamp = track;
        self
    }

    pub fn stats(&self) -> StorageStats {
        self.stats
    }

    /// Saves the current contents so a failed transaction can be undone.
    pub fn begin(&mut self) {
        self.saved = Some((self.tables.clone(), self.next_row_id));
    }

    pub fn commit(&mut self) {
        self.saved = None;
    }

    pub fn rollback(&mut self) {
        if let Some((tables, next_row_id)) = self.saved.take() {
            self.tables = tables;
            self.next_row_id = next_row_id;
        }
        self.open.clear();
    }

    /// Live rows of a relation in placement order.
    pub fn rows(&self, relation: RelationId) -> Vec<LocalRow> {
        self.tables
            .get(&relation)
            .map(|table| table.rows.iter().map(|(id, row)| self.local_row(*id, row)).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, relation: RelationId) -> usize {
        self.tables.get(&relation).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Command id the row was last written under.
    pub fn row_command_id(&self, relation: RelationId, id: RowId) -> Option<CommandId> {
        self.tables.get(&relation)?.rows.get(&id).map(|row| row.cmin)
    }

    /// Writes a row as a local session would, indexes included. Used to set
    /// up local state that remote changes then collide with.
    pub fn seed(
        &mut self,
        relation: &Relation,
        row: &RowImage,
        stamp: WriteStamp,
    ) -> Result<RowId> {
        let was_open = self.open.contains(&relation.id);
        self.open_indexes(relation)?;
        let id = self.insert(relation, row, stamp)?;
        let result = self.insert_index_entries(relation, id, row, false);
        if !was_open {
            self.close_indexes(relation);
        }
        result.map(|_| id)
    }

    fn local_row(&self, id: RowId, row: &StoredRow) -> LocalRow {
        LocalRow {
            id,
            image: row.image.clone(),
            xmin: row.xmin,
            origin: self.track_commit_timestamp.then_some(RowOrigin {
                origin: row.origin,
                commit_ts: row.commit_ts,
            }),
        }
    }

    fn place(&mut self, relation: RelationId, row: &RowImage, stamp: WriteStamp) -> RowId {
        let id = self.next_row_id;
        self.next_row_id += 1;

        let mut image = row.clone();
        image.changed = vec![false; image.width()];

        self.tables.entry(relation).or_default().rows.insert(
            id,
            StoredRow {
                image,
                xmin: stamp.xid,
                origin: stamp.origin,
                commit_ts: stamp.commit_ts,
                cmin: stamp.command_id,
            },
        );
        id
    }

    fn table_mut(&mut self, relation: &Relation) -> Result<&mut MemTable> {
        self.tables.get_mut(&relation.id).ok_or_else(|| Error::Storage {
            message: format!("relation {} has no storage", relation.qualified_name()),
        })
    }
}

fn index_key(values: &[&Datum]) -> IndexKey {
    values.iter().map(|v| v.to_string()).collect()
}

impl TableStorage for MemoryStorage {
    fn open_indexes(&mut self, relation: &Relation) -> Result<usize> {
        self.open.insert(relation.id);
        self.tables.entry(relation.id).or_default();
        Ok(relation.indexes.len())
    }

    fn close_indexes(&mut self, relation: &Relation) {
        self.open.remove(&relation.id);
    }

    fn insert(&mut self, relation: &Relation, row: &RowImage, stamp: WriteStamp) -> Result<RowId> {
        let id = self.place(relation.id, row, stamp);
        self.stats.inserts += 1;
        trace!(relation = %relation.qualified_name(), row_id = id, "Placed row");
        Ok(id)
    }

    fn update(
        &mut self,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        stamp: WriteStamp,
    ) -> Result<UpdateResult> {
        let table = self.table_mut(relation)?;
        let stored = table.rows.get_mut(&id).ok_or_else(|| Error::Storage {
            message: format!("row {} of relation {} does not exist", id, relation.qualified_name()),
        })?;

        stored.image = row.clone();
        stored.image.changed = vec![false; row.width()];
        stored.xmin = stamp.xid;
        stored.origin = stamp.origin;
        stored.commit_ts = stamp.commit_ts;
        stored.cmin = stamp.command_id;

        table.remove_index_entries(id);
        self.stats.updates += 1;

        Ok(UpdateResult {
            update_indexes: !relation.indexes.is_empty(),
        })
    }

    fn delete(&mut self, relation: &Relation, id: RowId) -> Result<()> {
        let table = self.table_mut(relation)?;
        if table.rows.remove(&id).is_none() {
            return Err(Error::Storage {
                message: format!(
                    "row {} of relation {} does not exist",
                    id,
                    relation.qualified_name()
                ),
            });
        }
        table.remove_index_entries(id);
        self.stats.deletes += 1;
        Ok(())
    }

    fn begin_bulk_insert(&mut self, relation: &Relation) -> Result<BulkInsertState> {
        self.stats.bulk_states_opened += 1;
        Ok(BulkInsertState::new(relation.id))
    }

    fn end_bulk_insert(&mut self, state: BulkInsertState) {
        self.stats.bulk_states_closed += 1;
        trace!(
            relation_id = state.relation,
            rows = state.rows_written,
            batches = state.batches,
            "Released bulk insert state"
        );
    }

    fn multi_insert(
        &mut self,
        relation: &Relation,
        rows: &[RowImage],
        stamp: WriteStamp,
        bulk: &mut BulkInsertState,
    ) -> Result<Vec<RowId>> {
        if bulk.relation != relation.id {
            return Err(Error::Storage {
                message: format!(
                    "bulk insert state does not belong to relation {}",
                    relation.qualified_name()
                ),
            });
        }

        let ids: Vec<RowId> = rows.iter().map(|row| self.place(relation.id, row, stamp)).collect();

        bulk.rows_written += ids.len() as u64;
        bulk.batches += 1;
        self.stats.multi_insert_batches += 1;
        self.stats.multi_inserted_rows += ids.len() as u64;
        Ok(ids)
    }

    fn insert_index_entries(
        &mut self,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        _update: bool,
    ) -> Result<Vec<IndexId>> {
        if !self.open.contains(&relation.id) {
            return Err(Error::Storage {
                message: format!("indexes of relation {} are not open", relation.qualified_name()),
            });
        }

        let table = self.table_mut(relation)?;
        let mut recheck = Vec::new();

        for index in &relation.indexes {
            // null keys are never indexed as unique values
            let Some(key) = row.key(&index.columns) else {
                continue;
            };
            let key = index_key(&key);
            let entries = table
                .indexes
                .entry(index.id)
                .or_default()
                .entry(key.clone())
                .or_default();

            if index.unique && index.deferrable {
                // uniqueness is only known at commit
                recheck.push(index.id);
            } else if index.unique && entries.iter().any(|other| *other != id) {
                return Err(Error::UniqueViolation {
                    relation: relation.qualified_name(),
                    index: quote_identifier(&index.name),
                    key: key.join(", "),
                });
            }

            if !entries.contains(&id) {
                entries.push(id);
            }
        }

        Ok(recheck)
    }

    fn index_probe(
        &self,
        relation: &Relation,
        index: IndexId,
        key: &[&Datum],
    ) -> Result<Option<LocalRow>> {
        let Some(table) = self.tables.get(&relation.id) else {
            return Ok(None);
        };

        let found = table
            .indexes
            .get(&index)
            .and_then(|entries| entries.get(&index_key(key)))
            .and_then(|ids| ids.iter().find_map(|id| table.rows.get(id).map(|row| (*id, row))));

        Ok(found.map(|(id, row)| self.local_row(id, row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::relation::{ColumnDesc, IndexDesc};
    use serde_json::json;

    fn relation(deferrable: bool) -> Relation {
        Relation::new(
            1,
            "public",
            "t",
            vec![ColumnDesc::new("id"), ColumnDesc::new("v")],
        )
        .with_index(IndexDesc {
            id: 5,
            name: "t_pkey".to_string(),
            columns: vec![0],
            unique: true,
            primary: true,
            deferrable,
        })
    }

    fn stamp() -> WriteStamp {
        WriteStamp {
            xid: 3,
            origin: 2,
            commit_ts: None,
            command_id: 0,
        }
    }

    #[test]
    fn test_rows_are_not_indexed_until_entries_are_inserted() {
        let rel = relation(false);
        let mut storage = MemoryStorage::new();
        storage.open_indexes(&rel).unwrap();

        let row = RowImage::from_json(&[json!(1), json!("a")]);
        let id = storage.insert(&rel, &row, stamp()).unwrap();
        assert!(storage.index_probe(&rel, 5, &[&json!(1)]).unwrap().is_none());

        storage.insert_index_entries(&rel, id, &row, false).unwrap();
        let found = storage.index_probe(&rel, 5, &[&json!(1)]).unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.xmin, 3);
        assert_eq!(found.origin.map(|o| o.origin), Some(2));
    }

    #[test]
    fn test_unique_violation() {
        let rel = relation(false);
        let mut storage = MemoryStorage::new();
        storage.seed(&rel, &RowImage::from_json(&[json!(1), json!("a")]), stamp()).unwrap();

        let err = storage
            .seed(&rel, &RowImage::from_json(&[json!(1), json!("b")]), stamp())
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { .. }));
    }

    #[test]
    fn test_deferrable_index_requests_recheck() {
        let rel = relation(true);
        let mut storage = MemoryStorage::new();
        storage.open_indexes(&rel).unwrap();

        let row = RowImage::from_json(&[json!(1), json!("a")]);
        let id = storage.insert(&rel, &row, stamp()).unwrap();
        assert_eq!(storage.insert_index_entries(&rel, id, &row, false).unwrap(), vec![5]);
    }

    #[test]
    fn test_index_maintenance_requires_open_indexes() {
        let rel = relation(false);
        let mut storage = MemoryStorage::new();
        let row = RowImage::from_json(&[json!(1), json!("a")]);
        let id = storage.insert(&rel, &row, stamp()).unwrap();

        assert!(storage.insert_index_entries(&rel, id, &row, false).is_err());
    }

    #[test]
    fn test_rollback_restores_contents() {
        let rel = relation(false);
        let mut storage = MemoryStorage::new();
        storage.seed(&rel, &RowImage::from_json(&[json!(1), json!("a")]), stamp()).unwrap();

        storage.begin();
        storage.seed(&rel, &RowImage::from_json(&[json!(2), json!("b")]), stamp()).unwrap();
        assert_eq!(storage.row_count(1), 2);
        storage.rollback();

        assert_eq!(storage.row_count(1), 1);
        assert!(storage.index_probe(&rel, 5, &[&json!(2)]).unwrap().is_none());
    }

    #[test]
    fn test_untracked_commit_timestamps_hide_origin() {
        let rel = relation(false);
        let mut storage = MemoryStorage::new().with_commit_timestamps(false);
        storage.seed(&rel, &RowImage::from_json(&[json!(1), json!("a")]), stamp()).unwrap();

        assert!(storage.rows(1)[0].origin.is_none());
    }
}
