use tracing::trace;

use super::hooks::{ReplicaMatch, RowLookup, TableStorage};
use super::relation::{IndexDesc, IndexId, Relation};
use super::row::{LocalRow, RowImage};
use crate::{Error, Result};

/// Row lookup through the relation's unique indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexLookup;

impl IndexLookup {
    pub fn new() -> Self {
        Self
    }

    /// Unique indexes that can detect a conflict, replica identity first.
    fn candidate_indexes(relation: &Relation) -> Vec<&IndexDesc> {
        let identity = relation.replica_identity_index().map(|i| i.id);
        let mut candidates: Vec<&IndexDesc> = relation
            .indexes
            .iter()
            .filter(|i| i.unique || i.primary)
            .filter(|i| !i.columns.is_empty())
            .collect();
        candidates.sort_by_key(|i| Some(i.id) != identity);
        candidates
    }

    fn probe(
        storage: &dyn TableStorage,
        relation: &Relation,
        index: &IndexDesc,
        row: &RowImage,
    ) -> Result<Option<LocalRow>> {
        // a key containing nulls never matches anything
        let Some(key) = row.key(&index.columns) else {
            return Ok(None);
        };
        storage.index_probe(relation, index.id, &key)
    }
}

impl RowLookup for IndexLookup {
    fn find_conflict(
        &self,
        storage: &dyn TableStorage,
        relation: &Relation,
        row: &RowImage,
    ) -> Result<Option<(LocalRow, IndexId)>> {
        for index in Self::candidate_indexes(relation) {
            if let Some(local) = Self::probe(storage, relation, index, row)? {
                trace!(index = %index.name, row_id = local.id, "Found conflicting row");
                return Ok(Some((local, index.id)));
            }
        }
        Ok(None)
    }

    fn find_replica_identity(
        &self,
        storage: &dyn TableStorage,
        relation: &Relation,
        key: &RowImage,
    ) -> Result<ReplicaMatch> {
        let index = relation.replica_identity_index().ok_or_else(|| Error::MissingReplicaIdentity {
            relation: relation.qualified_name(),
        })?;

        let row = Self::probe(storage, relation, index, key)?;
        Ok(ReplicaMatch { index: index.id, row })
    }
}
