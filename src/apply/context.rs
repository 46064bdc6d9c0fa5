use std::sync::Arc;

use tracing::debug;

use super::defaults::DefaultFiller;
use super::hooks::{ApplyHooks, RecheckState};
use super::relation::{IndexId, Relation};
use super::row::{RowId, RowImage};
use crate::{Error, Result};

/// Reusable slot holding at most one row. Its allocation survives `clear`.
#[derive(Debug, Clone, Default)]
pub struct RowHolder {
    row: RowImage,
    occupied: bool,
}

impl RowHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the content, reusing the existing buffers.
    pub fn store(&mut self, row: &RowImage) {
        self.row.clone_from(row);
        self.occupied = true;
    }

    /// Takes ownership of `row` as the new content.
    pub fn store_owned(&mut self, row: RowImage) {
        self.row = row;
        self.occupied = true;
    }

    pub fn clear(&mut self) {
        self.occupied = false;
    }

    pub fn is_empty(&self) -> bool {
        !self.occupied
    }

    pub fn get(&self) -> Option<&RowImage> {
        self.occupied.then_some(&self.row)
    }

    pub fn get_mut(&mut self) -> Option<&mut RowImage> {
        if self.occupied {
            Some(&mut self.row)
        } else {
            None
        }
    }

    fn row_or_err(&self) -> Result<&RowImage> {
        self.get().ok_or_else(|| Error::InvalidRow {
            message: "row holder is empty".to_string(),
        })
    }
}

/// Scratch environment for applying changes to one relation.
///
/// Opening it starts an after-trigger scope; [`ExecContext::finish`] closes
/// the indexes and ends that scope. Exactly one context per relation is live
/// at a time.
#[derive(Debug)]
pub struct ExecContext {
    relation: Arc<Relation>,
    pub(crate) slot: RowHolder,
    pub(crate) defaults: DefaultFiller,
    /// Only present when the relation has triggers.
    pub(crate) recheck: Option<RecheckState>,
    num_indexes: Option<usize>,
}

impl ExecContext {
    pub fn init(relation: Arc<Relation>, hooks: &mut ApplyHooks<'_>) -> Self {
        debug!(relation = %relation.qualified_name(), "Opening apply context");

        hooks.triggers.begin_query(&relation);

        let recheck = (!relation.triggers.is_empty()).then(RecheckState::default);
        let defaults = DefaultFiller::new(&relation);

        Self {
            relation,
            slot: RowHolder::new(),
            defaults,
            recheck,
            num_indexes: None,
        }
    }

    pub fn relation(&self) -> &Arc<Relation> {
        &self.relation
    }

    pub fn open_indexes(&mut self, hooks: &mut ApplyHooks<'_>) -> Result<usize> {
        if let Some(n) = self.num_indexes {
            return Ok(n);
        }
        let n = hooks.storage.open_indexes(&self.relation)?;
        self.num_indexes = Some(n);
        Ok(n)
    }

    pub fn num_indexes(&self) -> usize {
        self.num_indexes.unwrap_or(0)
    }

    pub(crate) fn slot_row(&self) -> Result<&RowImage> {
        self.slot.row_or_err()
    }

    pub(crate) fn recheck_for(&mut self, target: RowId) -> &mut RecheckState {
        let recheck = self.recheck.get_or_insert_with(RecheckState::default);
        recheck.set_target(target);
        recheck
    }

    /// Inserts index entries for a placed row and rejects indexes that need a
    /// deferred uniqueness recheck.
    pub fn update_open_indexes(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        id: RowId,
        row: &RowImage,
        update: bool,
    ) -> Result<Vec<IndexId>> {
        if self.num_indexes() == 0 {
            return Ok(Vec::new());
        }

        let recheck = hooks.storage.insert_index_entries(&self.relation, id, row, update)?;
        if recheck.is_empty() {
            return Ok(recheck);
        }

        let mut names = Vec::with_capacity(recheck.len());
        for index_id in &recheck {
            let index = self.relation.index(*index_id).ok_or_else(|| Error::Storage {
                message: format!("cache lookup failed for index {}", index_id),
            })?;
            names.push(super::relation::quote_identifier(&index.name));
        }

        Err(Error::DeferrableIndex {
            relation: self.relation.qualified_name(),
            indexes: names.join(", "),
        })
    }

    /// Closes indexes and fires queued after triggers.
    pub fn finish(self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        if self.num_indexes.is_some() {
            hooks.storage.close_indexes(&self.relation);
        }
        debug!(relation = %self.relation.qualified_name(), "Closing apply context");
        hooks.triggers.end_query(&self.relation)
    }
}
