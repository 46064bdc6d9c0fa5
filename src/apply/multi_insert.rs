use std::sync::Arc;

use tracing::{debug, trace};

use super::context::{ExecContext, RowHolder};
use super::heap::ApplyOutcome;
use super::hooks::{ApplyHooks, BulkInsertState, TriggerAction};
use super::relation::Relation;
use super::row::{CommandId, RowImage};
use crate::Result;

/// One multi-insert episode: buffered rows for a single relation, written
/// with one bulk storage call per flush.
///
/// Index entries and after-row triggers for buffered rows are deferred until
/// the rows have been placed.
#[derive(Debug)]
pub struct MultiInsertState {
    ctx: ExecContext,
    cid: CommandId,
    bulk: BulkInsertState,
    slots: Vec<RowHolder>,
    capacity: usize,
    buffered: usize,
}

impl MultiInsertState {
    /// Binds a new episode to `relation`.
    ///
    /// Batching is disabled (capacity 1) when before-row or instead-of insert
    /// triggers exist, or when a default is volatile: those must observe one
    /// row at a time.
    pub fn start(
        hooks: &mut ApplyHooks<'_>,
        relation: Arc<Relation>,
        max_capacity: usize,
    ) -> Result<Self> {
        let mut ctx = ExecContext::init(relation.clone(), hooks);
        let opened = ctx
            .open_indexes(hooks)
            .and_then(|_| hooks.storage.begin_bulk_insert(&relation));
        let bulk = match opened {
            Ok(bulk) => bulk,
            Err(e) => {
                // close the scope anyway, the first error wins
                let _ = ctx.finish(hooks);
                return Err(e);
            }
        };

        let triggers = relation.triggers;
        let row_at_a_time = triggers.insert_before_row
            || triggers.insert_instead_row
            || relation.has_volatile_defaults();
        let capacity = if row_at_a_time {
            1
        } else {
            max_capacity.max(1)
        };

        let cid = hooks.txn.current_command_id();

        debug!(
            relation = %relation.qualified_name(),
            capacity,
            "Starting multi-insert"
        );

        Ok(Self {
            ctx,
            cid,
            bulk,
            slots: Vec::with_capacity(capacity),
            capacity,
            buffered: 0,
        })
    }

    pub fn relation(&self) -> &Arc<Relation> {
        self.ctx.relation()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Prepares `tup` and copies it into the next free slot, flushing first
    /// if the buffer is full. A trigger veto drops the row.
    pub fn add(&mut self, hooks: &mut ApplyHooks<'_>, mut tup: RowImage) -> Result<ApplyOutcome> {
        if self.buffered >= self.capacity {
            self.flush(hooks)?;
        }

        let relation = self.ctx.relation().clone();
        tup.normalize(&relation)?;

        self.ctx.defaults.fill(hooks.txn, &mut tup)?;
        self.ctx.slot.store_owned(tup);

        if relation.triggers.insert_before_row {
            if let Some(row) = self.ctx.slot.get_mut() {
                if hooks.triggers.before_insert(&relation, row)? == TriggerAction::Suppress {
                    trace!(
                        relation = %relation.qualified_name(),
                        "Buffered insert suppressed by trigger"
                    );
                    return Ok(ApplyOutcome::Suppressed);
                }
            }
        }

        let row = self.ctx.slot_row()?;
        if relation.has_constraints() {
            hooks.constraints.check(&relation, row)?;
        }

        if self.slots.len() == self.buffered {
            self.slots.push(RowHolder::new());
        }
        self.slots[self.buffered].store(row);
        self.buffered += 1;

        Ok(ApplyOutcome::Buffered)
    }

    /// Writes all buffered rows, then maintains indexes and fires after-row
    /// insert triggers for each of them.
    pub fn flush(&mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        let relation = self.ctx.relation().clone();
        let rows: Vec<RowImage> = self.slots[..self.buffered]
            .iter()
            .filter_map(|slot| slot.get().cloned())
            .collect();

        let mut stamp = hooks.txn.write_stamp();
        stamp.command_id = self.cid;
        let ids = hooks.storage.multi_insert(&relation, &rows, stamp, &mut self.bulk)?;

        debug!(
            relation = %relation.qualified_name(),
            rows = rows.len(),
            "Flushed multi-insert buffer"
        );

        // index entries point at placed rows, so they come after the write
        if self.ctx.num_indexes() > 0 {
            for (id, row) in ids.iter().zip(&rows) {
                let recheck = self.ctx.update_open_indexes(hooks, *id, row, false)?;
                if relation.triggers.insert_after_row {
                    hooks.triggers.after_insert(&*hooks.storage, &relation, *id, row, &recheck)?;
                }
            }
        } else if relation.triggers.insert_after_row {
            for (id, row) in ids.iter().zip(&rows) {
                hooks.triggers.after_insert(&*hooks.storage, &relation, *id, row, &[])?;
            }
        }

        for slot in &mut self.slots[..self.buffered] {
            slot.clear();
        }
        self.buffered = 0;
        Ok(())
    }

    /// Flushes, releases the bulk-insert handle and closes the context. The
    /// handle and the context are released even when the flush fails.
    pub fn finish(mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        let flushed = self.flush(hooks);
        let released = self.release(hooks);
        flushed?;
        released
    }

    /// Drops buffered rows without writing them, then releases the
    /// bulk-insert handle and closes the context.
    pub fn discard(mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        debug!(
            relation = %self.ctx.relation().qualified_name(),
            buffered = self.buffered,
            "Discarding multi-insert buffer"
        );
        self.buffered = 0;
        self.release(hooks)
    }

    fn release(self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        hooks.storage.end_bulk_insert(self.bulk);
        debug!(relation = %self.ctx.relation().qualified_name(), "Finished multi-insert");
        self.ctx.finish(hooks)
    }
}
