use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::context::ExecContext;
use super::hooks::{ApplyHooks, TriggerAction};
use super::multi_insert::MultiInsertState;
use super::relation::{IndexId, Relation};
use super::row::{LocalRow, RowImage};
use crate::conflict::{
    index_name, Conflict, ConflictKind, ConflictOutcome, ConflictPolicy, ConflictReport, Resolution,
};
use crate::{Config, Error, Result};

/// What happened to one remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    /// A conflict was detected and the resolved row was written.
    ConflictApplied { kind: ConflictKind, resolution: Resolution },
    /// A conflict was detected and nothing was written.
    ConflictSkipped { kind: ConflictKind, resolution: Resolution },
    /// A before-row trigger declined the change.
    Suppressed,
    /// The row sits in the multi-insert buffer until the next flush.
    Buffered,
}

impl ApplyOutcome {
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            ApplyOutcome::ConflictApplied { kind, .. }
            | ApplyOutcome::ConflictSkipped { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Applies decoded remote changes to local tables.
///
/// Owns the at-most-one multi-insert episode of the apply worker's current
/// transaction; single-row changes finish that episode before running.
#[derive(Debug)]
pub struct HeapApplier {
    policy: ConflictPolicy,
    multi_insert_enabled: bool,
    multi_insert_capacity: usize,
    pub(crate) mistate: Option<MultiInsertState>,
}

impl HeapApplier {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: config.conflicts.resolver,
            multi_insert_enabled: config.apply.multi_insert,
            multi_insert_capacity: config.multi_insert_capacity(),
            mistate: None,
        }
    }

    /// Starts applying a remote transaction.
    pub fn begin(&mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        if self.mistate.is_some() {
            debug!("Discarding multi-insert state left over from an aborted transaction");
            self.abort(hooks);
        }
        Ok(())
    }

    /// Finishes the remote transaction, flushing any buffered rows.
    pub fn commit(&mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        self.finish_multi_insert(hooks)
    }

    /// Drops all apply state after the enclosing transaction failed. Buffered
    /// rows are discarded along with the transaction, but the bulk-insert
    /// handle and the after-trigger scope are still released.
    pub fn abort(&mut self, hooks: &mut ApplyHooks<'_>) {
        if let Some(state) = self.mistate.take() {
            let relation = state.relation().qualified_name();
            if let Err(e) = state.discard(hooks) {
                warn!(
                    relation = %relation,
                    error = %e,
                    "Failed to release multi-insert state on abort"
                );
            }
        }
    }

    /// Whether inserts into `relation` may go through the multi-insert
    /// buffer. Batching cannot resolve conflicts row by row, so it needs a
    /// policy that turns every conflict into an error.
    pub fn can_multi_insert(&self, _relation: &Relation) -> bool {
        self.multi_insert_enabled && self.policy == ConflictPolicy::Error
    }

    pub fn insert(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        relation: &Arc<Relation>,
        newtup: RowImage,
    ) -> Result<ApplyOutcome> {
        self.finish_multi_insert(hooks)?;

        let mut ctx = ExecContext::init(relation.clone(), hooks);
        let outcome = apply_insert(&mut ctx, hooks, newtup);
        let finished = ctx.finish(hooks);
        let outcome = outcome?;
        finished?;

        hooks.txn.command_counter_increment();
        trace!(relation = %relation.qualified_name(), ?outcome, "Applied insert");
        Ok(outcome)
    }

    pub fn update(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        relation: &Arc<Relation>,
        oldtup: &RowImage,
        newtup: RowImage,
    ) -> Result<ApplyOutcome> {
        self.finish_multi_insert(hooks)?;

        let mut ctx = ExecContext::init(relation.clone(), hooks);
        let outcome = apply_update(&mut ctx, hooks, oldtup, newtup);
        let finished = ctx.finish(hooks);
        let outcome = outcome?;
        finished?;

        hooks.txn.command_counter_increment();
        trace!(relation = %relation.qualified_name(), ?outcome, "Applied update");
        Ok(outcome)
    }

    pub fn delete(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        relation: &Arc<Relation>,
        oldtup: &RowImage,
    ) -> Result<ApplyOutcome> {
        self.finish_multi_insert(hooks)?;

        let mut ctx = ExecContext::init(relation.clone(), hooks);
        let outcome = apply_delete(&mut ctx, hooks, oldtup);
        let finished = ctx.finish(hooks);
        let outcome = outcome?;
        finished?;

        hooks.txn.command_counter_increment();
        trace!(relation = %relation.qualified_name(), ?outcome, "Applied delete");
        Ok(outcome)
    }

    /// Buffers an insert, binding the multi-insert episode to `relation`.
    pub fn multi_insert_add(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        relation: &Arc<Relation>,
        tup: RowImage,
    ) -> Result<ApplyOutcome> {
        self.start_multi_insert(hooks, relation)?.add(hooks, tup)
    }

    /// Flushes and tears down the current multi-insert episode, if any.
    pub fn finish_multi_insert(&mut self, hooks: &mut ApplyHooks<'_>) -> Result<()> {
        let Some(state) = self.mistate.take() else {
            return Ok(());
        };
        state.finish(hooks)?;
        hooks.txn.command_counter_increment();
        Ok(())
    }

    /// Rows currently waiting in the multi-insert buffer.
    pub fn buffered_rows(&self) -> usize {
        self.mistate.as_ref().map(MultiInsertState::buffered).unwrap_or(0)
    }

    /// Capacity of the active multi-insert episode.
    pub fn multi_insert_capacity(&self) -> Option<usize> {
        self.mistate.as_ref().map(MultiInsertState::capacity)
    }

    fn start_multi_insert(
        &mut self,
        hooks: &mut ApplyHooks<'_>,
        relation: &Arc<Relation>,
    ) -> Result<&mut MultiInsertState> {
        let rebind = match &self.mistate {
            Some(state) => state.relation().id != relation.id,
            None => true,
        };

        if rebind {
            // buffers never span relations
            self.finish_multi_insert(hooks)?;
            let state =
                MultiInsertState::start(hooks, relation.clone(), self.multi_insert_capacity)?;
            return Ok(self.mistate.insert(state));
        }

        self.mistate.as_mut().ok_or_else(|| Error::Storage {
            message: "multi-insert state is not bound".to_string(),
        })
    }
}

/// Runs before-row insert triggers on the slot. Returns false on veto.
fn fire_before_insert(ctx: &mut ExecContext, hooks: &mut ApplyHooks<'_>) -> Result<bool> {
    let relation = ctx.relation().clone();
    let Some(row) = ctx.slot.get_mut() else {
        return Ok(true);
    };
    Ok(hooks.triggers.before_insert(&relation, row)? == TriggerAction::Proceed)
}

fn fire_before_update(
    ctx: &mut ExecContext,
    hooks: &mut ApplyHooks<'_>,
    local: &LocalRow,
) -> Result<bool> {
    let relation = ctx.relation().clone();
    let mut recheck = std::mem::take(ctx.recheck_for(local.id));
    let action = match ctx.slot.get_mut() {
        Some(row) => hooks.triggers.before_update(&relation, &mut recheck, local, row)?,
        None => TriggerAction::Proceed,
    };
    recheck.clear();
    ctx.recheck = Some(recheck);
    Ok(action == TriggerAction::Proceed)
}

fn check_constraints(ctx: &ExecContext, hooks: &mut ApplyHooks<'_>) -> Result<()> {
    let relation = ctx.relation();
    if relation.has_constraints() {
        hooks.constraints.check(relation, ctx.slot_row()?)?;
    }
    Ok(())
}

/// Writes the slot over `local`, maintains indexes and fires after-row
/// update triggers.
fn update_local_row(
    ctx: &mut ExecContext,
    hooks: &mut ApplyHooks<'_>,
    local: &LocalRow,
) -> Result<()> {
    check_constraints(ctx, hooks)?;

    let relation = ctx.relation().clone();
    let row = ctx.slot_row()?.clone();
    let stamp = hooks.txn.write_stamp();

    let result = hooks.storage.update(&relation, local.id, &row, stamp)?;
    let recheck = if result.update_indexes {
        ctx.open_indexes(hooks)?;
        ctx.update_open_indexes(hooks, local.id, &row, true)?
    } else {
        Vec::new()
    };

    if relation.triggers.update_after_row {
        hooks.triggers.after_update(&*hooks.storage, &relation, local, &row, &recheck)?;
    }
    Ok(())
}

fn apply_insert(
    ctx: &mut ExecContext,
    hooks: &mut ApplyHooks<'_>,
    mut newtup: RowImage,
) -> Result<ApplyOutcome> {
    let relation = ctx.relation().clone();
    newtup.normalize(&relation)?;

    ctx.open_indexes(hooks)?;

    ctx.defaults.fill(hooks.txn, &mut newtup)?;
    ctx.slot.store_owned(newtup);

    let mut has_before_triggers = false;
    if relation.triggers.insert_before_row {
        has_before_triggers = true;
        if !fire_before_insert(ctx, hooks)? {
            debug!(relation = %relation.qualified_name(), "Insert suppressed by trigger");
            return Ok(ApplyOutcome::Suppressed);
        }
    }

    // trigger might have changed the row, look it up as it is now
    let conflict = hooks.lookup.find_conflict(&*hooks.storage, &relation, ctx.slot_row()?)?;

    let Some((local, index)) = conflict else {
        check_constraints(ctx, hooks)?;

        let row = ctx.slot_row()?.clone();
        let stamp = hooks.txn.write_stamp();
        let id = hooks.storage.insert(&relation, &row, stamp)?;
        let recheck = ctx.update_open_indexes(hooks, id, &row, false)?;

        if relation.triggers.insert_after_row {
            hooks.triggers.after_insert(&*hooks.storage, &relation, id, &row, &recheck)?;
        }
        return Ok(ApplyOutcome::Inserted);
    };

    let kind = ConflictKind::InsertInsert;
    let remote = ctx.slot_row()?.clone();
    let outcome = resolve(hooks, kind, &relation, &local, &remote)?;
    let applied = outcome.winner().map(|winner| winner.merge_onto(&local.image));

    report(
        hooks,
        ReportInput {
            kind,
            relation: &relation,
            local: Some(&local),
            old_key: None,
            remote: &remote,
            applied: applied.as_ref(),
            resolution: outcome.resolution(),
            index: Some(index),
            has_before_triggers,
        },
    );

    let Some(applied) = applied else {
        return Ok(ApplyOutcome::ConflictSkipped {
            kind,
            resolution: outcome.resolution(),
        });
    };

    // the insert becomes an update of the existing row
    ctx.slot.store_owned(applied);
    if relation.triggers.update_before_row && !fire_before_update(ctx, hooks, &local)? {
        debug!(relation = %relation.qualified_name(), "Conflict update suppressed by trigger");
        return Ok(ApplyOutcome::Suppressed);
    }

    update_local_row(ctx, hooks, &local)?;
    Ok(ApplyOutcome::ConflictApplied {
        kind,
        resolution: outcome.resolution(),
    })
}

fn apply_update(
    ctx: &mut ExecContext,
    hooks: &mut ApplyHooks<'_>,
    oldtup: &RowImage,
    mut newtup: RowImage,
) -> Result<ApplyOutcome> {
    let relation = ctx.relation().clone();
    newtup.normalize(&relation)?;

    let found = hooks.lookup.find_replica_identity(&*hooks.storage, &relation, oldtup)?;

    let Some(local) = found.row else {
        // we may not have the whole row, so it cannot be inserted instead
        let kind = ConflictKind::UpdateDelete;
        hooks.resolver.on_missing_row(kind, &relation)?;
        report(
            hooks,
            ReportInput {
                kind,
                relation: &relation,
                local: None,
                old_key: Some(oldtup),
                remote: &newtup,
                applied: None,
                resolution: Resolution::Skip,
                index: Some(found.index),
                has_before_triggers: false,
            },
        );
        return Ok(ApplyOutcome::ConflictSkipped {
            kind,
            resolution: Resolution::Skip,
        });
    };

    ctx.defaults.fill(hooks.txn, &mut newtup)?;
    ctx.slot.store_owned(newtup.merge_onto(&local.image));

    let mut has_before_triggers = false;
    if relation.triggers.update_before_row {
        has_before_triggers = true;
        if !fire_before_update(ctx, hooks, &local)? {
            debug!(relation = %relation.qualified_name(), "Update suppressed by trigger");
            return Ok(ApplyOutcome::Suppressed);
        }
    }

    // rows written earlier in this transaction, or by the stream being
    // applied, are not conflicts
    let concurrent = match local.origin {
        Some(origin) => {
            local.xmin != hooks.txn.top_xid() && origin.origin != hooks.txn.session_origin()
        }
        None => false,
    };

    if !concurrent {
        update_local_row(ctx, hooks, &local)?;
        return Ok(ApplyOutcome::Updated);
    }

    let kind = ConflictKind::UpdateUpdate;
    let remote = ctx.slot_row()?.clone();
    let outcome = resolve(hooks, kind, &relation, &local, &remote)?;
    let applied = outcome.winner().map(|winner| winner.merge_onto(&local.image));

    report(
        hooks,
        ReportInput {
            kind,
            relation: &relation,
            local: Some(&local),
            old_key: Some(oldtup),
            remote: &remote,
            applied: applied.as_ref(),
            resolution: outcome.resolution(),
            index: Some(found.index),
            has_before_triggers,
        },
    );

    match applied {
        Some(applied) => {
            ctx.slot.store_owned(applied);
            update_local_row(ctx, hooks, &local)?;
            Ok(ApplyOutcome::ConflictApplied {
                kind,
                resolution: outcome.resolution(),
            })
        }
        None => Ok(ApplyOutcome::ConflictSkipped {
            kind,
            resolution: outcome.resolution(),
        }),
    }
}

fn apply_delete(
    ctx: &mut ExecContext,
    hooks: &mut ApplyHooks<'_>,
    oldtup: &RowImage,
) -> Result<ApplyOutcome> {
    let relation = ctx.relation().clone();

    let found = hooks.lookup.find_replica_identity(&*hooks.storage, &relation, oldtup)?;

    let Some(local) = found.row else {
        let kind = ConflictKind::DeleteDelete;
        hooks.resolver.on_missing_row(kind, &relation)?;
        report(
            hooks,
            ReportInput {
                kind,
                relation: &relation,
                local: None,
                old_key: Some(oldtup),
                remote: oldtup,
                applied: None,
                resolution: Resolution::Skip,
                index: Some(found.index),
                has_before_triggers: false,
            },
        );
        return Ok(ApplyOutcome::ConflictSkipped {
            kind,
            resolution: Resolution::Skip,
        });
    };

    if relation.triggers.delete_before_row {
        let mut recheck = std::mem::take(ctx.recheck_for(local.id));
        let action = hooks.triggers.before_delete(&relation, &mut recheck, &local)?;
        recheck.clear();
        ctx.recheck = Some(recheck);

        if action == TriggerAction::Suppress {
            debug!(relation = %relation.qualified_name(), "Delete suppressed by trigger");
            return Ok(ApplyOutcome::Suppressed);
        }
    }

    hooks.storage.delete(&relation, local.id)?;

    if relation.triggers.delete_after_row {
        hooks.triggers.after_delete(&*hooks.storage, &relation, &local)?;
    }
    Ok(ApplyOutcome::Deleted)
}

fn resolve(
    hooks: &mut ApplyHooks<'_>,
    kind: ConflictKind,
    relation: &Relation,
    local: &LocalRow,
    remote: &RowImage,
) -> Result<ConflictOutcome> {
    hooks.resolver.resolve(&Conflict {
        kind,
        relation,
        local,
        remote,
        remote_origin: hooks.txn.session_origin(),
        remote_commit_ts: hooks.txn.remote_commit_ts(),
    })
}

struct ReportInput<'a> {
    kind: ConflictKind,
    relation: &'a Relation,
    local: Option<&'a LocalRow>,
    old_key: Option<&'a RowImage>,
    remote: &'a RowImage,
    applied: Option<&'a RowImage>,
    resolution: Resolution,
    index: Option<IndexId>,
    has_before_triggers: bool,
}

fn report(hooks: &mut ApplyHooks<'_>, input: ReportInput<'_>) {
    let report = ConflictReport {
        kind: input.kind,
        relation: input.relation.qualified_name(),
        local: input.local.map(|l| l.image.clone()),
        local_xid: input.local.map(|l| l.xmin),
        local_origin: input.local.and_then(|l| l.origin),
        old_key: input.old_key.cloned(),
        remote: input.remote.clone(),
        remote_origin: hooks.txn.session_origin(),
        applied: input.applied.cloned(),
        resolution: input.resolution,
        index: input.index.and_then(|i| index_name(input.relation, i)),
        has_before_triggers: input.has_before_triggers,
    };
    hooks.reporter.report(&report);
}
