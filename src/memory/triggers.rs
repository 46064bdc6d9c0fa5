use std::fmt;

use crate::apply::hooks::{RecheckState, TableStorage, TriggerAction, TriggerExecutor};
use crate::apply::relation::{IndexId, Relation};
use crate::apply::row::{LocalRow, RowId, RowImage};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Insert,
    Update,
    Delete,
}

/// One trigger invocation as seen by [`RecordingTriggers`].
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub timing: TriggerTiming,
    pub op: TriggerOp,
    pub relation: String,
    pub row_id: Option<RowId>,
    pub row: RowImage,
    /// For after-row triggers: whether the row was reachable through the
    /// replica identity index when the trigger fired.
    pub indexed: Option<bool>,
}

type RowHook = Box<dyn FnMut(&mut RowImage) -> TriggerAction + Send>;
type DeleteHook = Box<dyn FnMut(&LocalRow) -> TriggerAction + Send>;

/// Trigger executor that records every call and runs optional before-row
/// hooks, which may rewrite the row or veto the change.
#[derive(Default)]
pub struct RecordingTriggers {
    events: Vec<TriggerEvent>,
    before_insert: Option<RowHook>,
    before_update: Option<RowHook>,
    before_delete: Option<DeleteHook>,
    open_queries: usize,
    completed_queries: usize,
}

impl fmt::Debug for RecordingTriggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTriggers")
            .field("events", &self.events.len())
            .field("open_queries", &self.open_queries)
            .field("completed_queries", &self.completed_queries)
            .finish()
    }
}

impl RecordingTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_insert(
        mut self,
        hook: impl FnMut(&mut RowImage) -> TriggerAction + Send + 'static,
    ) -> Self {
        self.before_insert = Some(Box::new(hook));
        self
    }

    pub fn on_before_update(
        mut self,
        hook: impl FnMut(&mut RowImage) -> TriggerAction + Send + 'static,
    ) -> Self {
        self.before_update = Some(Box::new(hook));
        self
    }

    pub fn on_before_delete(
        mut self,
        hook: impl FnMut(&LocalRow) -> TriggerAction + Send + 'static,
    ) -> Self {
        self.before_delete = Some(Box::new(hook));
        self
    }

    pub fn events(&self) -> &[TriggerEvent] {
        &self.events
    }

    pub fn events_of(&self, timing: TriggerTiming, op: TriggerOp) -> Vec<&TriggerEvent> {
        self.events.iter().filter(|e| e.timing == timing && e.op == op).collect()
    }

    /// After-trigger scopes opened and closed so far.
    pub fn completed_queries(&self) -> usize {
        self.completed_queries
    }

    pub fn open_queries(&self) -> usize {
        self.open_queries
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn record(
        &mut self,
        timing: TriggerTiming,
        op: TriggerOp,
        relation: &Relation,
        row_id: Option<RowId>,
        row: &RowImage,
        indexed: Option<bool>,
    ) {
        self.events.push(TriggerEvent {
            timing,
            op,
            relation: relation.qualified_name(),
            row_id,
            row: row.clone(),
            indexed,
        });
    }
}

fn reachable_by_identity(
    storage: &dyn TableStorage,
    relation: &Relation,
    id: RowId,
    row: &RowImage,
) -> Result<Option<bool>> {
    let Some(index) = relation.replica_identity_index() else {
        return Ok(None);
    };
    let Some(key) = row.key(&index.columns) else {
        return Ok(Some(false));
    };
    let found = storage.index_probe(relation, index.id, &key)?;
    Ok(Some(found.map(|local| local.id == id).unwrap_or(false)))
}

impl TriggerExecutor for RecordingTriggers {
    fn begin_query(&mut self, _relation: &Relation) {
        self.open_queries += 1;
    }

    fn end_query(&mut self, relation: &Relation) -> Result<()> {
        if self.open_queries == 0 {
            return Err(Error::Trigger {
                relation: relation.qualified_name(),
                message: "after-trigger scope ended without being started".to_string(),
            });
        }
        self.open_queries -= 1;
        self.completed_queries += 1;
        Ok(())
    }

    fn before_insert(&mut self, relation: &Relation, row: &mut RowImage) -> Result<TriggerAction> {
        let action = match self.before_insert.as_mut() {
            Some(hook) => hook(row),
            None => TriggerAction::Proceed,
        };
        self.record(TriggerTiming::Before, TriggerOp::Insert, relation, None, row, None);
        Ok(action)
    }

    fn before_update(
        &mut self,
        relation: &Relation,
        recheck: &mut RecheckState,
        _old: &LocalRow,
        new: &mut RowImage,
    ) -> Result<TriggerAction> {
        let action = match self.before_update.as_mut() {
            Some(hook) => hook(new),
            None => TriggerAction::Proceed,
        };
        self.record(
            TriggerTiming::Before,
            TriggerOp::Update,
            relation,
            recheck.target(),
            new,
            None,
        );
        Ok(action)
    }

    fn before_delete(
        &mut self,
        relation: &Relation,
        recheck: &mut RecheckState,
        old: &LocalRow,
    ) -> Result<TriggerAction> {
        let action = match self.before_delete.as_mut() {
            Some(hook) => hook(old),
            None => TriggerAction::Proceed,
        };
        self.record(
            TriggerTiming::Before,
            TriggerOp::Delete,
            relation,
            recheck.target(),
            &old.image,
            None,
        );
        Ok(action)
    }

    fn after_insert(
        &mut self,
        storage: &dyn TableStorage,
        relation: &Relation,
        id: RowId,
        row: &RowImage,
        _recheck_indexes: &[IndexId],
    ) -> Result<()> {
        let indexed = reachable_by_identity(storage, relation, id, row)?;
        self.record(TriggerTiming::After, TriggerOp::Insert, relation, Some(id), row, indexed);
        Ok(())
    }

    fn after_update(
        &mut self,
        storage: &dyn TableStorage,
        relation: &Relation,
        old: &LocalRow,
        new: &RowImage,
        _recheck_indexes: &[IndexId],
    ) -> Result<()> {
        let indexed = reachable_by_identity(storage, relation, old.id, new)?;
        self.record(TriggerTiming::After, TriggerOp::Update, relation, Some(old.id), new, indexed);
        Ok(())
    }

    fn after_delete(
        &mut self,
        _storage: &dyn TableStorage,
        relation: &Relation,
        old: &LocalRow,
    ) -> Result<()> {
        self.record(
            TriggerTiming::After,
            TriggerOp::Delete,
            relation,
            Some(old.id),
            &old.image,
            None,
        );
        Ok(())
    }
}
