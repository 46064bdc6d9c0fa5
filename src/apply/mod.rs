pub mod context;
pub mod defaults;
pub mod heap;
pub mod hooks;
pub mod lookup;
pub mod multi_insert;
pub mod relation;
pub mod row;

#[cfg(test)]
mod multi_insert_tests;

pub use context::{ExecContext, RowHolder};
pub use defaults::DefaultFiller;
pub use heap::{ApplyOutcome, HeapApplier};
pub use hooks::{
    ApplyHooks, BulkInsertState, ConstraintChecker, RecheckState, ReplicaMatch, RowLookup,
    TableStorage, TransactionContext, TriggerAction, TriggerExecutor, UpdateResult,
};
pub use lookup::IndexLookup;
pub use multi_insert::MultiInsertState;
pub use relation::{ColumnDesc, DefaultExpr, IndexDesc, IndexId, Relation, RelationId, TriggerDesc};
pub use row::{
    CommandId, Datum, LocalRow, OriginId, RowId, RowImage, RowOrigin, TransactionId, WriteStamp,
};
