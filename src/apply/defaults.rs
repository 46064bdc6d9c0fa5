use super::hooks::TransactionContext;
use super::relation::{DefaultExpr, Relation};
use super::row::{Datum, RowImage};
use crate::Result;

/// Fills columns replication did not deliver with their default values.
///
/// The set of columns to fill is computed once per relation; expressions
/// are evaluated again for every row.
#[derive(Debug, Clone, Default)]
pub struct DefaultFiller {
    defaults: Vec<(usize, DefaultExpr)>,
}

impl DefaultFiller {
    pub fn new(relation: &Relation) -> Self {
        // we got all the data via replication
        if relation.attmap.len() == relation.natts() {
            return Self::default();
        }

        let defaults = relation
            .columns
            .iter()
            .enumerate()
            .filter(|(attnum, column)| !column.dropped && !relation.in_attmap(*attnum))
            .filter_map(|(attnum, column)| column.default.clone().map(|expr| (attnum, expr)))
            .collect();

        Self { defaults }
    }

    pub fn is_empty(&self) -> bool {
        self.defaults.is_empty()
    }

    /// Writes defaults into `row`. Columns without a default stay null.
    pub fn fill(&self, txn: &mut dyn TransactionContext, row: &mut RowImage) -> Result<()> {
        for (attnum, expr) in &self.defaults {
            let value = evaluate(expr, txn)?;
            row.set(*attnum, (!value.is_null()).then_some(value));
        }
        Ok(())
    }
}

fn evaluate(expr: &DefaultExpr, txn: &mut dyn TransactionContext) -> Result<Datum> {
    Ok(match expr {
        DefaultExpr::Const(value) => value.clone(),
        DefaultExpr::NextVal(sequence) => Datum::from(txn.next_sequence_value(sequence)?),
        DefaultExpr::TransactionTimestamp => {
            Datum::String(txn.transaction_timestamp().to_rfc3339())
        }
        DefaultExpr::ClockTimestamp => Datum::String(chrono::Utc::now().to_rfc3339()),
    })
}
