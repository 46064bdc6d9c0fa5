use crate::apply::hooks::ConstraintChecker;
use crate::apply::relation::{quote_identifier, Relation};
use crate::apply::row::RowImage;
use crate::{Error, Result};

/// Enforces `NOT NULL` on every live column.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotNullChecker;

impl ConstraintChecker for NotNullChecker {
    fn check(&self, relation: &Relation, row: &RowImage) -> Result<()> {
        for (col, column) in relation.columns.iter().enumerate() {
            if column.dropped || !column.not_null {
                continue;
            }
            if row.is_null(col) {
                return Err(Error::NotNullViolation {
                    relation: relation.qualified_name(),
                    column: quote_identifier(&column.name),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::relation::ColumnDesc;
    use serde_json::json;

    #[test]
    fn test_null_in_not_null_column() {
        let rel = Relation::new(
            1,
            "public",
            "t",
            vec![ColumnDesc::new("id").not_null(), ColumnDesc::new("v")],
        );

        assert!(NotNullChecker.check(&rel, &RowImage::from_json(&[json!(1), json!(null)])).is_ok());

        let err = NotNullChecker
            .check(&rel, &RowImage::from_options(vec![None, Some(json!("a"))]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "null value in column id of relation public.t violates not-null constraint"
        );
    }

    #[test]
    fn test_dropped_columns_are_ignored() {
        let rel = Relation::new(
            1,
            "public",
            "t",
            vec![ColumnDesc::new("id"), ColumnDesc::new("gone").not_null().dropped()],
        );
        let row = RowImage::from_options(vec![Some(json!(1)), None]);
        assert!(NotNullChecker.check(&rel, &row).is_ok());
    }
}
