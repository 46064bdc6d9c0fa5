use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::relation::Relation;
use crate::{Error, Result};

/// Column value. Nullness lives in the row image's null flags, never here.
pub type Datum = serde_json::Value;

pub type TransactionId = u32;
pub type OriginId = u16;
pub type CommandId = u32;
pub type RowId = u64;

/// One row as values plus parallel null and changed flags, laid out by
/// physical column position of the target relation.
///
/// Columns the remote side did not send are null and unchanged until the
/// default filler runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowImage {
    pub values: Vec<Datum>,
    pub nulls: Vec<bool>,
    #[serde(default)]
    pub changed: Vec<bool>,
}

impl RowImage {
    /// An all-null, all-unchanged image of `width` columns.
    pub fn empty(width: usize) -> Self {
        Self {
            values: vec![Datum::Null; width],
            nulls: vec![true; width],
            changed: vec![false; width],
        }
    }

    /// Builds an image where every present value is marked changed.
    pub fn from_options(values: Vec<Option<Datum>>) -> Self {
        let mut image = Self::empty(values.len());
        for (i, value) in values.into_iter().enumerate() {
            image.set(i, value);
            image.changed[i] = true;
        }
        image
    }

    /// Builds an image from a JSON array, `null` entries become SQL nulls.
    pub fn from_json(values: &[Datum]) -> Self {
        Self::from_options(
            values
                .iter()
                .map(|v| if v.is_null() { None } else { Some(v.clone()) })
                .collect(),
        )
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, column: usize) -> Option<&Datum> {
        match self.nulls.get(column) {
            Some(false) => self.values.get(column),
            _ => None,
        }
    }

    pub fn is_null(&self, column: usize) -> bool {
        self.nulls.get(column).copied().unwrap_or(true)
    }

    pub fn is_changed(&self, column: usize) -> bool {
        self.changed.get(column).copied().unwrap_or(false)
    }

    /// Stores a value without touching the changed flag.
    pub fn set(&mut self, column: usize, value: Option<Datum>) {
        match value {
            Some(v) => {
                self.values[column] = v;
                self.nulls[column] = false;
            }
            None => {
                self.values[column] = Datum::Null;
                self.nulls[column] = true;
            }
        }
    }

    pub fn with_changed(mut self, changed: Vec<bool>) -> Self {
        self.changed = changed;
        self
    }

    /// Checks the image against the physical width of `relation` and pads a
    /// missing changed array. Columns outside the attribute map are never
    /// delivered, so they are marked unchanged whatever the sender claimed.
    pub fn normalize(&mut self, relation: &Relation) -> Result<()> {
        let width = relation.natts();
        if self.values.len() != width || self.nulls.len() != width {
            return Err(Error::InvalidRow {
                message: format!(
                    "expected {} columns, got {} values and {} null flags",
                    width,
                    self.values.len(),
                    self.nulls.len()
                ),
            });
        }
        if self.changed.is_empty() {
            self.changed = vec![true; width];
        } else if self.changed.len() != width {
            return Err(Error::InvalidRow {
                message: format!("expected {} changed flags, got {}", width, self.changed.len()),
            });
        }

        for (column, changed) in self.changed.iter_mut().enumerate() {
            if !relation.in_attmap(column) {
                *changed = false;
            }
        }
        Ok(())
    }

    /// Columns marked changed are taken from `self`, everything else keeps
    /// the value found in `base`.
    pub fn merge_onto(&self, base: &RowImage) -> RowImage {
        let mut merged = base.clone();
        for column in 0..merged.width().min(self.width()) {
            if self.is_changed(column) {
                merged.values[column] = self.values[column].clone();
                merged.nulls[column] = self.nulls[column];
            }
        }
        merged.changed = self.changed.clone();
        merged
    }

    /// Values as options, `None` for nulls.
    pub fn to_options(&self) -> Vec<Option<Datum>> {
        (0..self.width()).map(|i| self.get(i).cloned()).collect()
    }

    /// Key values for the given columns, or `None` if any of them is null.
    pub fn key(&self, columns: &[usize]) -> Option<Vec<&Datum>> {
        columns.iter().map(|&c| self.get(c)).collect()
    }
}

/// Replication origin and commit time recorded for the last writer of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOrigin {
    pub origin: OriginId,
    pub commit_ts: Option<DateTime<Utc>>,
}

/// A row found in local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRow {
    pub id: RowId,
    pub image: RowImage,
    /// Transaction that last wrote the row.
    pub xmin: TransactionId,
    /// `None` when the storage does not track commit origins.
    pub origin: Option<RowOrigin>,
}

/// Writer identity stamped on rows by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStamp {
    pub xid: TransactionId,
    pub origin: OriginId,
    pub commit_ts: Option<DateTime<Utc>>,
    pub command_id: CommandId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::relation::ColumnDesc;
    use serde_json::json;

    #[test]
    fn test_from_json_marks_nulls() {
        let row = RowImage::from_json(&[json!(1), json!(null), json!("a")]);
        assert_eq!(row.get(0), Some(&json!(1)));
        assert!(row.is_null(1));
        assert_eq!(row.get(1), None);
        assert!(row.changed.iter().all(|c| *c));
    }

    #[test]
    fn test_merge_keeps_unchanged_local_columns() {
        let local = RowImage::from_json(&[json!(1), json!("a"), json!(10)]);
        let remote = RowImage::from_json(&[json!(1), json!("b"), json!(null)])
            .with_changed(vec![false, true, false]);

        let merged = remote.merge_onto(&local);
        assert_eq!(merged.get(0), Some(&json!(1)));
        assert_eq!(merged.get(1), Some(&json!("b")));
        assert_eq!(merged.get(2), Some(&json!(10)));
    }

    #[test]
    fn test_merge_can_null_out_a_changed_column() {
        let local = RowImage::from_json(&[json!(1), json!("a")]);
        let remote = RowImage::from_json(&[json!(1), json!(null)]);

        let merged = remote.merge_onto(&local);
        assert!(merged.is_null(1));
    }

    fn relation(attmap: Vec<usize>) -> Relation {
        let columns = vec![ColumnDesc::new("id"), ColumnDesc::new("v"), ColumnDesc::new("local")];
        Relation::new(1, "public", "t", columns).with_attmap(attmap)
    }

    #[test]
    fn test_normalize_rejects_wrong_width() {
        let rel = relation(vec![0, 1, 2]);
        let mut row = RowImage::from_json(&[json!(1)]);
        assert!(row.normalize(&rel).is_err());

        let mut row = RowImage {
            values: vec![json!(1), json!(2), json!(3)],
            nulls: vec![false, false, false],
            changed: vec![],
        };
        row.normalize(&rel).unwrap();
        assert_eq!(row.changed, vec![true, true, true]);
    }

    #[test]
    fn test_normalize_clears_changed_outside_attmap() {
        let rel = relation(vec![0, 1]);
        let mut row = RowImage::from_json(&[json!(1), json!("b"), json!(null)]);
        row.normalize(&rel).unwrap();
        assert_eq!(row.changed, vec![true, true, false]);

        let local = RowImage::from_json(&[json!(1), json!("a"), json!("mine")]);
        let merged = row.merge_onto(&local);
        assert_eq!(merged.get(1), Some(&json!("b")));
        assert_eq!(merged.get(2), Some(&json!("mine")));
    }

    #[test]
    fn test_key_with_null_is_none() {
        let row = RowImage::from_json(&[json!(1), json!(null)]);
        assert!(row.key(&[0]).is_some());
        assert!(row.key(&[0, 1]).is_none());
    }
}
