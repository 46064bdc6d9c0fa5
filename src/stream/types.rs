use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::apply::relation::{Relation, RelationId};
use crate::apply::row::{Datum, OriginId, RowImage, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A row as it appears on the wire: either a plain array of values, where
/// `null` is SQL null and every column counts as changed, or a full image
/// with explicit null and changed flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRow {
    Values(Vec<Datum>),
    Image(RowImage),
}

impl From<WireRow> for RowImage {
    fn from(row: WireRow) -> Self {
        match row {
            WireRow::Values(values) => RowImage::from_json(&values),
            WireRow::Image(image) => image,
        }
    }
}

/// One line of a replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Describes a relation; later changes refer to it by id.
    Relation { relation: Relation },
    Begin {
        xid: TransactionId,
        origin: OriginId,
        #[serde(default)]
        commit_time: Option<DateTime<Utc>>,
    },
    Insert { relation: RelationId, new: WireRow },
    Update {
        relation: RelationId,
        /// Old key; absent when the key did not change.
        #[serde(default)]
        old: Option<WireRow>,
        new: WireRow,
    },
    Delete { relation: RelationId, old: WireRow },
    Commit { lsn: String },
}
