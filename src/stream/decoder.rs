use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::types::{ChangeOperation, StreamMessage};
use crate::apply::relation::{Relation, RelationId};
use crate::apply::row::{OriginId, RowImage, TransactionId};
use crate::{Error, Result};

/// A stream message with relation ids resolved and transaction framing
/// checked.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Relation(Arc<Relation>),
    Begin {
        xid: TransactionId,
        origin: OriginId,
        commit_time: Option<DateTime<Utc>>,
    },
    Change {
        op: ChangeOperation,
        relation: Arc<Relation>,
        old: Option<RowImage>,
        new: Option<RowImage>,
    },
    Commit {
        lsn: String,
    },
}

/// Decodes JSON-lines replication streams.
///
/// Keeps the relation cache and the currently open transaction, the way a
/// logical decoding client tracks `RELATION` and `BEGIN` messages.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    relations: HashMap<RelationId, Arc<Relation>>,
    current_xid: Option<TransactionId>,
    line: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: RelationId) -> Option<&Arc<Relation>> {
        self.relations.get(&id)
    }

    /// Known relations ordered by id.
    pub fn relations(&self) -> Vec<Arc<Relation>> {
        let mut relations: Vec<_> = self.relations.values().cloned().collect();
        relations.sort_by_key(|r| r.id);
        relations
    }

    pub fn in_transaction(&self) -> bool {
        self.current_xid.is_some()
    }

    /// Forgets the open transaction after it was rolled back.
    pub fn reset_transaction(&mut self) {
        self.current_xid = None;
    }

    /// Decodes one line. Blank lines and `#` comments yield `None`.
    pub fn decode_line(&mut self, line: &str) -> Result<Option<DecodedMessage>> {
        self.line += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let message: StreamMessage = serde_json::from_str(line).map_err(|e| Error::InvalidMessage {
            message: format!("line {}: {}", self.line, e),
        })?;
        self.decode(message).map(Some)
    }

    pub fn decode(&mut self, message: StreamMessage) -> Result<DecodedMessage> {
        match message {
            StreamMessage::Relation { relation } => self.decode_relation(relation),
            StreamMessage::Begin {
                xid,
                origin,
                commit_time,
            } => {
                if let Some(open) = self.current_xid {
                    return Err(self.invalid(format!(
                        "BEGIN of {} while transaction {} is open",
                        xid, open
                    )));
                }
                self.current_xid = Some(xid);
                trace!("BEGIN: xid={}, origin={}", xid, origin);
                Ok(DecodedMessage::Begin {
                    xid,
                    origin,
                    commit_time,
                })
            }
            StreamMessage::Commit { lsn } => {
                let Some(xid) = self.current_xid.take() else {
                    return Err(self.invalid("COMMIT without BEGIN".to_string()));
                };
                trace!("COMMIT: xid={}, lsn={}", xid, lsn);
                Ok(DecodedMessage::Commit { lsn })
            }
            StreamMessage::Insert { relation, new } => {
                self.decode_change(ChangeOperation::Insert, relation, None, Some(new.into()))
            }
            StreamMessage::Update { relation, old, new } => self.decode_change(
                ChangeOperation::Update,
                relation,
                old.map(Into::into),
                Some(new.into()),
            ),
            StreamMessage::Delete { relation, old } => {
                self.decode_change(ChangeOperation::Delete, relation, Some(old.into()), None)
            }
        }
    }

    fn decode_relation(&mut self, mut relation: Relation) -> Result<DecodedMessage> {
        let natts = relation.natts();
        // no attribute map means every column is sent
        if relation.attmap.is_empty() {
            relation.attmap = (0..natts).collect();
        }

        if let Some(col) = relation.attmap.iter().find(|&&c| c >= natts) {
            return Err(self.invalid(format!(
                "relation {} maps column {} but has {} columns",
                relation.qualified_name(),
                col,
                natts
            )));
        }
        for index in &relation.indexes {
            if index.columns.iter().any(|&c| c >= natts) {
                return Err(self.invalid(format!(
                    "index {} of relation {} covers a column outside the relation",
                    index.name,
                    relation.qualified_name()
                )));
            }
        }
        if let Some(id) = relation.replica_identity {
            if relation.index(id).is_none() {
                return Err(self.invalid(format!(
                    "relation {} names unknown replica identity index {}",
                    relation.qualified_name(),
                    id
                )));
            }
        }

        debug!(
            relation_id = relation.id,
            relation = %relation.qualified_name(),
            columns = natts,
            "Relation received"
        );

        let relation = Arc::new(relation);
        self.relations.insert(relation.id, relation.clone());
        Ok(DecodedMessage::Relation(relation))
    }

    fn decode_change(
        &mut self,
        op: ChangeOperation,
        relation: RelationId,
        old: Option<RowImage>,
        new: Option<RowImage>,
    ) -> Result<DecodedMessage> {
        if self.current_xid.is_none() {
            return Err(self.invalid(format!("{:?} outside of a transaction", op)));
        }

        let relation = self.relations.get(&relation).cloned().ok_or_else(|| Error::UnknownRelation {
            name: format!("relation id {}", relation),
        })?;

        Ok(DecodedMessage::Change { op, relation, old, new })
    }

    fn invalid(&self, message: String) -> Error {
        Error::InvalidMessage {
            message: format!("line {}: {}", self.line, message),
        }
    }
}
