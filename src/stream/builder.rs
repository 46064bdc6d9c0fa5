use chrono::{DateTime, Duration, TimeZone, Utc};

use super::types::{StreamMessage, WireRow};
use crate::apply::relation::{Relation, RelationId};
use crate::apply::row::{Datum, OriginId, RowImage, TransactionId};
use crate::Result;

/// Builds replication streams message by message.
///
/// Every `commit` advances the LSN and the commit time by one step, so
/// later transactions always carry later timestamps.
#[derive(Debug, Clone)]
pub struct StreamBuilder {
    messages: Vec<StreamMessage>,
    origin: OriginId,
    commit_time: DateTime<Utc>,
    lsn: u64,
}

impl Default for StreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            origin: 1,
            // 2023-10-15 10:30:00 UTC
            commit_time: Utc.timestamp_opt(1_697_365_800, 0).single().unwrap_or_default(),
            lsn: 1000,
        }
    }

    pub fn with_origin(mut self, origin: OriginId) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_commit_time(mut self, commit_time: DateTime<Utc>) -> Self {
        self.commit_time = commit_time;
        self
    }

    pub fn message(mut self, message: StreamMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn relation(self, relation: &Relation) -> Self {
        self.message(StreamMessage::Relation {
            relation: relation.clone(),
        })
    }

    pub fn begin(self, xid: TransactionId) -> Self {
        let message = StreamMessage::Begin {
            xid,
            origin: self.origin,
            commit_time: Some(self.commit_time),
        };
        self.message(message)
    }

    pub fn commit(mut self) -> Self {
        let lsn = format_lsn(self.lsn);
        self.lsn += 100;
        self.commit_time += Duration::seconds(1);
        self.message(StreamMessage::Commit { lsn })
    }

    pub fn insert(self, relation: RelationId, values: Vec<Datum>) -> Self {
        self.message(StreamMessage::Insert {
            relation,
            new: WireRow::Values(values),
        })
    }

    pub fn update(self, relation: RelationId, old: Option<Vec<Datum>>, new: Vec<Datum>) -> Self {
        self.message(StreamMessage::Update {
            relation,
            old: old.map(WireRow::Values),
            new: WireRow::Values(new),
        })
    }

    /// Update whose new image carries explicit changed flags.
    pub fn update_image(
        self,
        relation: RelationId,
        old: Option<Vec<Datum>>,
        new: RowImage,
    ) -> Self {
        self.message(StreamMessage::Update {
            relation,
            old: old.map(WireRow::Values),
            new: WireRow::Image(new),
        })
    }

    pub fn delete(self, relation: RelationId, old: Vec<Datum>) -> Self {
        self.message(StreamMessage::Delete {
            relation,
            old: WireRow::Values(old),
        })
    }

    pub fn messages(&self) -> &[StreamMessage] {
        &self.messages
    }

    /// Renders the stream as JSON lines.
    pub fn build(&self) -> Result<String> {
        let mut out = String::new();
        for message in &self.messages {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }
        Ok(out)
    }
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFFFFFF)
}
