//! Replays a recorded replication stream against an in-memory database.
//!
//! This is the outer apply loop: it frames transactions, hands every change
//! to the [`HeapApplier`] and rolls the database back when a transaction
//! fails.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::apply::heap::{ApplyOutcome, HeapApplier};
use crate::apply::relation::Relation;
use crate::apply::row::{RowImage, TransactionId};
use crate::memory::MemoryDatabase;
use crate::stream::{ChangeOperation, DecodedMessage, StreamDecoder};
use crate::{Config, Error, Result};

/// Counters for one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub messages: u64,
    pub transactions: u64,
    pub committed: u64,
    pub aborted: u64,
    pub inserted: u64,
    pub buffered: u64,
    pub updated: u64,
    pub deleted: u64,
    pub suppressed: u64,
    /// Conflicts by kind, e.g. `insert_exists`.
    pub conflicts: BTreeMap<String, u64>,
    pub last_lsn: Option<String>,
}

impl ReplayStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Buffered => self.buffered += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Suppressed => self.suppressed += 1,
            ApplyOutcome::ConflictApplied { kind, .. }
            | ApplyOutcome::ConflictSkipped { kind, .. } => {
                *self.conflicts.entry(kind.to_string()).or_default() += 1;
            }
        }
    }

    pub fn total_conflicts(&self) -> u64 {
        self.conflicts.values().sum()
    }
}

#[derive(Debug)]
pub struct Replayer {
    db: MemoryDatabase,
    applier: HeapApplier,
    decoder: StreamDecoder,
    stats: ReplayStats,
    open_xid: Option<TransactionId>,
}

impl Replayer {
    pub fn new(config: &Config) -> Self {
        Self::with_database(config, MemoryDatabase::new(config))
    }

    /// Replays into a prepared database, e.g. one holding local rows.
    pub fn with_database(config: &Config, db: MemoryDatabase) -> Self {
        Self {
            db,
            applier: HeapApplier::new(config),
            decoder: StreamDecoder::new(),
            stats: ReplayStats::default(),
            open_xid: None,
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn database_mut(&mut self) -> &mut MemoryDatabase {
        &mut self.db
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn relations(&self) -> Vec<Arc<Relation>> {
        self.decoder.relations()
    }

    /// Reads JSON lines until end of input. A failed transaction is rolled
    /// back and its error returned; everything committed before it stays.
    pub fn run<R: BufRead>(&mut self, reader: R) -> Result<&ReplayStats> {
        info!("Starting replay");

        for line in reader.lines() {
            let line = line?;
            if let Err(e) = self.process_line(&line) {
                error!(error = %e, class = ?e.class(), "Replay failed");
                self.abort_transaction();
                return Err(e);
            }
        }

        if self.open_xid.is_some() {
            warn!("Stream ended inside a transaction, rolling it back");
            self.abort_transaction();
        }

        info!(
            committed = self.stats.committed,
            aborted = self.stats.aborted,
            conflicts = self.stats.total_conflicts(),
            "Replay finished"
        );
        Ok(&self.stats)
    }

    pub fn process_line(&mut self, line: &str) -> Result<()> {
        match self.decoder.decode_line(line)? {
            Some(message) => self.apply(message),
            None => Ok(()),
        }
    }

    fn apply(&mut self, message: DecodedMessage) -> Result<()> {
        self.stats.messages += 1;

        match message {
            DecodedMessage::Relation(relation) => {
                debug!(relation = %relation.qualified_name(), "Registered relation");
                Ok(())
            }
            DecodedMessage::Begin {
                xid,
                origin,
                commit_time,
            } => {
                self.stats.transactions += 1;
                self.open_xid = Some(xid);
                self.db.session.begin(xid, origin, commit_time);
                self.db.storage.begin();
                self.applier.begin(&mut self.db.hooks())
            }
            DecodedMessage::Change {
                op,
                relation,
                old,
                new,
            } => self.apply_change(op, &relation, old, new),
            DecodedMessage::Commit { lsn } => {
                self.applier.commit(&mut self.db.hooks())?;
                self.db.storage.commit();
                self.db.session.commit();
                let xid = self.open_xid.take();

                debug!(lsn = %lsn, xid = ?xid, "Committed remote transaction");
                self.stats.committed += 1;
                self.stats.last_lsn = Some(lsn);
                Ok(())
            }
        }
    }

    fn apply_change(
        &mut self,
        op: ChangeOperation,
        relation: &Arc<Relation>,
        old: Option<RowImage>,
        new: Option<RowImage>,
    ) -> Result<()> {
        let missing = |what: &str| Error::InvalidMessage {
            message: format!("{:?} on {} without {} row", op, relation.qualified_name(), what),
        };

        let outcome = match op {
            ChangeOperation::Insert => {
                let new = new.ok_or_else(|| missing("new"))?;
                if self.applier.can_multi_insert(relation) {
                    self.applier.multi_insert_add(&mut self.db.hooks(), relation, new)?
                } else {
                    self.applier.insert(&mut self.db.hooks(), relation, new)?
                }
            }
            ChangeOperation::Update => {
                let new = new.ok_or_else(|| missing("new"))?;
                // without an old key the key did not change
                let old = old.unwrap_or_else(|| new.clone());
                self.applier.update(&mut self.db.hooks(), relation, &old, new)?
            }
            ChangeOperation::Delete => {
                let old = old.ok_or_else(|| missing("old"))?;
                self.applier.delete(&mut self.db.hooks(), relation, &old)?
            }
        };

        self.stats.record(outcome);
        Ok(())
    }

    fn abort_transaction(&mut self) {
        self.applier.abort(&mut self.db.hooks());
        self.db.storage.rollback();
        self.decoder.reset_transaction();
        if let Some(xid) = self.open_xid.take() {
            warn!(xid, "Rolled back remote transaction");
            self.stats.aborted += 1;
        }
    }

    /// Current contents of every known relation as JSON, keyed by qualified
    /// name.
    pub fn dump(&self) -> serde_json::Value {
        let mut tables = serde_json::Map::new();
        for relation in self.decoder.relations() {
            let rows: Vec<serde_json::Value> = self
                .db
                .storage
                .rows(relation.id)
                .iter()
                .map(|row| {
                    serde_json::Value::Array(
                        row.image
                            .to_options()
                            .into_iter()
                            .map(Option::unwrap_or_default)
                            .collect(),
                    )
                })
                .collect();
            tables.insert(relation.qualified_name(), serde_json::Value::Array(rows));
        }
        serde_json::Value::Object(tables)
    }
}
