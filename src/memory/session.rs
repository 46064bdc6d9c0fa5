use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::apply::hooks::TransactionContext;
use crate::apply::row::{CommandId, OriginId, TransactionId};
use crate::Result;

/// Local transaction state of an apply session.
#[derive(Debug, Clone)]
pub struct MemorySession {
    xid: TransactionId,
    session_origin: OriginId,
    remote_commit_ts: Option<DateTime<Utc>>,
    command_id: CommandId,
    txn_ts: DateTime<Utc>,
    sequences: HashMap<String, i64>,
    increments: u64,
}

impl MemorySession {
    /// A session applying changes from `origin`, with a first transaction
    /// already open.
    pub fn new(origin: OriginId) -> Self {
        Self {
            xid: 1,
            session_origin: origin,
            remote_commit_ts: None,
            command_id: 0,
            txn_ts: Utc::now(),
            sequences: HashMap::new(),
            increments: 0,
        }
    }

    /// Opens a local transaction for one remote transaction.
    pub fn begin(
        &mut self,
        xid: TransactionId,
        origin: OriginId,
        commit_ts: Option<DateTime<Utc>>,
    ) {
        self.xid = xid;
        self.session_origin = origin;
        self.remote_commit_ts = commit_ts;
        self.command_id = 0;
        self.txn_ts = Utc::now();
    }

    pub fn commit(&mut self) {
        self.command_id = 0;
    }

    /// Number of command counter increments since the session was created.
    pub fn command_increments(&self) -> u64 {
        self.increments
    }
}

impl TransactionContext for MemorySession {
    fn top_xid(&self) -> TransactionId {
        self.xid
    }

    fn session_origin(&self) -> OriginId {
        self.session_origin
    }

    fn remote_commit_ts(&self) -> Option<DateTime<Utc>> {
        self.remote_commit_ts
    }

    fn current_command_id(&self) -> CommandId {
        self.command_id
    }

    fn command_counter_increment(&mut self) {
        self.command_id += 1;
        self.increments += 1;
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<i64> {
        let value = self.sequences.entry(sequence.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    fn transaction_timestamp(&self) -> DateTime<Utc> {
        self.txn_ts
    }
}
