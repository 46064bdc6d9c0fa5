//! In-process implementations of the apply collaborators.
//!
//! [`MemoryDatabase`] bundles them into one database an applier can run
//! against; the replay tool and the tests use it.

pub mod constraints;
pub mod session;
pub mod storage;
pub mod triggers;

pub use constraints::NotNullChecker;
pub use session::MemorySession;
pub use storage::{MemoryStorage, StorageStats};
pub use triggers::{RecordingTriggers, TriggerEvent, TriggerOp, TriggerTiming};

use crate::apply::hooks::ApplyHooks;
use crate::apply::lookup::IndexLookup;
use crate::conflict::{ConflictLogger, PolicyResolver};
use crate::Config;

#[derive(Debug)]
pub struct MemoryDatabase {
    pub storage: MemoryStorage,
    pub session: MemorySession,
    pub triggers: RecordingTriggers,
    pub constraints: NotNullChecker,
    pub lookup: IndexLookup,
    pub resolver: PolicyResolver,
    pub reporter: ConflictLogger,
}

impl MemoryDatabase {
    pub fn new(config: &Config) -> Self {
        Self {
            storage: MemoryStorage::new()
                .with_commit_timestamps(config.replay.track_commit_timestamp),
            session: MemorySession::new(config.replay.node_origin),
            triggers: RecordingTriggers::new(),
            constraints: NotNullChecker,
            lookup: IndexLookup,
            resolver: PolicyResolver::new(config.conflicts.resolver),
            reporter: ConflictLogger::new(
                config.conflicts.log_level,
                config.conflicts.keep_history,
            ),
        }
    }

    pub fn with_triggers(mut self, triggers: RecordingTriggers) -> Self {
        self.triggers = triggers;
        self
    }

    /// Borrows every collaborator for one apply call.
    pub fn hooks(&mut self) -> ApplyHooks<'_> {
        ApplyHooks {
            storage: &mut self.storage,
            lookup: &self.lookup,
            triggers: &mut self.triggers,
            constraints: &self.constraints,
            resolver: &self.resolver,
            reporter: &mut self.reporter,
            txn: &mut self.session,
        }
    }
}
