use tracing::{debug, info, warn};

use super::{ConflictLogLevel, ConflictReport, ConflictReporter};

/// Logs every conflict through `tracing` and optionally keeps them.
#[derive(Debug, Clone, Default)]
pub struct ConflictLogger {
    level: ConflictLogLevel,
    keep_history: bool,
    history: Vec<ConflictReport>,
    count: u64,
}

impl ConflictLogger {
    pub fn new(level: ConflictLogLevel, keep_history: bool) -> Self {
        Self {
            level,
            keep_history,
            history: Vec::new(),
            count: 0,
        }
    }

    /// Reports kept so far; empty unless history is enabled.
    pub fn history(&self) -> &[ConflictReport] {
        &self.history
    }

    /// Number of conflicts reported, kept or not.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl ConflictReporter for ConflictLogger {
    fn report(&mut self, report: &ConflictReport) {
        self.count += 1;

        let index = report.index.as_deref().unwrap_or("none");
        let local_origin = report.local_origin.map(|o| o.origin);
        let local_commit_ts = report.local_origin.and_then(|o| o.commit_ts);

        macro_rules! emit {
            ($level:ident) => {
                $level!(
                    kind = %report.kind,
                    relation = %report.relation,
                    index = %index,
                    resolution = %report.resolution,
                    local_xid = ?report.local_xid,
                    local_origin = ?local_origin,
                    local_commit_ts = ?local_commit_ts,
                    remote_origin = report.remote_origin,
                    has_before_triggers = report.has_before_triggers,
                    "CONFLICT: remote {} on relation {} (local index {}). Resolution: {}",
                    report.kind,
                    report.relation,
                    index,
                    report.resolution
                )
            };
        }

        match self.level {
            ConflictLogLevel::Debug => emit!(debug),
            ConflictLogLevel::Info => emit!(info),
            ConflictLogLevel::Warn => emit!(warn),
        }

        if self.keep_history {
            self.history.push(report.clone());
        }
    }
}
