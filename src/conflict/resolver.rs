use std::cmp::Ordering;

use tracing::debug;

use super::{Conflict, ConflictOutcome, ConflictPolicy, ConflictResolver};
use crate::{Error, Result};

/// Resolves conflicts with one fixed policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyResolver {
    policy: ConflictPolicy,
}

impl PolicyResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Orders the local write against the remote one by commit time, then
    /// by origin id when the timestamps are equal.
    ///
    /// A local row without a tracked commit time counts as the oldest.
    fn compare_writes(conflict: &Conflict<'_>) -> Ordering {
        let local_origin = conflict.local.origin;
        let local_ts = local_origin.and_then(|o| o.commit_ts);

        let cmp = match (local_ts, conflict.remote_commit_ts) {
            (Some(local), Some(remote)) => local.cmp(&remote),
            (None, _) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };

        if cmp != Ordering::Equal {
            return cmp;
        }

        debug!("Commit timestamps equal, comparing origin ids");
        let local_id = local_origin.map(|o| o.origin).unwrap_or_default();
        if local_id < conflict.remote_origin {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}

impl ConflictResolver for PolicyResolver {
    fn resolve(&self, conflict: &Conflict<'_>) -> Result<ConflictOutcome> {
        let remote_wins = match self.policy {
            ConflictPolicy::Error => {
                return Err(Error::UnresolvableConflict {
                    kind: conflict.kind,
                    relation: conflict.relation.qualified_name(),
                });
            }
            ConflictPolicy::ApplyRemote => true,
            ConflictPolicy::KeepLocal => false,
            ConflictPolicy::LastUpdateWins => Self::compare_writes(conflict) == Ordering::Less,
            ConflictPolicy::FirstUpdateWins => Self::compare_writes(conflict) == Ordering::Greater,
        };

        if remote_wins {
            Ok(ConflictOutcome::ApplyRemote(conflict.remote.clone()))
        } else {
            Ok(ConflictOutcome::KeepLocal)
        }
    }
}
