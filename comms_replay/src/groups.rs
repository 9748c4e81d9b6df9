use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::backend::{Backend, GroupHandle};
use crate::error::ReplayError;
use crate::trace::{OpKind, OpRecord};

/// Mapping from process-group id to its ordered member ranks, rebuilt from
/// the trace's `init` records. Built once after loading, immutable after.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessGroupTable {
    groups: BTreeMap<u32, Vec<u32>>,
}

impl ProcessGroupTable {
    /// Walks the full trace, collecting `init` records and checking that
    /// every referenced `pg_id` was initialized by an earlier record.
    pub fn from_trace(trace: &[OpRecord]) -> Result<ProcessGroupTable, ReplayError> {
        let mut groups = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for op in trace {
            if op.kind == OpKind::Init {
                let pg_id = op.pg_id.expect("validated during normalization");
                groups.insert(pg_id, op.group_ranks.clone());
                seen.insert(pg_id);
            } else if let Some(pg_id) = op.pg_id {
                if !seen.contains(&pg_id) {
                    return Err(ReplayError::BadTraceFormat {
                        seq: op.seq,
                        reason: format!("pg_id {pg_id} referenced before its init record"),
                    });
                }
            }
        }
        Ok(ProcessGroupTable { groups })
    }

    pub fn get(&self, pg_id: u32) -> Option<&[u32]> {
        self.groups.get(&pg_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> {
        self.groups.iter().map(|(id, ranks)| (*id, ranks.as_slice()))
    }
}

/// Creates every recorded non-default group on the backend.
///
/// A recorded group whose member list matches the whole live world is the
/// default group and needs no creation. A group wider than the live world is
/// discarded under auto-shrink (its ops rebind to the default group at
/// prepare time) and is a configuration error otherwise.
pub async fn create_backend_groups(
    backend: &dyn Backend,
    table: &ProcessGroupTable,
    auto_shrink: bool,
) -> Result<HashMap<u32, GroupHandle>> {
    let world_size = backend.world_size();
    let mut handles = HashMap::new();
    for (pg_id, ranks) in table.iter() {
        if ranks.len() as u32 > world_size {
            if auto_shrink {
                warn!(
                    pg_id,
                    recorded = ranks.len(),
                    live = world_size,
                    "recorded group is wider than the live world, rebinding to default group"
                );
                continue;
            }
            return Err(ReplayError::InvalidConfiguration(format!(
                "pg {pg_id} has {} members but the world holds {world_size} ranks; \
                 rerun with --auto-shrink to rescale",
                ranks.len()
            ))
            .into());
        }
        let handle = if ranks.len() as u32 == world_size {
            backend.default_group()
        } else {
            backend
                .new_group(ranks)
                .await
                .with_context(|| format!("creating pg {pg_id}"))?
        };
        debug!(pg_id, ?ranks, "process group ready");
        handles.insert(pg_id, handle);
    }
    Ok(handles)
}
