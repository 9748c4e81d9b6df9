use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::backend::{Backend, CollectiveArgs, GroupHandle};
use crate::tensor::{DType, ReduceOp, Tensor};
use crate::trace::OpRecord;

/// Split-rewriting policy applied to `all_to_allv` ops during warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalancePolicy {
    /// Every rank sends equal shares to every peer.
    Equal,
}

impl RebalancePolicy {
    /// Parses the CLI flag value. Unrecognized names are ignored with a
    /// warning so a typo degrades to "no rebalancing" rather than aborting.
    pub fn from_flag(name: &str) -> Option<RebalancePolicy> {
        match name.to_ascii_lowercase().as_str() {
            "" => None,
            "equal" => Some(RebalancePolicy::Equal),
            other => {
                warn!("unsupported rebalance policy `{other}`, ignoring");
                None
            }
        }
    }
}

/// Rewrites one op's splits in place.
///
/// Every rank must end up with the same sizes even when the recorded
/// `in_msg_size` differs per rank, so the agreement value comes from a
/// cross-rank `all_reduce(max)` before being rounded down to a multiple of
/// `world * world` (each of the `world` equal splits must itself divide by
/// `world`).
pub async fn rebalance_split(
    policy: RebalancePolicy,
    backend: &dyn Backend,
    group: GroupHandle,
    op: &mut OpRecord,
) -> Result<()> {
    match policy {
        RebalancePolicy::Equal => {
            let world = u64::from(backend.group_size(group));
            let input = Tensor::filled(DType::Long, 1, op.in_msg_elems.unwrap_or(0) as f64);
            let mut output = Tensor::zeros(DType::Long, 1);
            let args = CollectiveArgs {
                input: &input,
                output: &mut output,
                group,
                async_op: false,
                reduce_op: ReduceOp::Max,
                root: 0,
                in_split: &[],
                out_split: &[],
                peer: None,
            };
            backend
                .all_reduce(args)
                .await
                .context("rebalance agreement reduction")?;

            let agreed = output.get(0) as u64;
            let agreed = agreed - agreed % (world * world);
            op.in_msg_elems = Some(agreed / world);
            op.out_msg_elems = op.in_msg_elems;
            op.in_split = vec![agreed / (world * world); world as usize];
            op.out_split = op.in_split.clone();
            debug!(seq = op.seq, agreed, "rebalanced all_to_allv splits");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{Fabric, LoopbackBackend};
    use crate::trace::OpKind;

    fn a2av(in_elems: u64) -> OpRecord {
        OpRecord {
            kind: OpKind::AllToAllv,
            seq: 0,
            req_id: None,
            start_time_ns: None,
            marker_stack: Vec::new(),
            in_msg_elems: Some(in_elems),
            out_msg_elems: Some(in_elems),
            in_split: Vec::new(),
            out_split: Vec::new(),
            dtype: Some(DType::Int),
            world_size: Some(2),
            pg_id: None,
            group_ranks: Vec::new(),
            root: None,
            exec_id: None,
        }
    }

    #[test]
    fn unknown_policies_are_ignored() {
        assert_eq!(RebalancePolicy::from_flag(""), None);
        assert_eq!(RebalancePolicy::from_flag("Equal"), Some(RebalancePolicy::Equal));
        assert_eq!(RebalancePolicy::from_flag("zipf"), None);
    }

    #[tokio::test]
    async fn ranks_converge_on_the_max_recorded_size() {
        let fabric = Fabric::new(2);
        let mut tasks = Vec::new();
        // Rank 0 recorded 100 elements, rank 1 recorded 61. Agreement is
        // max(100, 61) = 100, rounded down to a multiple of 4 -> 100.
        for (rank, recorded) in [(0u32, 100u64), (1, 61)] {
            let backend = Arc::new(LoopbackBackend::new(fabric.clone(), rank));
            tasks.push(tokio::spawn(async move {
                let mut op = a2av(recorded);
                let group = backend.default_group();
                rebalance_split(RebalancePolicy::Equal, backend.as_ref(), group, &mut op)
                    .await
                    .unwrap();
                op
            }));
        }
        for task in tasks {
            let op = task.await.unwrap();
            assert_eq!(op.in_msg_elems, Some(50));
            assert_eq!(op.out_msg_elems, Some(50));
            assert_eq!(op.in_split, vec![25, 25]);
            assert_eq!(op.out_split, vec![25, 25]);
        }
    }
}
