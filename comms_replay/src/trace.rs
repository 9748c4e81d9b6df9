use serde::Deserialize;

use crate::error::ReplayError;
use crate::store::BlobStore;
use crate::tensor::DType;

/// Canonical collective kinds understood by the replay engine.
///
/// Trace producers disagree on spelling; [`OpKind::parse`] folds the known
/// aliases into these canonical names. Anything unrecognized becomes
/// [`OpKind::Unknown`] and is skipped (with a warning) at replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    AllReduce,
    Reduce,
    AllGather,
    AllGatherBase,
    Gather,
    Scatter,
    ReduceScatter,
    ReduceScatterBase,
    Broadcast,
    AllToAll,
    AllToAllv,
    Send,
    Recv,
    Isend,
    Irecv,
    Wait,
    Barrier,
    Init,
    Unknown,
}

impl OpKind {
    pub const ALL: [OpKind; 18] = [
        OpKind::AllReduce,
        OpKind::Reduce,
        OpKind::AllGather,
        OpKind::AllGatherBase,
        OpKind::Gather,
        OpKind::Scatter,
        OpKind::ReduceScatter,
        OpKind::ReduceScatterBase,
        OpKind::Broadcast,
        OpKind::AllToAll,
        OpKind::AllToAllv,
        OpKind::Send,
        OpKind::Recv,
        OpKind::Isend,
        OpKind::Irecv,
        OpKind::Wait,
        OpKind::Barrier,
        OpKind::Init,
    ];

    pub fn parse(name: &str) -> OpKind {
        match name.to_ascii_lowercase().as_str() {
            "all_reduce" | "allreduce" => OpKind::AllReduce,
            "reduce" => OpKind::Reduce,
            "all_gather" | "allgather" => OpKind::AllGather,
            "all_gather_base" | "allgatherbase" | "_allgather_base" => OpKind::AllGatherBase,
            "gather" => OpKind::Gather,
            "scatter" => OpKind::Scatter,
            "reduce_scatter" | "reducescatter" => OpKind::ReduceScatter,
            "reduce_scatter_base" | "reducescatterbase" | "_reduce_scatter_base" => {
                OpKind::ReduceScatterBase
            }
            "broadcast" | "bcast" => OpKind::Broadcast,
            "all_to_all" | "alltoall" | "all2all" => OpKind::AllToAll,
            "all_to_allv" | "alltoallv" | "all2allv" | "all_to_all_v" => OpKind::AllToAllv,
            "send" => OpKind::Send,
            "recv" | "recvanysource" => OpKind::Recv,
            "isend" => OpKind::Isend,
            "irecv" => OpKind::Irecv,
            "wait" => OpKind::Wait,
            "barrier" => OpKind::Barrier,
            "init" => OpKind::Init,
            _ => OpKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::AllReduce => "all_reduce",
            OpKind::Reduce => "reduce",
            OpKind::AllGather => "all_gather",
            OpKind::AllGatherBase => "all_gather_base",
            OpKind::Gather => "gather",
            OpKind::Scatter => "scatter",
            OpKind::ReduceScatter => "reduce_scatter",
            OpKind::ReduceScatterBase => "reduce_scatter_base",
            OpKind::Broadcast => "broadcast",
            OpKind::AllToAll => "all_to_all",
            OpKind::AllToAllv => "all_to_allv",
            OpKind::Send => "send",
            OpKind::Recv => "recv",
            OpKind::Isend => "isend",
            OpKind::Irecv => "irecv",
            OpKind::Wait => "wait",
            OpKind::Barrier => "barrier",
            OpKind::Init => "init",
            OpKind::Unknown => "unknown",
        }
    }

    /// Control records carry no message sizes or dtype.
    pub fn is_control(&self) -> bool {
        matches!(self, OpKind::Wait | OpKind::Barrier | OpKind::Init)
    }

    /// Point-to-point kinds address a single peer rather than a group.
    pub fn is_point_to_point(&self) -> bool {
        matches!(
            self,
            OpKind::Send | OpKind::Recv | OpKind::Isend | OpKind::Irecv
        )
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trace entry as found on the wire. Field names follow the capture
/// format; everything except `comms` is optional at this stage.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    pub comms: String,
    #[serde(default)]
    pub seqnum: Option<u64>,
    #[serde(default)]
    pub req: Option<u64>,
    #[serde(default, rename = "startTime_ns")]
    pub start_time_ns: Option<u64>,
    #[serde(default)]
    pub markers: Option<Vec<String>>,
    #[serde(default)]
    pub world_size: Option<u32>,
    #[serde(default)]
    pub root: Option<u32>,
    #[serde(default)]
    pub pg_id: Option<u32>,
    #[serde(default)]
    pub global_ranks: Option<Vec<u32>>,
    #[serde(default)]
    pub in_msg_size: Option<u64>,
    #[serde(default)]
    pub out_msg_size: Option<u64>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub in_split: Option<Vec<u64>>,
    #[serde(default)]
    pub out_split: Option<Vec<u64>>,
    #[serde(default)]
    pub eg_id: Option<u64>,
}

/// Canonical operation record: what the scheduler replays.
///
/// All size fields count elements, not bytes. `seq` is densely assigned in
/// trace order during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub kind: OpKind,
    pub seq: usize,
    pub req_id: Option<u64>,
    pub start_time_ns: Option<u64>,
    pub marker_stack: Vec<String>,
    pub in_msg_elems: Option<u64>,
    pub out_msg_elems: Option<u64>,
    pub in_split: Vec<u64>,
    pub out_split: Vec<u64>,
    pub dtype: Option<DType>,
    pub world_size: Option<u32>,
    pub pg_id: Option<u32>,
    pub group_ranks: Vec<u32>,
    pub root: Option<u32>,
    pub exec_id: Option<u64>,
}

/// Converts raw records to canonical [`OpRecord`]s, assigning dense `seq`
/// ordinals and validating that every non-control record carries the fields
/// replay needs.
pub fn normalize(raw: Vec<RawRecord>) -> Result<Vec<OpRecord>, ReplayError> {
    let mut out = Vec::with_capacity(raw.len());
    for (seq, rec) in raw.into_iter().enumerate() {
        let kind = OpKind::parse(&rec.comms);

        if let Some(recorded) = rec.seqnum {
            if recorded != seq as u64 {
                return Err(ReplayError::BadTraceFormat {
                    seq,
                    reason: format!("recorded seqnum {recorded} does not match position {seq}"),
                });
            }
        }

        let mut dtype = None;
        if !kind.is_control() && kind != OpKind::Unknown {
            if rec.in_msg_size.is_none() || rec.out_msg_size.is_none() {
                return Err(ReplayError::BadTraceFormat {
                    seq,
                    reason: format!("{kind} record is missing in_msg_size/out_msg_size"),
                });
            }
            let tag = rec.dtype.as_deref().ok_or_else(|| ReplayError::BadTraceFormat {
                seq,
                reason: format!("{kind} record is missing dtype"),
            })?;
            dtype = Some(DType::parse(tag).ok_or_else(|| ReplayError::BadTraceFormat {
                seq,
                reason: format!("unsupported dtype tag `{tag}`"),
            })?);
        }

        if kind == OpKind::Init && (rec.pg_id.is_none() || rec.global_ranks.is_none()) {
            return Err(ReplayError::BadTraceFormat {
                seq,
                reason: "init record is missing pg_id/global_ranks".to_owned(),
            });
        }

        out.push(OpRecord {
            kind,
            seq,
            req_id: rec.req,
            start_time_ns: rec.start_time_ns,
            marker_stack: rec.markers.unwrap_or_default(),
            in_msg_elems: rec.in_msg_size,
            out_msg_elems: rec.out_msg_size,
            in_split: rec.in_split.unwrap_or_default(),
            out_split: rec.out_split.unwrap_or_default(),
            dtype,
            world_size: rec.world_size,
            pg_id: rec.pg_id,
            group_ranks: rec.global_ranks.unwrap_or_default(),
            root: rec.root,
            exec_id: rec.eg_id,
        });
    }
    Ok(out)
}

/// Reads and normalizes a trace from `location` through the given store.
pub async fn load_trace(
    store: &dyn BlobStore,
    location: &str,
) -> Result<Vec<OpRecord>, ReplayError> {
    let bytes = store.read(location).await.map_err(|err| {
        ReplayError::InvalidConfiguration(format!("cannot read trace `{location}`: {err:#}"))
    })?;
    let raw: Vec<RawRecord> = serde_json::from_slice(&bytes)?;
    normalize(raw)
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw(json: &str) -> Vec<RawRecord> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn kind_aliases_fold_to_canonical_names() {
        assert_eq!(OpKind::parse("AllReduce"), OpKind::AllReduce);
        assert_eq!(OpKind::parse("alltoallv"), OpKind::AllToAllv);
        assert_eq!(OpKind::parse("all2allv"), OpKind::AllToAllv);
        assert_eq!(OpKind::parse("bcast"), OpKind::Broadcast);
        assert_eq!(OpKind::parse("recvAnySource"), OpKind::Recv);
        assert_eq!(OpKind::parse("exotic_op"), OpKind::Unknown);
    }

    #[test]
    fn normalization_is_total_and_assigns_dense_seq() {
        let records = raw(
            r#"[
                {"comms": "all_reduce", "in_msg_size": 64, "out_msg_size": 64, "dtype": "Int"},
                {"comms": "wait", "req": 3},
                {"comms": "exotic_op"},
                {"comms": "barrier"}
            ]"#,
        );
        let trace = normalize(records).unwrap();
        assert_eq!(trace.len(), 4);
        assert_eq!(
            trace.iter().map(|op| op.seq).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(trace[0].dtype, Some(DType::Int));
        assert_eq!(trace[1].req_id, Some(3));
        assert_eq!(trace[2].kind, OpKind::Unknown);
    }

    #[test]
    fn missing_sizes_on_a_collective_are_rejected() {
        let records = raw(r#"[{"comms": "all_gather", "dtype": "Float"}]"#);
        let err = normalize(records).unwrap_err();
        assert!(matches!(err, ReplayError::BadTraceFormat { seq: 0, .. }));
    }

    #[test]
    fn init_requires_group_membership() {
        let records = raw(r#"[{"comms": "init", "pg_id": 1}]"#);
        assert!(matches!(
            normalize(records),
            Err(ReplayError::BadTraceFormat { seq: 0, .. })
        ));
    }

    #[test]
    fn inconsistent_recorded_seqnum_is_rejected() {
        let records = raw(
            r#"[
                {"comms": "barrier", "seqnum": 0},
                {"comms": "barrier", "seqnum": 5}
            ]"#,
        );
        assert!(matches!(
            normalize(records),
            Err(ReplayError::BadTraceFormat { seq: 1, .. })
        ));
    }

    #[test]
    fn splits_and_markers_survive_normalization() {
        let records = raw(
            r#"[{
                "comms": "all_to_allv", "in_msg_size": 8, "out_msg_size": 8,
                "dtype": "Float", "in_split": [4, 4], "out_split": [4, 4],
                "markers": ["fwd", "a2a"], "startTime_ns": 12, "world_size": 2
            }]"#,
        );
        let trace = normalize(records).unwrap();
        assert_eq!(trace[0].in_split, vec![4, 4]);
        assert_eq!(trace[0].marker_stack, vec!["fwd", "a2a"]);
        assert_eq!(trace[0].start_time_ns, Some(12));
    }
}
