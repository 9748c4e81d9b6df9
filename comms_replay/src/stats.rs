use std::collections::{BTreeMap, BTreeSet};

use crate::trace::{OpKind, OpRecord};

/// Six-number summary over a latency or size list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub total: f64,
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Percentile with linear interpolation between order statistics.
/// `sorted` must be ascending and non-empty.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let position = (sorted.len() - 1) as f64 * pct / 100.0;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    if below == above {
        return sorted[below];
    }
    let fraction = position - below as f64;
    sorted[below] + (sorted[above] - sorted[below]) * fraction
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("latencies and sizes are finite"));
    let total: f64 = sorted.iter().sum();
    Some(Summary {
        total,
        max: *sorted.last().unwrap(),
        min: sorted[0],
        mean: total / sorted.len() as f64,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
    })
}

/// One op's membership in a marker block. Latency is filled during replay;
/// dry-run entries stay size-only.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEntry {
    pub kind: OpKind,
    pub in_msg_elems: Option<u64>,
    pub out_msg_elems: Option<u64>,
    pub latency_us: Option<f64>,
}

/// Per-kind and per-block accounting for one rank's replay.
///
/// `BTreeMap` keys keep report iteration order deterministic, so two dry
/// runs over the same trace print identical output.
#[derive(Debug, Default)]
pub struct TraceStats {
    pub coll_in_sizes: BTreeMap<OpKind, Vec<u64>>,
    pub coll_in_unique: BTreeMap<OpKind, BTreeSet<u64>>,
    pub coll_out_sizes: BTreeMap<OpKind, Vec<u64>>,
    pub coll_out_unique: BTreeMap<OpKind, BTreeSet<u64>>,
    pub coll_lat_us: BTreeMap<OpKind, Vec<f64>>,
    pub blocks: BTreeMap<String, Vec<BlockEntry>>,
    pub batch_lat_ms: Vec<f64>,
}

impl TraceStats {
    /// First read-through of the trace: size histograms per kind and block
    /// membership, bounded by `max_ops`. In dry-run mode block entries are
    /// recorded here since no replay will follow.
    pub fn collect(trace: &[OpRecord], max_ops: usize, dry_run: bool) -> TraceStats {
        let mut stats = TraceStats::default();
        for op in &trace[..max_ops.min(trace.len())] {
            if op.kind == OpKind::Unknown {
                continue;
            }
            stats.coll_lat_us.entry(op.kind).or_default();
            if let (Some(in_elems), Some(out_elems)) = (op.in_msg_elems, op.out_msg_elems) {
                stats.coll_in_sizes.entry(op.kind).or_default().push(in_elems);
                stats.coll_in_unique.entry(op.kind).or_default().insert(in_elems);
                stats
                    .coll_out_sizes
                    .entry(op.kind)
                    .or_default()
                    .push(out_elems);
                stats
                    .coll_out_unique
                    .entry(op.kind)
                    .or_default()
                    .insert(out_elems);
            }
            for marker in &op.marker_stack {
                let block = stats.blocks.entry(marker.clone()).or_default();
                if dry_run {
                    block.push(BlockEntry {
                        kind: op.kind,
                        in_msg_elems: op.in_msg_elems,
                        out_msg_elems: op.out_msg_elems,
                        latency_us: None,
                    });
                }
            }
        }
        stats
    }

    pub fn record_latency(&mut self, kind: OpKind, latency_us: f64) {
        self.coll_lat_us.entry(kind).or_default().push(latency_us);
    }

    pub fn record_block(&mut self, marker: &str, entry: BlockEntry) {
        self.blocks.entry(marker.to_owned()).or_default().push(entry);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::{RawRecord, normalize};

    fn trace(json: &str) -> Vec<OpRecord> {
        let raw: Vec<RawRecord> = serde_json::from_str(json).unwrap();
        normalize(raw).unwrap()
    }

    #[test]
    fn summary_matches_interpolated_percentiles() {
        let summary = summarize(&[10.0, 20.0, 30.0]).unwrap();
        assert_eq!(summary.total, 60.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.mean, 20.0);
        assert_eq!(summary.p50, 20.0);
        assert!((summary.p95 - 29.0).abs() < 1e-9);
    }

    #[test]
    fn collect_buckets_sizes_by_kind_and_skips_controls() {
        let trace = trace(
            r#"[
                {"comms": "all_to_allv", "in_msg_size": 10, "out_msg_size": 10, "dtype": "Int"},
                {"comms": "all_to_allv", "in_msg_size": 20, "out_msg_size": 20, "dtype": "Int"},
                {"comms": "all_to_allv", "in_msg_size": 20, "out_msg_size": 20, "dtype": "Int"},
                {"comms": "wait"},
                {"comms": "exotic_op"}
            ]"#,
        );
        let stats = TraceStats::collect(&trace, trace.len(), false);
        assert_eq!(stats.coll_in_sizes[&OpKind::AllToAllv], vec![10, 20, 20]);
        assert_eq!(stats.coll_in_unique[&OpKind::AllToAllv].len(), 2);
        assert!(stats.coll_lat_us.contains_key(&OpKind::Wait));
        assert!(!stats.coll_in_sizes.contains_key(&OpKind::Wait));
        assert!(!stats.coll_lat_us.contains_key(&OpKind::Unknown));
    }

    #[test]
    fn max_ops_bounds_the_sweep() {
        let trace = trace(
            r#"[
                {"comms": "all_reduce", "in_msg_size": 1, "out_msg_size": 1, "dtype": "Int"},
                {"comms": "all_reduce", "in_msg_size": 2, "out_msg_size": 2, "dtype": "Int"}
            ]"#,
        );
        let stats = TraceStats::collect(&trace, 1, false);
        assert_eq!(stats.coll_in_sizes[&OpKind::AllReduce], vec![1]);
    }

    #[test]
    fn dry_run_records_size_only_block_entries() {
        let trace = trace(
            r#"[{
                "comms": "all_reduce", "in_msg_size": 8, "out_msg_size": 8,
                "dtype": "Float", "markers": ["fwd"]
            }]"#,
        );
        let stats = TraceStats::collect(&trace, 1, true);
        let entries = &stats.blocks["fwd"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].latency_us, None);
        assert_eq!(entries[0].in_msg_elems, Some(8));
    }
}
