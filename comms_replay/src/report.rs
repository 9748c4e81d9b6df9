use std::io::{self, Write};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ReplayError;
use crate::stats::{Summary, TraceStats, summarize};
use crate::store;
use crate::tensor::DType;
use crate::trace::OpRecord;

/// One replayed op in the output trace: the input record's fields plus the
/// measured timings. Quant/dequant timers are kept for format compatibility
/// and stay zero while quantization is not wired in.
#[derive(Debug, Clone, Serialize)]
pub struct AugmentedRecord {
    pub comms: &'static str,
    pub seqnum: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req: Option<u64>,
    #[serde(rename = "startTime_ns", skip_serializing_if = "Option::is_none")]
    pub start_time_ns: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_msg_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_msg_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub in_split: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub out_split: Vec<u64>,
    pub marker_stack: String,
    pub quant_us: f64,
    pub dequant_us: f64,
    pub latency_us: f64,
    pub global_latency_us: f64,
}

impl AugmentedRecord {
    pub fn new(
        op: &OpRecord,
        marker_stack: String,
        latency_us: f64,
        global_latency_us: f64,
    ) -> AugmentedRecord {
        AugmentedRecord {
            comms: op.kind.as_str(),
            seqnum: op.seq,
            req: op.req_id,
            start_time_ns: op.start_time_ns,
            markers: op.marker_stack.clone(),
            world_size: op.world_size,
            root: op.root,
            pg_id: op.pg_id,
            in_msg_size: op.in_msg_elems,
            out_msg_size: op.out_msg_elems,
            dtype: op.dtype,
            in_split: op.in_split.clone(),
            out_split: op.out_split.clone(),
            marker_stack,
            quant_us: 0.0,
            dequant_us: 0.0,
            latency_us,
            global_latency_us,
        }
    }
}

/// Rank-0 end-of-run report over one rank's statistics.
pub struct BenchReport<'a> {
    pub trace_source: &'a str,
    pub num_msgs: usize,
    pub dry_run: bool,
    pub stats: &'a TraceStats,
    pub total_comms_latency_us: f64,
    pub total_trace_latency_us: f64,
    pub batching: bool,
}

fn write_size_row<W: Write>(w: &mut W, summary: &Summary) -> io::Result<()> {
    writeln!(
        w,
        " {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
        summary.total,
        summary.total / 1024.0 / 1024.0,
        summary.max,
        summary.min,
        summary.mean,
        summary.p50,
        summary.p95
    )
}

fn write_latency_row<W: Write>(w: &mut W, summary: &Summary) -> io::Result<()> {
    writeln!(
        w,
        " {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
        summary.total, summary.max, summary.min, summary.mean, summary.p50, summary.p95
    )
}

const SIZE_HEADER: &str =
    "        Total   Total (MB)         Max.         Min.      Average          p50          p95";
const LATENCY_HEADER: &str =
    "        Total         Max.         Min.      Average          p50          p95";

impl BenchReport<'_> {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "\n+++++ {} msgs recorded in {} +++++\n",
            self.num_msgs, self.trace_source
        )?;

        for (block, entries) in &self.stats.blocks {
            let block_total: f64 = entries.iter().filter_map(|e| e.latency_us).sum();
            writeln!(
                w,
                "+ {} comms in block {block}: {block_total:.2} us in total",
                entries.len()
            )?;
        }

        writeln!(w, "\n{0} Message size statistics {0}", "=".repeat(20))?;
        for (kind, in_sizes) in &self.stats.coll_in_sizes {
            writeln!(w, "{}", "-".repeat(50))?;
            writeln!(w, "+ {} {kind}", in_sizes.len())?;
            writeln!(w, "{}", "-".repeat(50))?;

            let as_f64 = |sizes: &[u64]| sizes.iter().map(|s| *s as f64).collect::<Vec<_>>();
            if let Some(summary) = summarize(&as_f64(in_sizes)) {
                writeln!(w, "Size of input tensors (elements)\n{SIZE_HEADER}")?;
                write_size_row(w, &summary)?;
            }
            if let Some(out_sizes) = self.stats.coll_out_sizes.get(kind) {
                if let Some(summary) = summarize(&as_f64(out_sizes)) {
                    writeln!(w, "Size of output tensors (elements)\n{SIZE_HEADER}")?;
                    write_size_row(w, &summary)?;
                }
            }
        }

        if self.dry_run {
            return Ok(());
        }

        writeln!(w, "\n{0} Performance of replayed comms {0}", "=".repeat(20))?;
        writeln!(
            w,
            "Total latency (us) of comms in trace: {:.2}",
            self.total_trace_latency_us
        )?;
        for (kind, latencies) in &self.stats.coll_lat_us {
            let Some(summary) = summarize(latencies) else {
                continue;
            };
            let share = if self.total_comms_latency_us > 0.0 {
                summary.total / self.total_comms_latency_us * 100.0
            } else {
                0.0
            };
            writeln!(w, "{}", "-".repeat(50))?;
            writeln!(w, "+ Replayed {} {kind} ({share:.2}%)", latencies.len())?;
            writeln!(w, "Latency (us)\n{LATENCY_HEADER}")?;
            write_latency_row(w, &summary)?;
        }

        if self.batching {
            if let Some(summary) = summarize(&self.stats.batch_lat_ms) {
                writeln!(w, "\n{0} Batch latency performance {0}", "=".repeat(20))?;
                writeln!(w, "Batch latency (ms)\n{LATENCY_HEADER}")?;
                write_latency_row(w, &summary)?;
            }
        }
        Ok(())
    }
}

/// Writes one rank's augmented trace to `<out_path>/replayedCommsPerf.rank<R>.json`.
///
/// Reads fail hard on an unknown scheme, but by the time this runs the
/// replay has already finished; an unwritable sink downgrades to a warning.
pub async fn write_comm_details(
    records: &[AugmentedRecord],
    rank: u32,
    out_path: &str,
) -> Result<()> {
    if out_path.is_empty() {
        return Ok(());
    }
    let store = match store::store_for(out_path) {
        Ok(store) => store,
        Err(ReplayError::UnknownTransport(scheme)) => {
            warn!("no transport for scheme `{scheme}`, skipping augmented-trace output");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let target = format!("{out_path}/replayedCommsPerf.rank{rank}.json");
    info!("[rank {rank:3}] writing comm details to {target}");
    let bytes = serde_json::to_vec_pretty(records)?;
    store.write(&target, &bytes).await
}
