use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::info;

use crate::backend::{Backend, Fabric, LoopbackBackend};
use crate::config::{Opts, ReplayConfig, WorldInfo, trace_location};
use crate::error::ReplayError;
use crate::groups::{ProcessGroupTable, create_backend_groups};
use crate::replay::TraceReplayer;
use crate::report::{BenchReport, write_comm_details};
use crate::stats::TraceStats;
use crate::store;
use crate::trace::load_trace;

fn check_trace_location(location: &str) -> Result<(), ReplayError> {
    if store::split_scheme(location).is_none() && !Path::new(location).is_file() {
        return Err(ReplayError::InvalidConfiguration(format!(
            "trace file `{location}` does not exist or is not a file; \
             point --trace-path at a trace"
        )));
    }
    Ok(())
}

/// Entry point behind the CLI: dry-run analysis, or a full replay on the
/// selected backend.
pub async fn run(opts: Opts) -> Result<()> {
    let world = WorldInfo::from_env()?;
    if opts.dry_run {
        info!("dry run: analyzing the trace without replaying, rank 0 only");
        return dry_run(&opts, &world).await;
    }
    match opts.backend.as_str() {
        "loopback" => run_loopback(&opts, &world).await,
        other => Err(ReplayError::UnsupportedBackend(other.to_owned()).into()),
    }
}

async fn dry_run(opts: &Opts, world: &WorldInfo) -> Result<()> {
    let location = trace_location(opts, world.global_rank);
    check_trace_location(&location)?;
    let blob_store = store::store_for(&location)?;
    let trace = load_trace(blob_store.as_ref(), &location).await?;

    let cfg = ReplayConfig::from_opts(opts);
    let stats = TraceStats::collect(&trace, cfg.max_ops(trace.len()), true);
    if world.global_rank == 0 {
        let report = BenchReport {
            trace_source: &location,
            num_msgs: trace.len(),
            dry_run: true,
            stats: &stats,
            total_comms_latency_us: 0.0,
            total_trace_latency_us: 0.0,
            batching: false,
        };
        report.write_to(&mut std::io::stdout())?;
    }
    Ok(())
}

/// Runs every rank of the world as a task over a shared in-process fabric.
/// External backends replace this fan-out with per-process launches.
pub async fn run_loopback(opts: &Opts, world: &WorldInfo) -> Result<()> {
    let fabric = Fabric::new(world.world_size);
    let mut ranks = JoinSet::new();
    for rank in 0..world.world_size {
        let backend = Arc::new(LoopbackBackend::new(fabric.clone(), rank));
        let opts = opts.clone();
        let world = world.clone();
        ranks.spawn(async move { run_rank(&opts, &world, backend).await });
    }
    while let Some(joined) = ranks.join_next().await {
        joined.context("rank task panicked")??;
    }
    Ok(())
}

/// One rank's full control flow: load, stat, plan groups, replay, report.
pub async fn run_rank(opts: &Opts, world: &WorldInfo, backend: Arc<dyn Backend>) -> Result<()> {
    let rank = backend.global_rank();
    let location = trace_location(opts, rank);
    check_trace_location(&location)?;
    let blob_store = store::store_for(&location)?;
    info!("[rank {rank:3}] reading trace from {location}");
    let trace = load_trace(blob_store.as_ref(), &location).await?;

    let cfg = ReplayConfig::from_opts(opts);
    let stats = TraceStats::collect(&trace, cfg.max_ops(trace.len()), false);

    backend
        .initialize(&world.master_addr, world.master_port)
        .await
        .context("backend init")?;
    backend.say_hello();

    let group_table = ProcessGroupTable::from_trace(&trace)?;
    let pg_handles = create_backend_groups(backend.as_ref(), &group_table, cfg.auto_shrink).await?;

    let mut replayer = TraceReplayer::new(
        cfg.clone(),
        backend.clone(),
        trace,
        group_table,
        pg_handles,
        stats,
    );
    replayer.bench_time().await?;

    if rank == 0 {
        let report = BenchReport {
            trace_source: &location,
            num_msgs: replayer.num_msgs(),
            dry_run: false,
            stats: replayer.stats(),
            total_comms_latency_us: replayer.total_comms_latency_us(),
            total_trace_latency_us: replayer.total_trace_latency_us(),
            batching: cfg.colls_per_batch > 0,
        };
        report.write_to(&mut std::io::stdout())?;
    }

    write_comm_details(replayer.trace_with_perf(), rank, &cfg.out_path).await?;
    backend
        .sync_barrier(backend.default_group())
        .await
        .context("teardown barrier")?;
    Ok(())
}
