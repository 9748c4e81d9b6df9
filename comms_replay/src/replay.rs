use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::{Backend, CollectiveArgs, CollectiveRequest, GroupHandle, PostedRequest};
use crate::config::ReplayConfig;
use crate::error::ReplayError;
use crate::groups::ProcessGroupTable;
use crate::prepare::TensorPreparer;
use crate::rebalance::rebalance_split;
use crate::report::AugmentedRecord;
use crate::stats::{BlockEntry, TraceStats};
use crate::tensor::Tensor;
use crate::trace::{OpKind, OpRecord};

/// Sleep quantum while pacing toward the next captured timestamp.
pub const LOOP_TIMER: Duration = Duration::from_millis(20);

/// Outstanding async collectives, joined later by `wait` ops.
///
/// Two tiers: an id-keyed map for traces that correlate posts and waits
/// through `req`, and a FIFO for legacy traces without it. A `wait` consults
/// the map first and falls back to the oldest FIFO entry.
#[derive(Default)]
pub struct AsyncRegistry {
    fifo: VecDeque<Box<dyn CollectiveRequest>>,
    by_id: HashMap<u64, Box<dyn CollectiveRequest>>,
}

impl AsyncRegistry {
    pub fn post(&mut self, req_id: Option<u64>, handle: Box<dyn CollectiveRequest>) {
        match req_id {
            Some(id) => {
                self.by_id.insert(id, handle);
            }
            None => self.fifo.push_back(handle),
        }
    }

    pub fn take_for_wait(&mut self, req_id: Option<u64>) -> Option<Box<dyn CollectiveRequest>> {
        if let Some(id) = req_id {
            if let Some(handle) = self.by_id.remove(&id) {
                return Some(handle);
            }
        }
        self.fifo.pop_front()
    }

    pub fn outstanding(&self) -> usize {
        self.fifo.len() + self.by_id.len()
    }

    /// Joins everything still in flight, e.g. posts whose `wait` never made
    /// it into the trace.
    pub async fn drain(&mut self) -> Result<()> {
        let handles: Vec<_> = self
            .fifo
            .drain(..)
            .chain(self.by_id.drain().map(|(_, handle)| handle))
            .collect();
        futures::future::try_join_all(handles.into_iter().map(|handle| handle.complete())).await?;
        Ok(())
    }
}

/// Per-rank replay state machine: warm-up pass, measured passes, async
/// request tracking, and latency accounting.
pub struct TraceReplayer {
    cfg: ReplayConfig,
    backend: Arc<dyn Backend>,
    trace: Vec<OpRecord>,
    max_ops: usize,
    group_table: ProcessGroupTable,
    pg_handles: HashMap<u32, GroupHandle>,
    allow: BTreeSet<OpKind>,
    preparer: TensorPreparer,
    stats: TraceStats,
    registry: AsyncRegistry,
    trace_with_perf: Vec<AugmentedRecord>,
    total_comms_latency_us: f64,
    total_trace_latency_us: f64,
}

fn parse_allow_list(selector: &str, backend: &dyn Backend) -> BTreeSet<OpKind> {
    match selector.trim() {
        "all" | "default" | "*" | "" => OpKind::ALL
            .iter()
            .copied()
            .filter(|kind| backend.supports(*kind))
            .collect(),
        list => list
            .split(',')
            .filter_map(|name| {
                let name = name.trim();
                let kind = OpKind::parse(name);
                if kind == OpKind::Unknown {
                    warn!("ignoring unrecognized collective `{name}` in allow list");
                    None
                } else if !backend.supports(kind) {
                    warn!("backend does not support `{kind}`, it will be skipped");
                    None
                } else {
                    Some(kind)
                }
            })
            .collect(),
    }
}

impl TraceReplayer {
    pub fn new(
        cfg: ReplayConfig,
        backend: Arc<dyn Backend>,
        trace: Vec<OpRecord>,
        group_table: ProcessGroupTable,
        pg_handles: HashMap<u32, GroupHandle>,
        stats: TraceStats,
    ) -> TraceReplayer {
        let max_ops = cfg.max_ops(trace.len());
        let allow = parse_allow_list(&cfg.allow_ops, backend.as_ref());
        let preparer = TensorPreparer::new(cfg.auto_shrink, cfg.data_check);
        TraceReplayer {
            cfg,
            backend,
            trace,
            max_ops,
            group_table,
            pg_handles,
            allow,
            preparer,
            stats,
            registry: AsyncRegistry::default(),
            trace_with_perf: Vec::new(),
            total_comms_latency_us: 0.0,
            total_trace_latency_us: 0.0,
        }
    }

    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    pub fn trace_with_perf(&self) -> &[AugmentedRecord] {
        &self.trace_with_perf
    }

    pub fn num_msgs(&self) -> usize {
        self.trace.len()
    }

    pub fn total_comms_latency_us(&self) -> f64 {
        self.total_comms_latency_us
    }

    pub fn total_trace_latency_us(&self) -> f64 {
        self.total_trace_latency_us
    }

    /// Group an op executes on: its recorded process group when one is
    /// attached (and auto-shrink has not rebound it), the default group
    /// otherwise. The middle element is this rank's position in the group,
    /// `None` when it is not a member.
    fn resolve_group(&self, op: &OpRecord) -> (GroupHandle, Option<u32>, String) {
        if let (Some(pg_id), false) = (op.pg_id, self.cfg.auto_shrink) {
            if let Some(handle) = self.pg_handles.get(&pg_id) {
                let desc = format!(
                    "pg {pg_id}, world_ranks {:?}",
                    self.group_table.get(pg_id).unwrap_or_default()
                );
                return (*handle, self.backend.group_rank(*handle), desc);
            }
        }
        let handle = self.backend.default_group();
        (
            handle,
            self.backend.group_rank(handle),
            "default group".to_owned(),
        )
    }

    async fn dispatch_op(
        &self,
        kind: OpKind,
        op: &OpRecord,
        group: GroupHandle,
        input: &Tensor,
        output: &mut Tensor,
        async_op: bool,
    ) -> Result<PostedRequest> {
        // Reductions default to sum; the recorded root doubles as the peer
        // rank for point-to-point kinds, defaulting to rank 0 like the
        // capture side does.
        let root = op.root.unwrap_or(0);
        let args = CollectiveArgs {
            input,
            output,
            group,
            async_op,
            reduce_op: self.backend.reduce_op("sum"),
            root,
            in_split: &op.in_split,
            out_split: &op.out_split,
            peer: Some(root),
        };
        self.backend
            .dispatch(kind, args)
            .await
            .with_context(|| format!("dispatch failed at seq {}", op.seq))
    }

    /// Joins the async post a `wait` refers to: the id-keyed entry when the
    /// record carries `req`, the oldest outstanding handle otherwise.
    async fn complete_wait(&mut self, req_id: Option<u64>) -> Result<()> {
        if let Some(handle) = self.registry.take_for_wait(req_id) {
            handle
                .complete()
                .await
                .context("waiting on outstanding collective")?;
            self.backend.device_sync();
        }
        Ok(())
    }

    /// With `dev_sync`, retires every outstanding async post and drains the
    /// device; without it, posts stay in flight until their `wait`.
    async fn complete_accel_ops(&mut self, dev_sync: bool) -> Result<()> {
        if dev_sync {
            self.registry.drain().await?;
            self.backend.device_sync();
        }
        Ok(())
    }

    /// Unmeasured pass priming the backend. Always dispatches blocking, and
    /// applies the rebalance policy against the loaded trace so the measured
    /// pass replays the rewritten splits.
    pub async fn warm_up(&mut self) -> Result<()> {
        let max_ops = self.max_ops;
        for idx in 0..max_ops {
            let mut entry = self.trace[idx].clone();
            let kind = entry.kind;
            if kind == OpKind::Unknown || kind == OpKind::Init {
                continue;
            }
            let (group, group_rank, desc) = self.resolve_group(&entry);
            if !self.allow.contains(&kind) || group_rank.is_none() {
                continue;
            }
            if group_rank == Some(0) {
                info!("[warm-up] [{idx} / {max_ops}] replaying {kind} with {desc}");
            }
            let (mut input, mut output) =
                self.preparer
                    .prepare(self.backend.as_ref(), &mut entry, false);

            if kind == OpKind::AllToAllv {
                if let Some(policy) = self.cfg.rebalance_policy {
                    rebalance_split(policy, self.backend.as_ref(), group, &mut self.trace[idx])
                        .await
                        .with_context(|| format!("rebalancing op at seq {idx}"))?;
                    // The rewrite invalidated the buffers; prepare again
                    // from the updated record.
                    entry = self.trace[idx].clone();
                    (input, output) =
                        self.preparer
                            .prepare(self.backend.as_ref(), &mut entry, false);
                }
            }

            if kind == OpKind::Wait {
                self.complete_wait(entry.req_id).await?;
            } else {
                self.dispatch_op(kind, &entry, group, &input, &mut output, false)
                    .await?;
            }
            self.complete_accel_ops(true).await?;
        }
        Ok(())
    }

    /// Issues one op and measures it. Blocking mode fences the dispatch with
    /// barriers: `latency` is this rank's dispatch-to-completion time and
    /// `global_latency` additionally covers the closing barrier. In
    /// non-blocking mode both equal the time to post.
    async fn run_comms(
        &mut self,
        kind: OpKind,
        op: &OpRecord,
        group: GroupHandle,
        input: &Tensor,
        output: &mut Tensor,
    ) -> Result<(f64, f64)> {
        if self.cfg.blocking {
            // Fence only the op's own group; other ranks may be skipping
            // this op entirely.
            self.backend
                .sync_barrier(group)
                .await
                .context("pre-dispatch barrier")?;
        }
        let timer = Instant::now();
        if kind == OpKind::Wait {
            self.complete_wait(op.req_id).await?;
        } else {
            let posted = self
                .dispatch_op(kind, op, group, input, output, !self.cfg.blocking)
                .await?;
            if let Some(handle) = posted {
                if !self.cfg.blocking {
                    self.registry.post(op.req_id, handle);
                }
            }
        }
        self.complete_accel_ops(self.cfg.blocking).await?;
        let latency_us = timer.elapsed().as_secs_f64() * 1e6;

        let mut global_latency_us = latency_us;
        if self.cfg.blocking {
            let barrier = Instant::now();
            self.backend
                .sync_barrier(group)
                .await
                .context("post-dispatch barrier")?;
            global_latency_us += barrier.elapsed().as_secs_f64() * 1e6;
        }
        Ok((latency_us, global_latency_us))
    }

    /// Sleeps (or, near the deadline, spins cooperatively) until the pass
    /// clock catches up with the op's captured timestamp.
    async fn wait_for_timestamp(&self, op: &OpRecord, pass_start: Instant) {
        let Some(target_ns) = op.start_time_ns else {
            return;
        };
        let target = Duration::from_nanos(target_ns);
        loop {
            let elapsed = pass_start.elapsed();
            if elapsed >= target {
                return;
            }
            if target - elapsed >= LOOP_TIMER {
                tokio::time::sleep(LOOP_TIMER).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// One measured pass over the trace prefix.
    async fn replay_trace(&mut self) -> Result<()> {
        let max_ops = self.max_ops;
        let mut colls_in_batch = 0u32;
        let mut batch_begin = Instant::now();
        let pass_start = Instant::now();

        for idx in 0..max_ops {
            // Work on a copy: auto-shrink rescales the record it prepares,
            // and the loaded trace must stay fixed across replay iterations.
            let mut op = self.trace[idx].clone();
            let kind = op.kind;
            if kind == OpKind::Unknown {
                warn!(seq = op.seq, "unknown collective kind, skipping");
                continue;
            }
            if kind == OpKind::Init {
                continue;
            }
            let (group, group_rank, desc) = self.resolve_group(&op);
            if !self.allow.contains(&kind) {
                debug!(seq = op.seq, %kind, "kind not in allow list, skipping");
                continue;
            }
            if group_rank.is_none() {
                debug!(seq = op.seq, "local rank is not in the op's group, skipping");
                continue;
            }

            let block_stack = if op.marker_stack.is_empty() {
                "unnamed".to_owned()
            } else {
                op.marker_stack.join(" ")
            };
            if group_rank == Some(0) {
                info!(
                    "[rank {:3}] [{idx} / {max_ops}] replaying {kind} with {desc}",
                    self.backend.global_rank()
                );
            }

            let reuse = self.cfg.num_replays > 1;
            let (input, mut output) = self.preparer.prepare(self.backend.as_ref(), &mut op, reuse);

            if self.cfg.colls_per_batch > 0 && colls_in_batch == 0 {
                batch_begin = Instant::now();
            }
            if self.cfg.use_timestamp {
                self.wait_for_timestamp(&op, pass_start).await;
            }

            let (latency_us, global_latency_us) =
                self.run_comms(kind, &op, group, &input, &mut output).await?;

            if self.cfg.blocking && self.cfg.data_check && !kind.is_control() {
                self.backend
                    .dcheck(
                        kind,
                        group,
                        op.root.unwrap_or(0),
                        op.out_msg_elems.unwrap_or(0) as usize,
                        &output,
                    )
                    .map_err(|source| ReplayError::Backend { seq: op.seq, source })?;
            }

            // A batch is a run of colls_per_batch ops closed by its `wait`.
            if kind == OpKind::Wait && self.cfg.colls_per_batch > 0 {
                colls_in_batch += 1;
                if colls_in_batch == self.cfg.colls_per_batch {
                    self.stats
                        .batch_lat_ms
                        .push(batch_begin.elapsed().as_secs_f64() * 1e3);
                    colls_in_batch = 0;
                }
            }

            self.stats.record_latency(kind, latency_us);
            self.total_comms_latency_us += latency_us;
            for marker in &op.marker_stack {
                self.stats.record_block(
                    marker,
                    BlockEntry {
                        kind,
                        in_msg_elems: op.in_msg_elems,
                        out_msg_elems: op.out_msg_elems,
                        latency_us: Some(latency_us),
                    },
                );
            }
            self.trace_with_perf.push(AugmentedRecord::new(
                &op,
                block_stack.clone(),
                latency_us,
                global_latency_us,
            ));

            if let (Some(exec_id), true) = (op.exec_id, reuse) {
                self.preparer.put_back(exec_id, (input, output));
            }
            if self.backend.global_rank() == 0 {
                info!(
                    "[{idx} / {max_ops}] replayed {kind} in block [{block_stack}]... \
                     {global_latency_us:.2} us"
                );
            }
        }
        Ok(())
    }

    /// Full measured benchmark: optional warm-up, then `num_replays` passes
    /// fenced by cross-rank barriers.
    pub async fn bench_time(&mut self) -> Result<()> {
        if self.cfg.do_warm_up {
            self.warm_up().await?;
        }
        self.backend
            .sync_barrier(self.backend.default_group())
            .await
            .context("pre-replay barrier")?;

        if self.backend.global_rank() == 0 {
            info!(
                "{} messages in the trace... replaying kinds {:?}",
                self.max_ops, self.allow
            );
            for (kind, sizes) in &self.stats.coll_in_sizes {
                debug!("  {kind}: {}", sizes.len());
            }
        }

        let trace_start = Instant::now();
        for replay in 0..self.cfg.num_replays {
            if self.backend.global_rank() == 0 {
                info!("replay #{replay}");
            }
            self.replay_trace().await?;
            // Retire posts that never saw a wait before fencing the pass.
            self.complete_accel_ops(true).await?;
            self.backend
                .sync_barrier(self.backend.default_group())
                .await
                .context("post-replay barrier")?;
        }
        self.total_trace_latency_us = trace_start.elapsed().as_secs_f64() * 1e6;

        self.backend.clear_memory();
        self.preparer.clear();
        Ok(())
    }

    /// Replays exactly the op tagged with `exec_id` and returns its output
    /// buffer. With `regenerate` off, buffers cached from an earlier call
    /// are reused.
    pub async fn replay_single(&mut self, exec_id: u64, regenerate: bool) -> Result<Option<Tensor>> {
        let Some(idx) = self.trace[..self.max_ops]
            .iter()
            .position(|op| op.exec_id == Some(exec_id))
        else {
            return Ok(None);
        };
        let mut op = self.trace[idx].clone();
        let kind = op.kind;
        if !self.allow.contains(&kind) {
            return Ok(None);
        }
        let (group, group_rank, _) = self.resolve_group(&op);
        if group_rank.is_none() {
            return Ok(None);
        }
        let (input, mut output) = self
            .preparer
            .prepare(self.backend.as_ref(), &mut op, !regenerate);
        self.run_comms(kind, &op, group, &input, &mut output)
            .await?;
        if self.cfg.blocking && self.cfg.data_check && !kind.is_control() {
            self.backend
                .dcheck(
                    kind,
                    group,
                    op.root.unwrap_or(0),
                    op.out_msg_elems.unwrap_or(0) as usize,
                    &output,
                )
                .map_err(|source| ReplayError::Backend { seq: op.seq, source })?;
        }
        self.preparer.put_back(exec_id, (input, output.clone()));
        Ok(Some(output))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct TaggedRequest {
        tag: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl CollectiveRequest for TaggedRequest {
        async fn complete(self: Box<Self>) -> Result<()> {
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    fn tagged(tag: u32, log: &Arc<Mutex<Vec<u32>>>) -> Box<dyn CollectiveRequest> {
        Box::new(TaggedRequest {
            tag,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn wait_joins_the_matching_request_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = AsyncRegistry::default();
        registry.post(Some(7), tagged(70, &log));
        registry.post(Some(9), tagged(90, &log));

        let handle = registry.take_for_wait(Some(9)).unwrap();
        handle.complete().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![90]);
        assert_eq!(registry.outstanding(), 1);
    }

    #[tokio::test]
    async fn wait_without_an_id_joins_the_oldest_post() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = AsyncRegistry::default();
        registry.post(None, tagged(1, &log));
        registry.post(None, tagged(2, &log));

        registry
            .take_for_wait(None)
            .unwrap()
            .complete()
            .await
            .unwrap();
        registry
            .take_for_wait(Some(42))
            .unwrap()
            .complete()
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert!(registry.take_for_wait(None).is_none());
    }

    #[tokio::test]
    async fn drain_retires_everything_outstanding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = AsyncRegistry::default();
        registry.post(None, tagged(1, &log));
        registry.post(Some(5), tagged(2, &log));
        registry.drain().await.unwrap();
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn allow_list_parses_csv_and_ignores_typos() {
        let backend = crate::backend::LoopbackBackend::new(crate::backend::Fabric::new(1), 0);
        let allow = parse_allow_list("all_reduce, alltoallv, not_a_coll", &backend);
        assert_eq!(
            allow,
            BTreeSet::from([OpKind::AllReduce, OpKind::AllToAllv])
        );

        let all = parse_allow_list("all", &backend);
        assert!(all.contains(&OpKind::Wait));
        assert!(!all.contains(&OpKind::Init));
    }
}
