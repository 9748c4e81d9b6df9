//! Single-process backend: every rank of the world runs as a task over a
//! shared [`Fabric`]. Collectives are realized as in-memory exchanges, which
//! makes the replay engine fully exercisable without a network stack or
//! accelerator runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Backend, CollectiveArgs, CollectiveRequest, GroupHandle, PostedRequest};
use crate::tensor::{DType, ReduceOp, Tensor};
use crate::trace::OpKind;

/// One rank's payload for a group exchange. The split vector rides along so
/// `all_to_allv` peers can segment each other's buffers.
#[derive(Debug, Clone)]
struct Contribution {
    data: Tensor,
    split: Vec<u64>,
}

struct Slot {
    contribs: Mutex<HashMap<u32, Contribution>>,
    taken: AtomicUsize,
    done: watch::Sender<bool>,
}

impl Slot {
    fn new() -> Slot {
        let (done, _) = watch::channel(false);
        Slot {
            contribs: Mutex::new(HashMap::new()),
            taken: AtomicUsize::new(0),
            done,
        }
    }
}

#[derive(Default)]
struct ExchangeState {
    /// Next exchange round per member rank. Rounds are assigned at post
    /// time, so a rank's collectives hit slots in trace order even when the
    /// completions run on spawned tasks.
    rounds: HashMap<u32, u64>,
    slots: HashMap<u64, Arc<Slot>>,
}

#[derive(Clone)]
struct FabricGroup {
    ranks: Arc<Vec<u32>>,
    exchange: Arc<Mutex<ExchangeState>>,
}

/// A rank's claim on one round of a group exchange.
struct Enrollment {
    group: FabricGroup,
    slot: Arc<Slot>,
    round: u64,
}

impl Enrollment {
    fn ranks(&self) -> &[u32] {
        &self.group.ranks
    }

    fn contribute(&self, rank: u32, contribution: Contribution) {
        let mut contribs = self.slot.contribs.lock().unwrap();
        contribs.insert(rank, contribution);
        if contribs.len() == self.group.ranks.len() {
            let _ = self.slot.done.send(true);
        }
    }

    /// Waits until every member has contributed, then hands back the full
    /// contribution set. The last rank to collect retires the slot.
    async fn collect(&self) -> Result<HashMap<u32, Contribution>> {
        let mut done = self.slot.done.subscribe();
        while !*done.borrow_and_update() {
            done.changed()
                .await
                .map_err(|_| anyhow!("exchange slot abandoned"))?;
        }
        let contribs = self.slot.contribs.lock().unwrap().clone();
        let taken = self.slot.taken.fetch_add(1, Ordering::AcqRel) + 1;
        if taken == self.group.ranks.len() {
            let mut state = self.group.exchange.lock().unwrap();
            state.slots.remove(&self.round);
        }
        Ok(contribs)
    }
}

/// Shared state connecting all ranks of a loopback world: the group
/// registry, per-group exchange slots, and the point-to-point mailboxes.
pub struct Fabric {
    world_size: u32,
    groups: RwLock<Vec<FabricGroup>>,
    mailboxes: Mutex<HashMap<(u32, u32), VecDeque<Tensor>>>,
    mail_version: watch::Sender<u64>,
}

impl Fabric {
    pub fn new(world_size: u32) -> Arc<Fabric> {
        let all_ranks: Vec<u32> = (0..world_size).collect();
        let (mail_version, _) = watch::channel(0);
        Arc::new(Fabric {
            world_size,
            groups: RwLock::new(vec![FabricGroup {
                ranks: Arc::new(all_ranks),
                exchange: Arc::new(Mutex::new(ExchangeState::default())),
            }]),
            mailboxes: Mutex::new(HashMap::new()),
            mail_version,
        })
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    fn group(&self, handle: GroupHandle) -> Result<FabricGroup> {
        self.groups
            .read()
            .unwrap()
            .get(handle.0)
            .cloned()
            .with_context(|| format!("unknown group handle {}", handle.0))
    }

    /// Registers a group, deduplicating identical member lists so every rank
    /// creating the same group receives the same handle.
    fn ensure_group(&self, ranks: &[u32]) -> GroupHandle {
        let mut groups = self.groups.write().unwrap();
        if let Some(idx) = groups.iter().position(|g| g.ranks.as_slice() == ranks) {
            return GroupHandle(idx);
        }
        groups.push(FabricGroup {
            ranks: Arc::new(ranks.to_vec()),
            exchange: Arc::new(Mutex::new(ExchangeState::default())),
        });
        GroupHandle(groups.len() - 1)
    }

    fn enroll(&self, handle: GroupHandle, rank: u32) -> Result<Enrollment> {
        let group = self.group(handle)?;
        if !group.ranks.contains(&rank) {
            bail!("rank {rank} is not a member of group {}", handle.0);
        }
        let mut state = group.exchange.lock().unwrap();
        let counter = state.rounds.entry(rank).or_default();
        let round = *counter;
        *counter += 1;
        let slot = state
            .slots
            .entry(round)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();
        drop(state);
        Ok(Enrollment { group, slot, round })
    }

    fn post_mail(&self, src: u32, dst: u32, payload: Tensor) {
        self.mailboxes
            .lock()
            .unwrap()
            .entry((src, dst))
            .or_default()
            .push_back(payload);
        self.mail_version.send_modify(|v| *v += 1);
    }

    async fn fetch_mail(&self, src: u32, dst: u32) -> Result<Tensor> {
        let mut version = self.mail_version.subscribe();
        loop {
            if let Some(payload) = self
                .mailboxes
                .lock()
                .unwrap()
                .get_mut(&(src, dst))
                .and_then(|q| q.pop_front())
            {
                return Ok(payload);
            }
            version
                .changed()
                .await
                .map_err(|_| anyhow!("fabric shut down while waiting for rank {src}"))?;
        }
    }
}

/// How to fold a full contribution set into this rank's result.
struct CombineOp {
    kind: OpKind,
    rank: u32,
    root: u32,
    reduce: ReduceOp,
}

impl CombineOp {
    fn combine(&self, contribs: &HashMap<u32, Contribution>, ranks: &[u32]) -> Result<Tensor> {
        let size = ranks.len();
        let my_idx = ranks
            .iter()
            .position(|r| *r == self.rank)
            .context("rank left the group mid-exchange")?;
        let part = |rank: u32| -> Result<&Contribution> {
            contribs
                .get(&rank)
                .with_context(|| format!("missing contribution from rank {rank}"))
        };
        let reduce_all = || -> Result<Tensor> {
            let mut acc = part(ranks[0])?.data.clone();
            for rank in &ranks[1..] {
                acc.reduce_from(&part(*rank)?.data, self.reduce)?;
            }
            Ok(acc)
        };
        let gather_all = || -> Result<Tensor> {
            let parts = ranks
                .iter()
                .map(|r| Ok(part(*r)?.data.clone()))
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&parts)
        };
        let empty = || -> Result<Tensor> {
            let dtype = part(self.rank)?.data.dtype();
            Ok(Tensor::zeros(dtype, 0))
        };

        match self.kind {
            OpKind::AllReduce => reduce_all(),
            OpKind::Reduce => {
                if self.rank == self.root {
                    reduce_all()
                } else {
                    empty()
                }
            }
            OpKind::Broadcast => Ok(part(self.root)?.data.clone()),
            OpKind::AllGather | OpKind::AllGatherBase => gather_all(),
            OpKind::Gather => {
                if self.rank == self.root {
                    gather_all()
                } else {
                    empty()
                }
            }
            OpKind::Scatter => {
                let source = &part(self.root)?.data;
                let chunk = source.len() / size;
                Ok(source.slice(my_idx * chunk, chunk))
            }
            OpKind::ReduceScatter | OpKind::ReduceScatterBase => {
                let total = reduce_all()?;
                let chunk = total.len() / size;
                Ok(total.slice(my_idx * chunk, chunk))
            }
            OpKind::AllToAll => {
                let parts = ranks
                    .iter()
                    .map(|r| {
                        let data = &part(*r)?.data;
                        let chunk = data.len() / size;
                        Ok(data.slice(my_idx * chunk, chunk))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts)
            }
            OpKind::AllToAllv => {
                let parts = ranks
                    .iter()
                    .map(|r| {
                        let peer = part(*r)?;
                        if peer.split.is_empty() {
                            let chunk = peer.data.len() / size;
                            Ok(peer.data.slice(my_idx * chunk, chunk))
                        } else if peer.split.len() != size {
                            bail!(
                                "rank {r} sent {} splits into a {size}-wide group",
                                peer.split.len()
                            );
                        } else {
                            let offset: u64 = peer.split[..my_idx].iter().sum();
                            let len = peer.split[my_idx];
                            if (offset + len) as usize > peer.data.len() {
                                bail!(
                                    "rank {r} splits address {} elements but sent {}",
                                    offset + len,
                                    peer.data.len()
                                );
                            }
                            Ok(peer.data.slice(offset as usize, len as usize))
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts)
            }
            OpKind::Barrier => empty(),
            other => bail!("kind {other} is not a group exchange"),
        }
    }
}

struct LoopbackRequest {
    handle: JoinHandle<Result<()>>,
}

#[async_trait]
impl CollectiveRequest for LoopbackRequest {
    async fn complete(self: Box<Self>) -> Result<()> {
        self.handle.await.context("collective task panicked")?
    }
}

/// A buffered point-to-point post that finished at issue time.
struct ImmediateRequest;

#[async_trait]
impl CollectiveRequest for ImmediateRequest {
    async fn complete(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

pub struct LoopbackBackend {
    fabric: Arc<Fabric>,
    global_rank: u32,
    rng: Mutex<StdRng>,
}

impl LoopbackBackend {
    pub fn new(fabric: Arc<Fabric>, global_rank: u32) -> LoopbackBackend {
        LoopbackBackend {
            fabric,
            global_rank,
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed ^ u64::from(global_rank))),
        }
    }

    async fn launch(&self, kind: OpKind, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        let rank = self.global_rank;
        match kind {
            OpKind::Send | OpKind::Isend => {
                let peer = args.peer.context("send requires a peer rank")?;
                self.fabric.post_mail(rank, peer, args.input.clone());
                Ok(args
                    .async_op
                    .then(|| Box::new(ImmediateRequest) as Box<dyn CollectiveRequest>))
            }
            OpKind::Recv | OpKind::Irecv => {
                let peer = args.peer.context("recv requires a peer rank")?;
                if args.async_op {
                    let fabric = self.fabric.clone();
                    let handle =
                        tokio::spawn(async move { fabric.fetch_mail(peer, rank).await.map(|_| ()) });
                    Ok(Some(Box::new(LoopbackRequest { handle })))
                } else {
                    let payload = self.fabric.fetch_mail(peer, rank).await?;
                    args.output.copy_from(&payload);
                    Ok(None)
                }
            }
            _ => {
                let enrollment = self.fabric.enroll(args.group, rank)?;
                enrollment.contribute(
                    rank,
                    Contribution {
                        data: args.input.clone(),
                        split: args.in_split.to_vec(),
                    },
                );
                let op = CombineOp {
                    kind,
                    rank,
                    root: args.root,
                    reduce: args.reduce_op,
                };
                if args.async_op {
                    let handle = tokio::spawn(async move {
                        let contribs = enrollment.collect().await?;
                        op.combine(&contribs, enrollment.ranks()).map(|_| ())
                    });
                    Ok(Some(Box::new(LoopbackRequest { handle })))
                } else {
                    let contribs = enrollment.collect().await?;
                    let result = op.combine(&contribs, enrollment.ranks())?;
                    args.output.copy_from(&result);
                    Ok(None)
                }
            }
        }
    }
}

#[async_trait]
impl Backend for LoopbackBackend {
    async fn initialize(&self, master_addr: &str, master_port: u16) -> Result<()> {
        debug!(
            rank = self.global_rank,
            master_addr, master_port, "loopback fabric needs no rendezvous"
        );
        Ok(())
    }

    fn say_hello(&self) {
        info!(
            rank = self.global_rank,
            world = self.fabric.world_size,
            device = self.device(),
            "loopback backend ready"
        );
    }

    fn device(&self) -> &str {
        "cpu"
    }

    fn global_rank(&self) -> u32 {
        self.global_rank
    }

    fn local_rank(&self) -> u32 {
        self.global_rank
    }

    fn world_size(&self) -> u32 {
        self.fabric.world_size
    }

    fn default_group(&self) -> GroupHandle {
        GroupHandle(0)
    }

    async fn new_group(&self, ranks: &[u32]) -> Result<GroupHandle> {
        if let Some(bad) = ranks.iter().find(|r| **r >= self.fabric.world_size) {
            bail!("group member {bad} is outside the {}-rank world", self.fabric.world_size);
        }
        Ok(self.fabric.ensure_group(ranks))
    }

    fn group_rank(&self, group: GroupHandle) -> Option<u32> {
        let group = self.fabric.group(group).ok()?;
        group
            .ranks
            .iter()
            .position(|r| *r == self.global_rank)
            .map(|idx| idx as u32)
    }

    fn group_size(&self, group: GroupHandle) -> u32 {
        self.fabric
            .group(group)
            .map(|g| g.ranks.len() as u32)
            .unwrap_or(0)
    }

    fn supports(&self, kind: OpKind) -> bool {
        !matches!(kind, OpKind::Init | OpKind::Unknown)
    }

    fn alloc_random(&self, elems: usize, dtype: DType, scale: f64) -> Tensor {
        Tensor::random(dtype, elems, scale, &mut *self.rng.lock().unwrap())
    }

    fn alloc_empty(&self, elems: usize, dtype: DType) -> Tensor {
        Tensor::zeros(dtype, elems)
    }

    async fn all_reduce(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::AllReduce, args).await
    }

    async fn reduce(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Reduce, args).await
    }

    async fn all_gather(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::AllGather, args).await
    }

    async fn all_gather_base(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::AllGatherBase, args).await
    }

    async fn gather(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Gather, args).await
    }

    async fn scatter(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Scatter, args).await
    }

    async fn reduce_scatter(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::ReduceScatter, args).await
    }

    async fn reduce_scatter_base(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::ReduceScatterBase, args).await
    }

    async fn broadcast(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Broadcast, args).await
    }

    async fn all_to_all(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::AllToAll, args).await
    }

    async fn all_to_allv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::AllToAllv, args).await
    }

    async fn send(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Send, args).await
    }

    async fn recv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Recv, args).await
    }

    async fn isend(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Isend, args).await
    }

    async fn irecv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Irecv, args).await
    }

    async fn barrier(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        self.launch(OpKind::Barrier, args).await
    }

    async fn sync_barrier(&self, group: GroupHandle) -> Result<()> {
        let enrollment = self.fabric.enroll(group, self.global_rank)?;
        enrollment.contribute(
            self.global_rank,
            Contribution {
                data: Tensor::zeros(DType::Float, 0),
                split: Vec::new(),
            },
        );
        enrollment.collect().await.map(|_| ())
    }

    fn dcheck(
        &self,
        kind: OpKind,
        group: GroupHandle,
        root: u32,
        expected_elems: usize,
        output: &Tensor,
    ) -> Result<()> {
        let group_size = f64::from(self.group_size(group));
        let expected = match kind {
            OpKind::AllReduce | OpKind::ReduceScatter | OpKind::ReduceScatterBase => group_size,
            OpKind::Reduce => {
                if self.global_rank != root {
                    return Ok(());
                }
                group_size
            }
            OpKind::Gather => {
                if self.global_rank != root {
                    return Ok(());
                }
                1.0
            }
            OpKind::Broadcast
            | OpKind::AllGather
            | OpKind::AllGatherBase
            | OpKind::Scatter
            | OpKind::AllToAll
            | OpKind::AllToAllv
            | OpKind::Recv => 1.0,
            _ => return Ok(()),
        };
        for idx in 0..expected_elems.min(output.len()) {
            let found = output.get(idx);
            if found != expected {
                bail!("data check failed at element {idx}: expected {expected}, found {found}");
            }
        }
        Ok(())
    }
}
