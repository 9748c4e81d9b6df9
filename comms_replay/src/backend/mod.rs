use anyhow::Result;
use async_trait::async_trait;

use crate::tensor::{DType, ReduceOp, Tensor};
use crate::trace::OpKind;

pub mod loopback;
pub use loopback::{Fabric, LoopbackBackend};

/// Opaque identifier for a process group created on a backend. Handles are
/// only meaningful to the backend that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub(crate) usize);

/// Argument bundle consumed by every per-kind dispatch entry.
///
/// `input` is the rank's contribution, `output` receives the rank's share of
/// the result (only written on the blocking path). `peer` addresses the
/// counterpart rank for point-to-point kinds.
pub struct CollectiveArgs<'a> {
    pub input: &'a Tensor,
    pub output: &'a mut Tensor,
    pub group: GroupHandle,
    pub async_op: bool,
    pub reduce_op: ReduceOp,
    pub root: u32,
    pub in_split: &'a [u64],
    pub out_split: &'a [u64],
    pub peer: Option<u32>,
}

/// Handle for a collective that was posted asynchronously. `complete` blocks
/// until the operation has finished on the backend.
#[async_trait]
pub trait CollectiveRequest: Send + Sync {
    async fn complete(self: Box<Self>) -> Result<()>;
}

/// `Some(handle)` when the op was posted asynchronously, `None` when it
/// completed synchronously from the caller's view.
pub type PostedRequest = Option<Box<dyn CollectiveRequest>>;

/// Capability contract to the collective-communication library.
///
/// One dispatch entry per collective kind plus a [`Backend::supports`]
/// predicate, so the scheduler can skip kinds a backend does not implement
/// without guessing. Implementations may accept unsupported kinds as no-ops
/// but must then exclude them from `supports`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One-time rendezvous with the rest of the world (address exchange,
    /// transport bring-up). Called once before any collective.
    async fn initialize(&self, master_addr: &str, master_port: u16) -> Result<()>;

    /// Logs this rank's identity once after init.
    fn say_hello(&self);

    fn global_rank(&self) -> u32;
    fn local_rank(&self) -> u32;
    fn world_size(&self) -> u32;

    /// Name of the device this rank's buffers live on, e.g. `cpu`.
    fn device(&self) -> &str;

    fn default_group(&self) -> GroupHandle;
    async fn new_group(&self, ranks: &[u32]) -> Result<GroupHandle>;
    /// This rank's position within `group`, or `None` if it is not a member.
    fn group_rank(&self, group: GroupHandle) -> Option<u32>;
    fn group_size(&self, group: GroupHandle) -> u32;

    fn supports(&self, kind: OpKind) -> bool;

    fn reduce_op(&self, name: &str) -> ReduceOp {
        match name {
            "max" => ReduceOp::Max,
            _ => ReduceOp::Sum,
        }
    }

    fn alloc_random(&self, elems: usize, dtype: DType, scale: f64) -> Tensor;
    fn alloc_empty(&self, elems: usize, dtype: DType) -> Tensor;

    async fn all_reduce(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn reduce(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn all_gather(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn all_gather_base(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn gather(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn scatter(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn reduce_scatter(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn reduce_scatter_base(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn broadcast(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn all_to_all(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn all_to_allv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn send(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn recv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn isend(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn irecv(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;
    async fn barrier(&self, args: CollectiveArgs<'_>) -> Result<PostedRequest>;

    /// Routes `kind` to its dispatch entry. `wait` is resolved by the
    /// scheduler against its async registry and never reaches the backend;
    /// `init` records are consumed by the group planner.
    async fn dispatch(&self, kind: OpKind, args: CollectiveArgs<'_>) -> Result<PostedRequest> {
        match kind {
            OpKind::AllReduce => self.all_reduce(args).await,
            OpKind::Reduce => self.reduce(args).await,
            OpKind::AllGather => self.all_gather(args).await,
            OpKind::AllGatherBase => self.all_gather_base(args).await,
            OpKind::Gather => self.gather(args).await,
            OpKind::Scatter => self.scatter(args).await,
            OpKind::ReduceScatter => self.reduce_scatter(args).await,
            OpKind::ReduceScatterBase => self.reduce_scatter_base(args).await,
            OpKind::Broadcast => self.broadcast(args).await,
            OpKind::AllToAll => self.all_to_all(args).await,
            OpKind::AllToAllv => self.all_to_allv(args).await,
            OpKind::Send => self.send(args).await,
            OpKind::Recv => self.recv(args).await,
            OpKind::Isend => self.isend(args).await,
            OpKind::Irecv => self.irecv(args).await,
            OpKind::Barrier => self.barrier(args).await,
            OpKind::Wait | OpKind::Init | OpKind::Unknown => Ok(None),
        }
    }

    /// Barrier over `group` that also retires device-side work. Measured
    /// regions are fenced with this over the op's own group; pass the
    /// default group to fence the whole world.
    async fn sync_barrier(&self, group: GroupHandle) -> Result<()>;

    /// Blocks until device-side queues have drained. A no-op for host-only
    /// backends.
    fn device_sync(&self) {}

    /// Releases any backend-held buffers between replays.
    fn clear_memory(&self) {}

    /// Opt-in element-wise validation of `output` after a blocking
    /// collective, assuming inputs were prepared as all-ones.
    fn dcheck(
        &self,
        kind: OpKind,
        group: GroupHandle,
        root: u32,
        expected_elems: usize,
        output: &Tensor,
    ) -> Result<()>;
}
