//! Trace-driven replay benchmark for collective communications.
//!
//! Given a captured trace of the collectives a training job issued, each
//! rank re-issues the same operation sequence with the same shapes against a
//! pluggable [`Backend`] and reports latency distributions per collective
//! kind and per logical block.

pub mod backend;
pub use backend::{Backend, CollectiveArgs, CollectiveRequest, GroupHandle};

pub mod config;

pub mod driver;

pub mod error;
pub use error::ReplayError;

pub mod groups;
pub use groups::ProcessGroupTable;

pub mod prepare;

pub mod rebalance;

pub mod replay;
pub use replay::TraceReplayer;

pub mod report;

pub mod stats;

pub mod store;
pub use store::BlobStore;

pub mod tensor;
pub use tensor::{DType, Tensor};

pub mod trace;
pub use trace::{OpKind, OpRecord};
