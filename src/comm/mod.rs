//! Collective group and one-sided remote memory interfaces.
//!
//! The runtime never talks to a transport directly. It consumes two traits:
//!
//! * [`Communicator`]: process membership plus the collective primitives
//!   (`barrier`, `allreduce`) that delimit assembly phases.
//! * [`RemoteMemory`]: exposure of per-process segments and one-sided
//!   `put`/`get`/`fetch_add` against any process's segment, completed without
//!   the target executing matching code.
//!
//! [`ThreadComm`] implements both for ranks running as threads of one
//! process, which is what the test-suite and benches drive.

use std::ops::{Deref, DerefMut};

use crate::ga_error::GaError;

pub mod thread;

pub use thread::{launch, LocalPortion, SharedPortion, ThreadComm, WorldConfig};

/// Element-wise reduction applied by [`Communicator::allreduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply(self, acc: i64, x: i64) -> i64 {
        match self {
            ReduceOp::Sum => acc.wrapping_add(x),
            ReduceOp::Min => acc.min(x),
            ReduceOp::Max => acc.max(x),
        }
    }
}

/// Process group membership and collectives. All calls are blocking and must
/// be made by every process of the group in the same order.
pub trait Communicator: Send + Sync {
    /// Id of the calling process, `0..size()`.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;
    /// Block until every process has entered the barrier. Remote effects
    /// issued before the barrier are visible to everyone after it.
    fn barrier(&self);
    /// Combine `buf` element-wise across the group; every process receives
    /// the result.
    fn allreduce(&self, buf: &mut [i64], op: ReduceOp);

    /// `true` on every process iff `ok` was `true` on every process.
    fn all_agree(&self, ok: bool) -> bool {
        let mut flag = [i64::from(ok)];
        self.allreduce(&mut flag, ReduceOp::Min);
        flag[0] == 1
    }
}

/// Identifier of a remotely accessible segment. Each process exposes at most
/// one segment per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey(u64);

impl SegmentKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// One-sided access to segments exposed by the processes of the group.
///
/// Byte offsets are relative to the start of the target's segment. Segments
/// are 8-byte aligned, so any [`Element`](crate::global::element::Element)
/// can be viewed in place.
pub trait RemoteMemory: Communicator {
    /// Exclusive view of the caller's own segment; released on drop.
    type Local: DerefMut<Target = [u8]> + Send;
    /// Shared read-only view of the caller's own segment.
    type Shared: Deref<Target = [u8]> + Send;

    /// Materialize a zero-filled local segment of `bytes` bytes under `key`.
    /// Returns `false` on resource exhaustion.
    fn expose(&self, key: SegmentKey, bytes: usize) -> bool;
    /// Release the caller's segment under `key`. Returns `false` if none.
    fn withdraw(&self, key: SegmentKey) -> bool;
    /// Copy `src` into `target`'s segment at `offset`.
    fn put(&self, key: SegmentKey, target: usize, offset: usize, src: &[u8]) -> Result<(), GaError>;
    /// Copy `dst.len()` bytes from `target`'s segment at `offset`.
    fn get(
        &self,
        key: SegmentKey,
        target: usize,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), GaError>;
    /// Atomically add `inc` to the `i64` at element `index` of `target`'s
    /// segment and return the previous value.
    fn fetch_add(
        &self,
        key: SegmentKey,
        target: usize,
        index: usize,
        inc: i64,
    ) -> Result<i64, GaError>;
    /// Direct access to the caller's own segment.
    fn access(&self, key: SegmentKey) -> Result<Self::Local, GaError>;
    /// Read-only access to the caller's own segment; several may coexist.
    fn access_shared(&self, key: SegmentKey) -> Result<Self::Shared, GaError>;
}
