//! In-process backend: every rank is a thread sharing one [`World`].
//!
//! Segments live in a shared table keyed by `(key, owner)`; each one is an
//! 8-byte aligned buffer behind its own reader-writer lock, so a `fetch_add`
//! is a genuine atomic with respect to every other access to that segment.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use super::{Communicator, ReduceOp, RemoteMemory, SegmentKey};
use crate::ga_error::GaError;

/// Shape of a simulated process group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorldConfig {
    /// Number of ranks.
    pub nproc: usize,
    /// Per-rank cap on exposed bytes; `None` is unlimited.
    pub memory_limit: Option<usize>,
}

impl WorldConfig {
    pub fn new(nproc: usize) -> Self {
        Self {
            nproc,
            memory_limit: None,
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
}

#[derive(Debug)]
struct SegmentBuf {
    len: usize,
    words: Vec<u64>,
}

impl SegmentBuf {
    fn zeroed(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(8)],
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..len]
    }

    fn range(
        &self,
        key: SegmentKey,
        rank: usize,
        offset: usize,
        n: usize,
    ) -> Result<std::ops::Range<usize>, GaError> {
        let end = offset.checked_add(n).unwrap_or(usize::MAX);
        if end > self.len {
            return Err(GaError::SegmentOverrun {
                key: key.get(),
                rank,
                offset,
                end,
                len: self.len,
            });
        }
        Ok(offset..end)
    }
}

#[derive(Debug, Default)]
struct ReduceScratch {
    arrived: usize,
    acc: Vec<i64>,
}

struct World {
    nproc: usize,
    memory_limit: Option<usize>,
    barrier: Barrier,
    reduce: Mutex<ReduceScratch>,
    segments: DashMap<(SegmentKey, usize), Arc<RwLock<SegmentBuf>>>,
    exposed: Vec<AtomicUsize>,
}

impl World {
    fn new(config: &WorldConfig) -> Self {
        let nproc = config.nproc.max(1);
        Self {
            nproc,
            memory_limit: config.memory_limit,
            barrier: Barrier::new(nproc),
            reduce: Mutex::new(ReduceScratch::default()),
            segments: DashMap::new(),
            exposed: (0..nproc).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn segment(&self, key: SegmentKey, rank: usize) -> Result<Arc<RwLock<SegmentBuf>>, GaError> {
        self.segments
            .get(&(key, rank))
            .map(|s| Arc::clone(s.value()))
            .ok_or(GaError::SegmentMissing {
                key: key.get(),
                rank,
            })
    }
}

/// Rank-local endpoint into a shared in-process world.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    world: Arc<World>,
}

static_assertions::assert_impl_all!(ThreadComm: Send, Sync, Clone);

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.world.nproc)
            .finish()
    }
}

impl ThreadComm {
    /// Single-rank world, for serial use.
    pub fn serial() -> Self {
        Self::world(&WorldConfig::new(1)).remove(0)
    }

    /// One endpoint per rank of a fresh world, in rank order.
    pub fn world(config: &WorldConfig) -> Vec<Self> {
        let world = Arc::new(World::new(config));
        (0..world.nproc)
            .map(|rank| Self {
                rank,
                world: Arc::clone(&world),
            })
            .collect()
    }

    /// Bytes currently exposed by this rank.
    pub fn exposed_bytes(&self) -> usize {
        self.world.exposed[self.rank].load(Ordering::Acquire)
    }

    fn check_rank(&self, target: usize, op: &'static str) -> Result<(), GaError> {
        if target >= self.world.nproc {
            return Err(GaError::RankOutOfRange {
                op,
                rank: target,
                size: self.world.nproc,
            });
        }
        Ok(())
    }
}

/// Run `f` on every rank of a new world and collect the results by rank.
///
/// A panic on any rank is re-raised once all ranks have been joined.
pub fn launch<R, F>(config: WorldConfig, f: F) -> Vec<R>
where
    F: Fn(ThreadComm) -> R + Sync,
    R: Send,
{
    let comms = ThreadComm::world(&config);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.nproc
    }

    fn barrier(&self) {
        self.world.barrier.wait();
    }

    fn allreduce(&self, buf: &mut [i64], op: ReduceOp) {
        {
            let mut s = self.world.reduce.lock();
            if s.arrived == 0 {
                s.acc.clear();
                s.acc.extend_from_slice(buf);
            } else {
                for (acc, &x) in s.acc.iter_mut().zip(buf.iter()) {
                    *acc = op.apply(*acc, x);
                }
            }
            s.arrived += 1;
        }
        self.world.barrier.wait();
        {
            let s = self.world.reduce.lock();
            let n = buf.len().min(s.acc.len());
            buf[..n].copy_from_slice(&s.acc[..n]);
        }
        if self.world.barrier.wait().is_leader() {
            self.world.reduce.lock().arrived = 0;
        }
        self.world.barrier.wait();
    }
}

/// Exclusive guard over a rank's own segment.
pub struct LocalPortion {
    guard: ArcRwLockWriteGuard<RawRwLock, SegmentBuf>,
}

/// Shared read guard over a rank's own segment.
pub struct SharedPortion {
    guard: ArcRwLockReadGuard<RawRwLock, SegmentBuf>,
}

static_assertions::assert_impl_all!(LocalPortion: Send);
static_assertions::assert_impl_all!(SharedPortion: Send);

impl Deref for SharedPortion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.bytes()
    }
}

impl Deref for LocalPortion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.bytes()
    }
}

impl DerefMut for LocalPortion {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.bytes_mut()
    }
}

impl RemoteMemory for ThreadComm {
    type Local = LocalPortion;
    type Shared = SharedPortion;

    fn expose(&self, key: SegmentKey, bytes: usize) -> bool {
        let slot = (key, self.rank);
        if self.world.segments.contains_key(&slot) {
            log::warn!("rank {}: segment {:#x} already exposed", self.rank, key.get());
            return false;
        }
        let used = &self.world.exposed[self.rank];
        if let Some(limit) = self.world.memory_limit {
            if used.load(Ordering::Acquire).saturating_add(bytes) > limit {
                log::warn!(
                    "rank {}: exposing {bytes} bytes would exceed limit of {limit}",
                    self.rank
                );
                return false;
            }
        }
        used.fetch_add(bytes, Ordering::AcqRel);
        self.world
            .segments
            .insert(slot, Arc::new(RwLock::new(SegmentBuf::zeroed(bytes))));
        true
    }

    fn withdraw(&self, key: SegmentKey) -> bool {
        match self.world.segments.remove(&(key, self.rank)) {
            Some((_, seg)) => {
                let len = seg.read().len;
                self.world.exposed[self.rank].fetch_sub(len, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn put(
        &self,
        key: SegmentKey,
        target: usize,
        offset: usize,
        src: &[u8],
    ) -> Result<(), GaError> {
        self.check_rank(target, "put")?;
        let seg = self.world.segment(key, target)?;
        let mut buf = seg.write();
        let range = buf.range(key, target, offset, src.len())?;
        buf.bytes_mut()[range].copy_from_slice(src);
        Ok(())
    }

    fn get(
        &self,
        key: SegmentKey,
        target: usize,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), GaError> {
        self.check_rank(target, "get")?;
        let seg = self.world.segment(key, target)?;
        let buf = seg.read();
        let range = buf.range(key, target, offset, dst.len())?;
        dst.copy_from_slice(&buf.bytes()[range]);
        Ok(())
    }

    fn fetch_add(
        &self,
        key: SegmentKey,
        target: usize,
        index: usize,
        inc: i64,
    ) -> Result<i64, GaError> {
        self.check_rank(target, "fetch_add")?;
        let seg = self.world.segment(key, target)?;
        let mut buf = seg.write();
        let width = std::mem::size_of::<i64>();
        let range = buf.range(key, target, index * width, width)?;
        let cell: &mut i64 = bytemuck::from_bytes_mut(&mut buf.bytes_mut()[range]);
        let old = *cell;
        *cell = old.wrapping_add(inc);
        Ok(old)
    }

    fn access(&self, key: SegmentKey) -> Result<LocalPortion, GaError> {
        let seg = self.world.segment(key, self.rank)?;
        Ok(LocalPortion {
            guard: seg.write_arc(),
        })
    }

    fn access_shared(&self, key: SegmentKey) -> Result<SharedPortion, GaError> {
        let seg = self.world.segment(key, self.rank)?;
        Ok(SharedPortion {
            guard: seg.read_arc(),
        })
    }
}
