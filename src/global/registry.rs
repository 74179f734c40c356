//! Distributed array registry and one-sided array operations.
//!
//! A [`GlobalArrays`] instance lives on every process. Handle creation,
//! `set_data`, `allocate`, `zero` and `destroy` are collective: every process
//! issues them in the same order, so handles agree everywhere. `put`, `get`
//! and `read_inc` are one-sided and may target any process's block.
//!
//! Lifecycle of an array: created (no data) → dimensions/distribution set →
//! allocated (local block exposed as a remote segment) → destroyed.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::comm::{RemoteMemory, SegmentKey};
use crate::config::GaConfig;
use crate::debug_invariants::DebugInvariants;
use crate::ga_error::GaError;
use crate::global::distribution::{Distribution, MAX_DIM, Patch};
use crate::global::element::{Element, ElementType};
use crate::handle::{Handle, SlotArena};

/// Key-space tag of segments backing distributed arrays.
const ARRAY_SEGMENT_TAG: u64 = 1 << 63;

/// Registry entry of one distributed array.
#[derive(Debug, Default)]
pub struct GlobalArray {
    dims: Vec<usize>,
    ty: Option<ElementType>,
    irregular: Option<Distribution>,
    chunk: Vec<usize>,
    layout: Option<Distribution>,
}

impl GlobalArray {
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_type(&self) -> Option<ElementType> {
        self.ty
    }

    /// Active distribution; `None` until allocated.
    pub fn layout(&self) -> Option<&Distribution> {
        self.layout.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.layout.is_some()
    }
}

pub type GaHandle = Handle<GlobalArray>;

fn segment_key(h: GaHandle) -> SegmentKey {
    SegmentKey::new(ARRAY_SEGMENT_TAG | (h.to_bits() & !ARRAY_SEGMENT_TAG))
}

/// Typed, exclusive view of the calling process's block of an array.
/// Dropping it releases the block.
pub struct LocalView<T, L> {
    portion: L,
    _marker: PhantomData<T>,
}

impl<T: Element, L: Deref<Target = [u8]>> Deref for LocalView<T, L> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        bytemuck::cast_slice(&*self.portion)
    }
}

impl<T: Element, L: DerefMut<Target = [u8]>> DerefMut for LocalView<T, L> {
    fn deref_mut(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut *self.portion)
    }
}

/// Process-local registry of distributed arrays bound to a communicator.
pub struct GlobalArrays<C: RemoteMemory> {
    comm: C,
    config: GaConfig,
    arrays: SlotArena<GlobalArray>,
}

impl<C: RemoteMemory> GlobalArrays<C> {
    pub fn new(comm: C, config: GaConfig) -> Self {
        let arrays = SlotArena::with_capacity(config.max_arrays);
        Self {
            comm,
            config,
            arrays,
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &GaConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn nproc(&self) -> usize {
        self.comm.size()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Reserve a handle for a new, inactive array.
    pub fn create_handle(&mut self) -> Result<GaHandle, GaError> {
        self.arrays.insert(GlobalArray::default(), "create_handle")
    }

    /// Set extents and element type. Every extent must be at least 1.
    pub fn set_data(
        &mut self,
        h: GaHandle,
        dims: &[usize],
        ty: ElementType,
    ) -> Result<(), GaError> {
        const OP: &str = "set_data";
        if dims.is_empty() || dims.len() > MAX_DIM {
            return Err(GaError::InvalidDimension { op: OP, dim: dims.len() });
        }
        if let Some(&d) = dims.iter().find(|&&d| d == 0) {
            return Err(GaError::InvalidDimension { op: OP, dim: d });
        }
        let a = self.unallocated_mut(h, OP)?;
        a.dims = dims.to_vec();
        a.ty = Some(ty);
        a.irregular = None;
        a.chunk.clear();
        Ok(())
    }

    /// Minimum block extent per axis for the default distribution. A zero
    /// entry leaves that axis unconstrained; an explicit irregular
    /// distribution takes precedence.
    pub fn set_chunk(&mut self, h: GaHandle, chunk: &[usize]) -> Result<(), GaError> {
        const OP: &str = "set_chunk";
        let a = self.unallocated_mut(h, OP)?;
        if a.ty.is_none() {
            return Err(GaError::NotActive {
                op: OP,
                handle: h.to_string(),
            });
        }
        if chunk.len() != a.dims.len() {
            return Err(GaError::InvalidDimension {
                op: OP,
                dim: chunk.len(),
            });
        }
        a.chunk = chunk.to_vec();
        Ok(())
    }

    /// Replace the default distribution with explicit block boundaries.
    /// See [`Distribution::irregular`] for the map layout.
    pub fn set_irregular_distribution(
        &mut self,
        h: GaHandle,
        map: &[usize],
        nblocks: &[usize],
    ) -> Result<(), GaError> {
        const OP: &str = "set_irregular_distribution";
        let nproc = self.nproc();
        let a = self.unallocated_mut(h, OP)?;
        if a.ty.is_none() {
            return Err(GaError::NotActive {
                op: OP,
                handle: h.to_string(),
            });
        }
        a.irregular = Some(Distribution::irregular(&a.dims, map, nblocks, nproc)?);
        Ok(())
    }

    /// Create a one-dimensional array whose block on process `p` holds
    /// `counts[p]` elements. The total may be zero. Collective.
    pub(crate) fn create_irregular(
        &mut self,
        ty: ElementType,
        counts: &[usize],
    ) -> Result<(GaHandle, bool), GaError> {
        let layout = Distribution::from_counts(counts);
        let h = self.arrays.insert(
            GlobalArray {
                dims: layout.dims().to_vec(),
                ty: Some(ty),
                irregular: Some(layout),
                chunk: Vec::new(),
                layout: None,
            },
            "create_handle",
        )?;
        match self.allocate(h) {
            Ok(ok) => Ok((h, ok)),
            Err(e) => {
                self.discard(h);
                Err(e)
            }
        }
    }

    /// Drop an array on this process only, without synchronizing with the
    /// group. Used to unwind after an error; stale handles are ignored.
    pub(crate) fn discard(&mut self, h: GaHandle) {
        let Some(a) = self.arrays.get(h) else {
            return;
        };
        if a.is_allocated() && !self.comm.withdraw(segment_key(h)) {
            log::warn!("rank {}: segment of array {h} was already gone", self.rank());
        }
        self.arrays.remove(h);
    }

    /// Materialize the local block as a remotely accessible segment.
    /// Collective. `Ok(false)` on resource exhaustion; the array then stays
    /// unallocated on this process.
    pub fn allocate(&mut self, h: GaHandle) -> Result<bool, GaError> {
        const OP: &str = "allocate";
        let nproc = self.nproc();
        let me = self.rank();
        let (ty, layout) = {
            let a = self.unallocated_mut(h, OP)?;
            let ty = a.ty.ok_or_else(|| GaError::NotActive {
                op: OP,
                handle: h.to_string(),
            })?;
            let layout = a
                .irregular
                .clone()
                .unwrap_or_else(|| Distribution::chunked(&a.dims, &a.chunk, nproc));
            (ty, layout)
        };
        crate::debug_invariants!(layout.validate_invariants(), "array layout");
        let bytes = layout.local_len(me) * ty.size();
        let ok = self.comm.expose(segment_key(h), bytes);
        if ok {
            self.arrays.try_get_mut(h, OP)?.layout = Some(layout);
        } else {
            log::warn!("rank {me}: allocate {h} failed for {bytes} bytes");
        }
        self.comm.barrier();
        Ok(ok)
    }

    /// Withdraw the local block but keep the array's handle and data, so a
    /// later `allocate` may try again. Unallocated arrays are left alone.
    pub(crate) fn release_storage(&mut self, h: GaHandle) -> Result<(), GaError> {
        let a = self.arrays.try_get_mut(h, "release_storage")?;
        let had = a.layout.take().is_some();
        if had && !self.comm.withdraw(segment_key(h)) {
            log::warn!("rank {}: segment of array {h} was already gone", self.rank());
        }
        Ok(())
    }

    /// Fill the local block with zero bytes. Collective.
    pub fn zero(&mut self, h: GaHandle) -> Result<(), GaError> {
        self.allocated(h, "zero")?;
        self.comm.access(segment_key(h))?.fill(0);
        self.comm.barrier();
        Ok(())
    }

    /// Release storage and retire the handle. Collective once data has been
    /// set: waits for all processes before the local block is withdrawn, even
    /// where allocation failed.
    pub fn destroy(&mut self, h: GaHandle) -> Result<bool, GaError> {
        let a = self.arrays.try_get(h, "destroy")?;
        let mut ok = true;
        if a.ty.is_some() {
            self.comm.barrier();
        }
        if a.is_allocated() {
            ok = self.comm.withdraw(segment_key(h));
        }
        self.arrays.remove(h);
        Ok(ok)
    }

    /// Destroy every live array.
    pub fn terminate(&mut self) -> Result<bool, GaError> {
        let mut ok = true;
        for h in self.arrays.handles() {
            ok &= self.destroy(h)?;
        }
        Ok(ok)
    }

    pub fn array(&self, h: GaHandle) -> Result<&GlobalArray, GaError> {
        self.arrays.try_get(h, "inquire")
    }

    pub fn ndim(&self, h: GaHandle) -> Result<usize, GaError> {
        Ok(self.array(h)?.dims.len())
    }

    pub fn dims(&self, h: GaHandle) -> Result<Vec<usize>, GaError> {
        Ok(self.array(h)?.dims.clone())
    }

    pub fn element_type(&self, h: GaHandle) -> Result<ElementType, GaError> {
        self.array(h)?.ty.ok_or_else(|| GaError::NotActive {
            op: "element_type",
            handle: h.to_string(),
        })
    }

    /// Patch held by `proc`, `None` if it holds no block.
    pub fn distribution(&self, h: GaHandle, proc: usize) -> Result<Option<Patch>, GaError> {
        if proc >= self.nproc() {
            return Err(GaError::RankOutOfRange {
                op: "distribution",
                rank: proc,
                size: self.nproc(),
            });
        }
        Ok(self.allocated(h, "distribution")?.patch(proc))
    }

    /// Process owning `subscript`.
    pub fn locate(&self, h: GaHandle, subscript: &[usize]) -> Result<usize, GaError> {
        let layout = self.allocated(h, "locate")?;
        check_subscript(layout, subscript, "locate")?;
        Ok(layout.owner(subscript))
    }

    /// Write `buf` (column-major) into `patch`, wherever its elements live.
    pub fn put<T: Element>(&self, h: GaHandle, patch: &Patch, buf: &[T]) -> Result<(), GaError> {
        self.check_type::<T>(h, "put")?;
        self.put_bytes(h, patch, bytemuck::cast_slice(buf))
    }

    /// Read `patch` (column-major) into `buf`.
    pub fn get<T: Element>(
        &self,
        h: GaHandle,
        patch: &Patch,
        buf: &mut [T],
    ) -> Result<(), GaError> {
        self.check_type::<T>(h, "get")?;
        self.get_bytes(h, patch, bytemuck::cast_slice_mut(buf))
    }

    pub(crate) fn put_bytes(
        &self,
        h: GaHandle,
        patch: &Patch,
        bytes: &[u8],
    ) -> Result<(), GaError> {
        self.transfer(h, patch, bytes.len(), "put", |owner, remote, local, n| {
            self.comm.put(segment_key(h), owner, remote, &bytes[local..local + n])
        })
    }

    pub(crate) fn get_bytes(
        &self,
        h: GaHandle,
        patch: &Patch,
        bytes: &mut [u8],
    ) -> Result<(), GaError> {
        let len = bytes.len();
        self.transfer(h, patch, len, "get", |owner, remote, local, n| {
            self.comm.get(segment_key(h), owner, remote, &mut bytes[local..local + n])
        })
    }

    /// Split `patch` by owner and hand every contiguous run to `io` as
    /// `(owner, remote byte offset, buffer byte offset, byte count)`.
    fn transfer(
        &self,
        h: GaHandle,
        patch: &Patch,
        buf_len: usize,
        op: &'static str,
        mut io: impl FnMut(usize, usize, usize, usize) -> Result<(), GaError>,
    ) -> Result<(), GaError> {
        let layout = self.allocated(h, op)?;
        let es = self.element_type(h)?.size();
        check_patch(layout, patch, op)?;
        if buf_len != patch.volume() * es {
            return Err(GaError::InvalidDimension {
                op,
                dim: buf_len / es.max(1),
            });
        }
        for (owner, overlap) in layout.owners_of(patch) {
            let Some(block) = layout.patch(owner) else {
                continue;
            };
            let run = overlap.hi[0] - overlap.lo[0];
            let mut result = Ok(());
            overlap.for_each_run(|start| {
                if result.is_ok() {
                    result = io(
                        owner,
                        block.offset_of(start) * es,
                        patch.offset_of(start) * es,
                        run * es,
                    );
                }
            });
            result?;
        }
        Ok(())
    }

    /// Atomically add `inc` to a `Long` element and return its previous value.
    pub fn read_inc(&self, h: GaHandle, subscript: &[usize], inc: i64) -> Result<i64, GaError> {
        const OP: &str = "read_inc";
        self.check_type::<i64>(h, OP)?;
        let layout = self.allocated(h, OP)?;
        check_subscript(layout, subscript, OP)?;
        let owner = layout.owner(subscript);
        let index = layout
            .patch(owner)
            .map_or(0, |block| block.offset_of(subscript));
        self.comm.fetch_add(segment_key(h), owner, index, inc)
    }

    /// Direct access to the local block. Other processes' one-sided
    /// operations on this block wait until the view is dropped.
    pub fn access_local<T: Element>(&self, h: GaHandle) -> Result<LocalView<T, C::Local>, GaError> {
        self.check_type::<T>(h, "access_local")?;
        self.allocated(h, "access_local")?;
        Ok(LocalView {
            portion: self.comm.access(segment_key(h))?,
            _marker: PhantomData,
        })
    }

    /// Untyped access to the local block.
    pub(crate) fn access_bytes(&self, h: GaHandle) -> Result<C::Local, GaError> {
        self.allocated(h, "access_local")?;
        self.comm.access(segment_key(h))
    }

    /// Shared read-only access to the local block.
    pub(crate) fn access_shared_bytes(&self, h: GaHandle) -> Result<C::Shared, GaError> {
        self.allocated(h, "access_local")?;
        self.comm.access_shared(segment_key(h))
    }

    fn check_type<T: Element>(&self, h: GaHandle, op: &'static str) -> Result<(), GaError> {
        let ty = self.element_type(h)?;
        if ty != T::TYPE {
            return Err(GaError::TypeMismatch {
                op,
                expected: ty,
                got: T::TYPE,
            });
        }
        Ok(())
    }

    fn allocated(&self, h: GaHandle, op: &'static str) -> Result<&Distribution, GaError> {
        self.arrays
            .try_get(h, op)?
            .layout
            .as_ref()
            .ok_or_else(|| GaError::NotAllocated {
                op,
                handle: h.to_string(),
            })
    }

    fn unallocated_mut(
        &mut self,
        h: GaHandle,
        op: &'static str,
    ) -> Result<&mut GlobalArray, GaError> {
        let a = self.arrays.try_get_mut(h, op)?;
        if a.is_allocated() {
            return Err(GaError::AlreadyAllocated {
                op,
                handle: h.to_string(),
            });
        }
        Ok(a)
    }
}

fn check_subscript(
    layout: &Distribution,
    subscript: &[usize],
    op: &'static str,
) -> Result<(), GaError> {
    let dims = layout.dims();
    if subscript.len() != dims.len() || subscript.iter().zip(dims).any(|(&s, &d)| s >= d) {
        return Err(GaError::IndexOutOfRange {
            op,
            index: subscript.to_vec(),
            dims: dims.to_vec(),
        });
    }
    Ok(())
}

fn check_patch(layout: &Distribution, patch: &Patch, op: &'static str) -> Result<(), GaError> {
    let dims = layout.dims();
    let fits = patch.ndim() == dims.len()
        && patch.hi.len() == dims.len()
        && patch
            .lo
            .iter()
            .zip(&patch.hi)
            .zip(dims)
            .all(|((&l, &h), &d)| l <= h && h <= d);
    if !fits {
        return Err(GaError::IndexOutOfRange {
            op,
            index: patch.hi.clone(),
            dims: dims.to_vec(),
        });
    }
    Ok(())
}
