//! Global pointer arrays: distributed arrays of remote memory descriptors.
//!
//! Every element pairs a byte size with a [`MemDescriptor`] naming a
//! remotely readable allocation on the element's owning process. Only the
//! owner assigns or clears an element; any process may dereference it.
//!
//! Allocations made through [`PointerArrays::malloc`] are tracked by the
//! registry and handed out as explicit [`RemoteAllocation`] records.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::comm::{RemoteMemory, SegmentKey};
use crate::ga_error::GaError;
use crate::global::distribution::{MAX_DIM, Patch};
use crate::global::element::{Element, ElementType};
use crate::global::registry::{GaHandle, GlobalArrays};
use crate::handle::{Handle, SlotArena};

/// Key-space tag of segments created by [`PointerArrays::malloc`].
const MALLOC_SEGMENT_TAG: u64 = 1 << 62;

/// Location of a remotely readable allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct MemDescriptor {
    /// Rank holding the bytes.
    pub owner: u64,
    /// Segment key on `owner`.
    pub key: u64,
    /// Length in bytes.
    pub size: u64,
    /// Nonzero while the descriptor refers to an assigned allocation.
    pub live: u64,
}

const_assert_eq!(std::mem::size_of::<MemDescriptor>(), 32);

impl Element for MemDescriptor {
    const TYPE: ElementType = ElementType::Opaque(32);
}

impl MemDescriptor {
    pub fn is_live(&self) -> bool {
        self.live != 0
    }
}

/// Record of one allocation made by [`PointerArrays::malloc`].
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteAllocation {
    descriptor: MemDescriptor,
}

impl RemoteAllocation {
    pub fn descriptor(&self) -> MemDescriptor {
        self.descriptor
    }

    pub fn len(&self) -> usize {
        self.descriptor.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.size == 0
    }
}

/// Registry entry: a size array and a descriptor array of identical shape.
#[derive(Debug)]
pub struct PointerArray {
    dims: Vec<usize>,
    g_size: GaHandle,
    g_ptr: GaHandle,
}

pub type GpHandle = Handle<PointerArray>;

/// Process-local registry of pointer arrays and of this process's remote
/// allocations.
#[derive(Debug)]
pub struct PointerArrays {
    arrays: SlotArena<PointerArray>,
    allocations: HashMap<u64, usize>,
    next_alloc: u64,
}

impl PointerArrays {
    pub fn new<C: RemoteMemory>(ga: &GlobalArrays<C>) -> Self {
        Self {
            arrays: SlotArena::with_capacity(ga.config().max_pointer_arrays),
            allocations: HashMap::new(),
            next_alloc: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Reserve a pointer array handle along with its two backing arrays.
    pub fn create_handle<C: RemoteMemory>(
        &mut self,
        ga: &mut GlobalArrays<C>,
    ) -> Result<GpHandle, GaError> {
        let g_size = ga.create_handle()?;
        let g_ptr = match ga.create_handle() {
            Ok(g_ptr) => g_ptr,
            Err(e) => {
                ga.discard(g_size);
                return Err(e);
            }
        };
        let record = PointerArray {
            dims: Vec::new(),
            g_size,
            g_ptr,
        };
        self.arrays.insert(record, "gp_create_handle").inspect_err(|_| {
            ga.discard(g_size);
            ga.discard(g_ptr);
        })
    }

    pub fn set_dimensions<C: RemoteMemory>(
        &mut self,
        h: GpHandle,
        dims: &[usize],
        ga: &mut GlobalArrays<C>,
    ) -> Result<(), GaError> {
        const OP: &str = "gp_set_dimensions";
        if dims.is_empty() || dims.len() > MAX_DIM {
            return Err(GaError::InvalidDimension { op: OP, dim: dims.len() });
        }
        let a = self.arrays.try_get_mut(h, OP)?;
        ga.set_data(a.g_size, dims, ElementType::Int)?;
        ga.set_data(a.g_ptr, dims, MemDescriptor::TYPE)?;
        a.dims = dims.to_vec();
        Ok(())
    }

    /// Minimum block extent per axis of both backing arrays.
    pub fn set_chunk<C: RemoteMemory>(
        &mut self,
        h: GpHandle,
        chunk: &[usize],
        ga: &mut GlobalArrays<C>,
    ) -> Result<(), GaError> {
        let a = self.arrays.try_get(h, "gp_set_chunk")?;
        ga.set_chunk(a.g_size, chunk)?;
        ga.set_chunk(a.g_ptr, chunk)
    }

    /// Number of axes.
    pub fn dimension(&self, h: GpHandle) -> Result<usize, GaError> {
        Ok(self.arrays.try_get(h, "gp_dimension")?.dims.len())
    }

    pub fn dims(&self, h: GpHandle) -> Result<&[usize], GaError> {
        Ok(&self.arrays.try_get(h, "gp_dims")?.dims)
    }

    /// Allocate and zero both backing arrays. Collective; fails on every
    /// process if any process runs out of memory.
    pub fn allocate<C: RemoteMemory>(
        &mut self,
        h: GpHandle,
        ga: &mut GlobalArrays<C>,
    ) -> Result<(), GaError> {
        const OP: &str = "gp_allocate";
        let a = self.arrays.try_get(h, OP)?;
        let (g_size, g_ptr) = (a.g_size, a.g_ptr);
        let ok_size = ga.allocate(g_size)?;
        let ok_ptr = ga.allocate(g_ptr)?;
        if !ga.comm().all_agree(ok_size && ok_ptr) {
            ga.release_storage(g_size)?;
            ga.release_storage(g_ptr)?;
            let elems: usize = a.dims.iter().product();
            return Err(GaError::AllocationFailure {
                op: OP,
                bytes: elems * (ElementType::Int.size() + MemDescriptor::TYPE.size()),
            });
        }
        ga.zero(g_size)?;
        ga.zero(g_ptr)?;
        Ok(())
    }

    /// Release both backing arrays and retire the handle. Allocations the
    /// elements point to stay alive.
    pub fn destroy<C: RemoteMemory>(
        &mut self,
        h: GpHandle,
        ga: &mut GlobalArrays<C>,
    ) -> Result<bool, GaError> {
        let a = self.arrays.try_get(h, "gp_destroy")?;
        let ok = ga.destroy(a.g_size)? & ga.destroy(a.g_ptr)?;
        self.arrays.remove(h);
        Ok(ok)
    }

    /// Destroy every pointer array and free this process's allocations.
    pub fn terminate<C: RemoteMemory>(
        &mut self,
        ga: &mut GlobalArrays<C>,
    ) -> Result<bool, GaError> {
        let mut ok = true;
        for h in self.arrays.handles() {
            ok &= self.destroy(h, ga)?;
        }
        for (key, _) in self.allocations.drain() {
            ok &= ga.comm().withdraw(SegmentKey::new(key));
        }
        Ok(ok)
    }

    /// Patch of the array held by `proc`.
    pub fn distribution<C: RemoteMemory>(
        &self,
        h: GpHandle,
        proc: usize,
        ga: &GlobalArrays<C>,
    ) -> Result<Option<Patch>, GaError> {
        ga.distribution(self.arrays.try_get(h, "gp_distribution")?.g_ptr, proc)
    }

    /// Allocate `bytes` of zeroed memory readable by every process.
    pub fn malloc<C: RemoteMemory>(
        &mut self,
        bytes: usize,
        ga: &GlobalArrays<C>,
    ) -> Result<RemoteAllocation, GaError> {
        const OP: &str = "gp_malloc";
        if i32::try_from(bytes).is_err() {
            return Err(GaError::AllocationFailure { op: OP, bytes });
        }
        let key = MALLOC_SEGMENT_TAG | self.next_alloc;
        if !ga.comm().expose(SegmentKey::new(key), bytes) {
            return Err(GaError::AllocationFailure { op: OP, bytes });
        }
        self.next_alloc += 1;
        self.allocations.insert(key, bytes);
        Ok(RemoteAllocation {
            descriptor: MemDescriptor {
                owner: ga.rank() as u64,
                key,
                size: bytes as u64,
                live: 1,
            },
        })
    }

    /// Exclusive access to the bytes of one of this process's allocations.
    pub fn access_allocation<C: RemoteMemory>(
        &self,
        alloc: &RemoteAllocation,
        ga: &GlobalArrays<C>,
    ) -> Result<C::Local, GaError> {
        let key = self.owned_key(&alloc.descriptor, ga, "gp_access_allocation")?;
        ga.comm().access(SegmentKey::new(key))
    }

    /// Release an allocation made by this process.
    pub fn free<C: RemoteMemory>(
        &mut self,
        descriptor: MemDescriptor,
        ga: &GlobalArrays<C>,
    ) -> Result<(), GaError> {
        let key = self.owned_key(&descriptor, ga, "gp_free")?;
        self.allocations.remove(&key);
        if !ga.comm().withdraw(SegmentKey::new(key)) {
            return Err(GaError::InvalidPointer { op: "gp_free" });
        }
        Ok(())
    }

    /// Point element `subscript` at `alloc`. The element must be local.
    pub fn assign_local_element<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        alloc: &RemoteAllocation,
        ga: &GlobalArrays<C>,
    ) -> Result<(), GaError> {
        const OP: &str = "gp_assign_local_element";
        let a = self.local_element(h, subscript, ga, OP)?;
        self.owned_key(&alloc.descriptor, ga, OP)?;
        let at = point(subscript);
        ga.put(a.g_size, &at, &[alloc.len() as i32])?;
        ga.put(a.g_ptr, &at, &[alloc.descriptor])?;
        Ok(())
    }

    /// Clear element `subscript` and return the descriptor it held. The
    /// allocation itself is not freed.
    pub fn free_local_element<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        ga: &GlobalArrays<C>,
    ) -> Result<MemDescriptor, GaError> {
        let a = self.local_element(h, subscript, ga, "gp_free_local_element")?;
        let at = point(subscript);
        let mut old = [MemDescriptor::default()];
        ga.get(a.g_ptr, &at, &mut old)?;
        ga.put(a.g_ptr, &at, &[MemDescriptor::default()])?;
        ga.put(a.g_size, &at, &[0i32])?;
        Ok(old[0])
    }

    /// Byte size recorded for element `subscript`; zero if unassigned.
    pub fn get_size<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        ga: &GlobalArrays<C>,
    ) -> Result<usize, GaError> {
        let a = self.arrays.try_get(h, "gp_get_size")?;
        let mut size = [0i32];
        ga.get(a.g_size, &point(subscript), &mut size)?;
        Ok(size[0] as usize)
    }

    pub fn get_descriptor<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        ga: &GlobalArrays<C>,
    ) -> Result<MemDescriptor, GaError> {
        let a = self.arrays.try_get(h, "gp_get_descriptor")?;
        let mut d = [MemDescriptor::default()];
        ga.get(a.g_ptr, &point(subscript), &mut d)?;
        Ok(d[0])
    }

    /// Fetch the bytes element `subscript` points to, wherever they live.
    pub fn read_element<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        ga: &GlobalArrays<C>,
    ) -> Result<Vec<u8>, GaError> {
        let d = self.get_descriptor(h, subscript, ga)?;
        if !d.is_live() {
            return Err(GaError::InvalidPointer { op: "gp_read_element" });
        }
        let mut buf = vec![0u8; d.size as usize];
        ga.comm().get(SegmentKey::new(d.key), d.owner as usize, 0, &mut buf)?;
        Ok(buf)
    }

    /// Sum of all element sizes.
    pub fn total_size<C: RemoteMemory>(
        &self,
        h: GpHandle,
        ga: &GlobalArrays<C>,
    ) -> Result<usize, GaError> {
        let a = self.arrays.try_get(h, "gp_total_size")?;
        let whole = Patch::new(vec![0; a.dims.len()], a.dims.clone());
        let mut sizes = vec![0i32; whole.volume()];
        ga.get(a.g_size, &whole, &mut sizes)?;
        Ok(sizes.iter().map(|&s| s as usize).sum())
    }

    fn local_element<C: RemoteMemory>(
        &self,
        h: GpHandle,
        subscript: &[usize],
        ga: &GlobalArrays<C>,
        op: &'static str,
    ) -> Result<&PointerArray, GaError> {
        let a = self.arrays.try_get(h, op)?;
        let local = ga.distribution(a.g_ptr, ga.rank())?;
        match local {
            Some(p) if p.contains(subscript) => Ok(a),
            Some(p) => Err(GaError::OutOfBounds {
                op,
                subscript: subscript.to_vec(),
                lo: p.lo,
                hi: p.hi,
            }),
            None => Err(GaError::OutOfBounds {
                op,
                subscript: subscript.to_vec(),
                lo: Vec::new(),
                hi: Vec::new(),
            }),
        }
    }

    fn owned_key<C: RemoteMemory>(
        &self,
        d: &MemDescriptor,
        ga: &GlobalArrays<C>,
        op: &'static str,
    ) -> Result<u64, GaError> {
        let ours = d.is_live()
            && d.owner == ga.rank() as u64
            && self.allocations.get(&d.key) == Some(&(d.size as usize));
        if !ours {
            return Err(GaError::InvalidPointer { op });
        }
        Ok(d.key)
    }
}

fn point(subscript: &[usize]) -> Patch {
    Patch::new(subscript.to_vec(), subscript.iter().map(|&s| s + 1).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ThreadComm, WorldConfig, launch};
    use crate::config::GaConfig;

    #[test]
    fn malloc_assign_read_free() {
        let mut ga = GlobalArrays::new(ThreadComm::serial(), GaConfig::default());
        let mut gp = PointerArrays::new(&ga);
        let h = gp.create_handle(&mut ga).unwrap();
        gp.set_dimensions(h, &[2, 2], &mut ga).unwrap();
        gp.allocate(h, &mut ga).unwrap();
        assert_eq!(gp.dimension(h).unwrap(), 2);

        let alloc = gp.malloc(5, &ga).unwrap();
        gp.access_allocation(&alloc, &ga)
            .unwrap()
            .copy_from_slice(b"hello");
        gp.assign_local_element(h, &[1, 0], &alloc, &ga).unwrap();
        assert_eq!(gp.get_size(h, &[1, 0], &ga).unwrap(), 5);
        assert_eq!(gp.total_size(h, &ga).unwrap(), 5);
        assert_eq!(gp.read_element(h, &[1, 0], &ga).unwrap(), b"hello");
        assert!(matches!(
            gp.read_element(h, &[0, 0], &ga),
            Err(GaError::InvalidPointer { .. })
        ));

        let d = gp.free_local_element(h, &[1, 0], &ga).unwrap();
        assert_eq!(d, alloc.descriptor());
        assert_eq!(gp.get_size(h, &[1, 0], &ga).unwrap(), 0);
        gp.free(d, &ga).unwrap();
        assert!(matches!(
            gp.free(d, &ga),
            Err(GaError::InvalidPointer { .. })
        ));
        assert!(gp.terminate(&mut ga).unwrap());
        assert!(ga.is_empty());
    }

    #[test]
    fn failed_allocation_can_be_retried() {
        let out = launch(WorldConfig::new(2).with_memory_limit(100), |comm| {
            let mut ga = GlobalArrays::new(comm, GaConfig::default());
            let mut gp = PointerArrays::new(&ga);
            let h = gp.create_handle(&mut ga).unwrap();
            // 3 + 3 elements: 12 size bytes fit, 96 descriptor bytes do not
            gp.set_dimensions(h, &[6], &mut ga).unwrap();
            let first = gp.allocate(h, &mut ga);
            let after_failure = ga.comm().exposed_bytes();
            // one block of 2 on rank 0: 8 + 64 bytes
            gp.set_dimensions(h, &[2], &mut ga).unwrap();
            gp.set_chunk(h, &[2], &mut ga).unwrap();
            gp.allocate(h, &mut ga).unwrap();
            let mine = gp.distribution(h, ga.rank(), &ga).unwrap();
            gp.destroy(h, &mut ga).unwrap();
            (
                matches!(first, Err(GaError::AllocationFailure { .. })),
                after_failure,
                mine,
                ga.comm().exposed_bytes(),
            )
        });
        assert_eq!(out[0], (true, 0, Some(Patch::span(0..2)), 0));
        assert_eq!(out[1], (true, 0, None, 0));
    }

    #[test]
    fn create_handle_does_not_orphan_backing_arrays() {
        for (max_arrays, max_pointer_arrays) in [(3, 4), (8, 1)] {
            let cfg = GaConfig {
                max_arrays,
                max_pointer_arrays,
                ..Default::default()
            };
            let mut ga = GlobalArrays::new(ThreadComm::serial(), cfg);
            let mut gp = PointerArrays::new(&ga);
            gp.create_handle(&mut ga).unwrap();
            assert!(matches!(
                gp.create_handle(&mut ga),
                Err(GaError::NoFreeSlots { .. })
            ));
            assert_eq!((ga.len(), gp.len()), (2, 1));
        }
    }

    #[test]
    fn rejects_bad_dimensions() {
        let mut ga = GlobalArrays::new(ThreadComm::serial(), GaConfig::default());
        let mut gp = PointerArrays::new(&ga);
        let h = gp.create_handle(&mut ga).unwrap();
        assert!(matches!(
            gp.set_dimensions(h, &[3, 0], &mut ga),
            Err(GaError::InvalidDimension { .. })
        ));
        assert!(gp.set_dimensions(h, &[1; 8], &mut ga).is_err());
    }
}
