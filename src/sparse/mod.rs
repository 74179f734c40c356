//! Distributed sparse matrices.
//!
//! A sparse array collects unordered `(i, j, value)` triples on every
//! process, then [`SparseArrays::assemble`] collectively redistributes them
//! into a two-level blocked layout: process `p` owns a contiguous row block,
//! split into column blocks by column owner, each stored CSR-style.
//!
//! ```text
//! building ──add_element──▶ building ──assemble──▶ assembled ──destroy──▶ (gone)
//! ```

pub mod access;
pub mod assemble;
pub mod bucket;
pub mod builder;

use std::marker::PhantomData;
use std::ops::Range;

use crate::comm::RemoteMemory;
use crate::config::Binning;
use crate::debug_invariants::DebugInvariants;
use crate::ga_error::GaError;
use crate::global::element::{Element, ElementType};
use crate::global::registry::GlobalArrays;
use crate::handle::{Handle, SlotArena};

pub use access::ColumnBlock;
pub use assemble::BlockEntry;
pub use builder::TripleBuffer;

use assemble::{AssembledLayout, SparseShape};

#[derive(Debug)]
enum SparseState {
    Building(TripleBuffer),
    Assembled(AssembledLayout),
}

/// Registry entry of one sparse matrix.
#[derive(Debug)]
pub struct SparseArray {
    shape: SparseShape,
    state: SparseState,
}

impl SparseArray {
    pub fn dims(&self) -> (usize, usize) {
        (self.shape.idim, self.shape.jdim)
    }

    pub fn element_type(&self) -> ElementType {
        self.shape.ty
    }

    pub fn is_assembled(&self) -> bool {
        matches!(self.state, SparseState::Assembled(_))
    }
}

pub type SparseHandle = Handle<SparseArray>;

/// Process-local registry of sparse arrays.
///
/// Storage of assembled arrays lives in a [`GlobalArrays`] registry, which is
/// passed to every operation that touches it.
#[derive(Debug)]
pub struct SparseArrays {
    arrays: SlotArena<SparseArray>,
    nproc: usize,
    binning: Binning,
    initial_capacity: usize,
}

impl SparseArrays {
    /// Sparse registry sized and configured after `ga`.
    pub fn new<C: RemoteMemory>(ga: &GlobalArrays<C>) -> Self {
        let config = ga.config();
        Self {
            arrays: SlotArena::with_capacity(config.max_sparse_arrays),
            nproc: ga.nproc(),
            binning: config.binning,
            initial_capacity: config.initial_capacity,
        }
    }

    /// Number of live sparse arrays.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// New `idim × jdim` array of `T`, ready to accept triples.
    pub fn create<T: Element>(
        &mut self,
        idim: usize,
        jdim: usize,
    ) -> Result<SparseHandle, GaError> {
        self.create_typed(idim, jdim, T::TYPE)
    }

    pub fn create_typed(
        &mut self,
        idim: usize,
        jdim: usize,
        ty: ElementType,
    ) -> Result<SparseHandle, GaError> {
        const OP: &str = "sparse_create";
        for dim in [idim, jdim] {
            if dim == 0 {
                return Err(GaError::InvalidDimension { op: OP, dim });
            }
        }
        let shape = SparseShape { idim, jdim, ty };
        let buf = TripleBuffer::new(ty, self.initial_capacity);
        let h = self.arrays.insert(
            SparseArray {
                shape,
                state: SparseState::Building(buf),
            },
            OP,
        )?;
        log::debug!("created sparse array {h}: {idim}x{jdim} {ty:?}");
        Ok(h)
    }

    /// Record element `(i, j) = value` on the calling process. Duplicates
    /// are kept as separate entries.
    pub fn add_element<T: Element>(
        &mut self,
        h: SparseHandle,
        i: usize,
        j: usize,
        value: T,
    ) -> Result<(), GaError> {
        const OP: &str = "sparse_add_element";
        let a = self.arrays.try_get_mut(h, OP)?;
        let SparseShape { idim, jdim, ty } = a.shape;
        let SparseState::Building(buf) = &mut a.state else {
            return Err(GaError::AlreadyAssembled {
                op: OP,
                handle: h.to_string(),
            });
        };
        if i >= idim || j >= jdim {
            return Err(GaError::IndexOutOfRange {
                op: OP,
                index: vec![i, j],
                dims: vec![idim, jdim],
            });
        }
        if T::TYPE != ty {
            return Err(GaError::TypeMismatch {
                op: OP,
                expected: ty,
                got: T::TYPE,
            });
        }
        buf.push(i, j, value);
        Ok(())
    }

    /// Convert the accumulated triples into the distributed blocked layout.
    /// Collective over every process holding `h`.
    ///
    /// `Ok(false)` if distributed storage could not be obtained; the array
    /// then stays in the building state with its triples intact.
    pub fn assemble<C: RemoteMemory>(
        &mut self,
        h: SparseHandle,
        ga: &mut GlobalArrays<C>,
    ) -> Result<bool, GaError> {
        const OP: &str = "sparse_assemble";
        let a = self.arrays.try_get_mut(h, OP)?;
        let SparseState::Building(buf) = &a.state else {
            return Err(GaError::AlreadyAssembled {
                op: OP,
                handle: h.to_string(),
            });
        };
        match assemble::assemble(ga, a.shape, buf)? {
            Some(layout) => {
                a.state = SparseState::Assembled(layout);
                Ok(true)
            }
            None => {
                log::warn!("rank {}: assembly of sparse array {h} failed", ga.rank());
                Ok(false)
            }
        }
    }

    /// Release the array. Collective for assembled arrays.
    pub fn destroy<C: RemoteMemory>(
        &mut self,
        h: SparseHandle,
        ga: &mut GlobalArrays<C>,
    ) -> Result<bool, GaError> {
        let a = self.arrays.try_get(h, "sparse_destroy")?;
        let mut ok = true;
        if let SparseState::Assembled(layout) = &a.state {
            for g in layout.handles() {
                ok &= ga.destroy(g)?;
            }
        }
        self.arrays.remove(h);
        Ok(ok)
    }

    /// Destroy every live sparse array.
    pub fn terminate<C: RemoteMemory>(
        &mut self,
        ga: &mut GlobalArrays<C>,
    ) -> Result<bool, GaError> {
        let mut ok = true;
        for h in self.arrays.handles() {
            ok &= self.destroy(h, ga)?;
        }
        Ok(ok)
    }

    pub fn array(&self, h: SparseHandle) -> Result<&SparseArray, GaError> {
        self.arrays.try_get(h, "sparse_inquire")
    }

    pub fn dims(&self, h: SparseHandle) -> Result<(usize, usize), GaError> {
        Ok(self.array(h)?.dims())
    }

    pub fn element_type(&self, h: SparseHandle) -> Result<ElementType, GaError> {
        Ok(self.array(h)?.element_type())
    }

    pub fn is_assembled(&self, h: SparseHandle) -> Result<bool, GaError> {
        Ok(self.array(h)?.is_assembled())
    }

    /// Elements held by the calling process: buffered triples while
    /// building, the local row block once assembled.
    pub fn local_len(&self, h: SparseHandle) -> Result<usize, GaError> {
        Ok(match &self.array(h)?.state {
            SparseState::Building(buf) => buf.len(),
            SparseState::Assembled(layout) => layout.local_len(),
        })
    }

    /// Non-empty column blocks in the calling process's row block.
    pub fn nblocks(&self, h: SparseHandle) -> Result<usize, GaError> {
        Ok(self.layout(h, "sparse_nblocks")?.blocks.len())
    }

    /// Directory of non-empty column blocks, ordered by block id.
    pub fn blocks(&self, h: SparseHandle) -> Result<&[BlockEntry], GaError> {
        Ok(&self.layout(h, "sparse_blocks")?.blocks)
    }

    /// Rows owned by the calling process.
    pub fn local_rows(&self, h: SparseHandle) -> Result<Range<usize>, GaError> {
        Ok(self.layout(h, "sparse_local_rows")?.rows.clone())
    }

    /// Rows owned by `proc`. Empty ranges are valid.
    pub fn row_distribution(&self, h: SparseHandle, proc: usize) -> Result<Range<usize>, GaError> {
        let (idim, _) = self.dims(h)?;
        self.check_proc(proc, "sparse_row_distribution")?;
        Ok(self.binning.range(idim, self.nproc, proc))
    }

    /// Columns of column block `proc`. Empty ranges are valid.
    pub fn column_distribution(
        &self,
        h: SparseHandle,
        proc: usize,
    ) -> Result<Range<usize>, GaError> {
        let (_, jdim) = self.dims(h)?;
        self.check_proc(proc, "sparse_column_distribution")?;
        Ok(self.binning.range(jdim, self.nproc, proc))
    }

    /// In-place view of column block `icol` of the local row block, or
    /// `None` if that block holds no elements.
    pub fn access_column_block<T: Element, C: RemoteMemory>(
        &self,
        h: SparseHandle,
        icol: usize,
        ga: &GlobalArrays<C>,
    ) -> Result<Option<ColumnBlock<T, C::Shared>>, GaError> {
        const OP: &str = "sparse_access_column_block";
        let a = self.array(h)?;
        if T::TYPE != a.shape.ty {
            return Err(GaError::TypeMismatch {
                op: OP,
                expected: a.shape.ty,
                got: T::TYPE,
            });
        }
        let layout = self.layout(h, OP)?;
        let Some(pos) = layout.find(icol) else {
            return Ok(None);
        };
        let entry = layout.blocks[pos];
        let block = ColumnBlock {
            g_data: ga.access_shared_bytes(layout.g_data)?,
            g_i: ga.access_shared_bytes(layout.g_i)?,
            g_j: ga.access_shared_bytes(layout.g_j)?,
            blkidx: entry.blkidx,
            rows: layout.rows.clone(),
            cols: self.binning.range(a.shape.jdim, self.nproc, icol),
            ptr_offset: pos * (layout.nrows() + 1),
            offset: entry.offset,
            len: entry.blksize,
            _marker: PhantomData,
        };
        crate::debug_invariants!(block.validate_invariants(), "column block");
        Ok(Some(block))
    }

    fn layout(&self, h: SparseHandle, op: &'static str) -> Result<&AssembledLayout, GaError> {
        match &self.arrays.try_get(h, op)?.state {
            SparseState::Assembled(layout) => Ok(layout),
            SparseState::Building(_) => Err(GaError::NotAssembled {
                op,
                handle: h.to_string(),
            }),
        }
    }

    fn check_proc(&self, proc: usize, op: &'static str) -> Result<(), GaError> {
        if proc >= self.nproc {
            return Err(GaError::RankOutOfRange {
                op,
                rank: proc,
                size: self.nproc,
            });
        }
        Ok(())
    }
}
