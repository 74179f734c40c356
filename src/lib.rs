#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ga-sparse
//!
//! ga-sparse is a global-address-space runtime for distributed arrays. Arrays
//! are partitioned across the memories of a process group, yet every process
//! addresses them as one logical object through one-sided `put`, `get` and
//! atomic `read_inc` operations.
//!
//! ## Features
//! - Distributed array registry with regular (process-grid) and irregular
//!   block distributions
//! - Distributed sparse matrices: per-process triple accumulation and a
//!   collective four-phase assembly into a row-block / column-block CSR
//!   layout, queried in place through [`sparse::ColumnBlock`]
//! - Global pointer arrays holding descriptors of remotely readable
//!   allocations
//! - Generation-checked handles that catch use after destroy
//! - Transport-agnostic: everything runs against the [`comm::Communicator`]
//!   and [`comm::RemoteMemory`] traits; [`comm::ThreadComm`] runs a whole
//!   process group as threads of one process
//!
//! ## Collective discipline
//!
//! Handle creation, `allocate`, `zero`, `destroy` and sparse `assemble` are
//! collective: every process issues them in the same order. A process that
//! skips one stalls the others.
//!
//! ## Usage
//!
//! ```no_run
//! use ga_sparse::prelude::*;
//!
//! let blocks = launch(WorldConfig::new(4), |comm| {
//!     let mut ga = GlobalArrays::new(comm, GaConfig::default());
//!     let mut sp = SparseArrays::new(&ga);
//!     let h = sp.create::<f64>(8, 8)?;
//!     if ga.rank() == 0 {
//!         sp.add_element(h, 7, 7, 2.0)?;
//!     }
//!     sp.assemble(h, &mut ga)?;
//!     let n = sp.nblocks(h)?;
//!     sp.destroy(h, &mut ga)?;
//!     Ok::<_, GaError>(n)
//! });
//! assert_eq!(blocks.len(), 4);
//! ```

pub mod comm;
pub mod config;
pub mod debug_invariants;
pub mod ga_error;
pub mod global;
pub mod gparray;
pub mod handle;
pub mod sparse;

pub use debug_invariants::DebugInvariants;
pub use ga_error::GaError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::comm::{
        Communicator, ReduceOp, RemoteMemory, SegmentKey, ThreadComm, WorldConfig, launch,
    };
    pub use crate::config::{Binning, FailurePolicy, GaConfig};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::ga_error::GaError;
    pub use crate::global::distribution::{Distribution, Patch, block_range};
    pub use crate::global::element::{Element, ElementType};
    pub use crate::global::registry::{GaHandle, GlobalArrays};
    pub use crate::gparray::{GpHandle, MemDescriptor, PointerArrays, RemoteAllocation};
    pub use crate::handle::Handle;
    pub use crate::sparse::{BlockEntry, ColumnBlock, SparseArrays, SparseHandle, TripleBuffer};
}
