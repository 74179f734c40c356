//! GaError: unified error type for the global-array runtime.
//!
//! State-machine and argument violations are reported through this type
//! instead of terminating the process; callers decide whether a failure is
//! fatal. Resource exhaustion during `allocate`/`assemble` is reported as a
//! boolean status, never as an error.

use thiserror::Error;

use crate::global::element::ElementType;

/// Unified error type for global, sparse and pointer array operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GaError {
    /// An array extent was zero or the number of axes was unsupported.
    #[error("{op}: invalid array dimension {dim}")]
    InvalidDimension { op: &'static str, dim: usize },
    /// The fixed-capacity handle pool is exhausted.
    #[error("{op}: no free slots (capacity {capacity})")]
    NoFreeSlots { op: &'static str, capacity: usize },
    /// Handle does not refer to a live object (destroyed or never created).
    #[error("{op}: invalid handle {handle}")]
    InvalidHandle { op: &'static str, handle: String },
    /// Operation requires an active (allocated / accepting) object.
    #[error("{op}: array {handle} is not active")]
    NotActive { op: &'static str, handle: String },
    /// Sparse array has already been assembled and is read-only.
    #[error("{op}: array {handle} is already assembled")]
    AlreadyAssembled { op: &'static str, handle: String },
    /// Sparse array must be assembled before it can be queried.
    #[error("{op}: array {handle} is not assembled")]
    NotAssembled { op: &'static str, handle: String },
    /// Array already holds a live allocation.
    #[error("{op}: array {handle} is already allocated")]
    AlreadyAllocated { op: &'static str, handle: String },
    /// Array storage has not been materialized yet.
    #[error("{op}: array {handle} has no allocation")]
    NotAllocated { op: &'static str, handle: String },
    /// Remote buffer materialization failed.
    #[error("{op}: unable to allocate {bytes} bytes")]
    AllocationFailure { op: &'static str, bytes: usize },
    /// Subscript lies outside the calling process's local patch.
    #[error("{op}: subscript {subscript:?} outside local patch {lo:?}..{hi:?}")]
    OutOfBounds {
        op: &'static str,
        subscript: Vec<usize>,
        lo: Vec<usize>,
        hi: Vec<usize>,
    },
    /// Global index outside the array extents.
    #[error("{op}: index {index:?} outside dimensions {dims:?}")]
    IndexOutOfRange {
        op: &'static str,
        index: Vec<usize>,
        dims: Vec<usize>,
    },
    /// Element type used does not match the declared array type.
    #[error("{op}: element type {got:?} does not match array type {expected:?}")]
    TypeMismatch {
        op: &'static str,
        expected: ElementType,
        got: ElementType,
    },
    /// Block boundary map is malformed.
    #[error("{op}: invalid distribution: {reason}")]
    InvalidDistribution { op: &'static str, reason: String },
    /// Process rank outside the group.
    #[error("{op}: rank {rank} outside group of {size}")]
    RankOutOfRange {
        op: &'static str,
        rank: usize,
        size: usize,
    },
    /// Remote memory segment not exposed by the target process.
    #[error("remote segment {key:#x} not exposed on rank {rank}")]
    SegmentMissing { key: u64, rank: usize },
    /// Remote access falls outside an exposed segment.
    #[error("remote access [{offset}, {end}) outside segment {key:#x} of {len} bytes on rank {rank}")]
    SegmentOverrun {
        key: u64,
        rank: usize,
        offset: usize,
        end: usize,
        len: usize,
    },
    /// Memory descriptor does not refer to a live remote allocation.
    #[error("{op}: invalid memory descriptor")]
    InvalidPointer { op: &'static str },
}
