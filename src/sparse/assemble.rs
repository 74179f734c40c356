//! Collective conversion of scattered triples into blocked CSR storage.
//!
//! Phases, each closed by a barrier:
//!
//! 1. **Row redistribution.** Triples are binned by row owner. Every process
//!    claims a disjoint slice of each destination's block with a remote
//!    fetch-and-add on a one-slot-per-process counter array, then writes its
//!    triples into the claimed slices with one-sided puts.
//! 2. **Column binning.** Each process buckets its row block by column owner.
//!    Non-empty buckets become the column-block directory and the local data
//!    is repacked in directory order.
//! 3. **Row compression.** Inside each column block, elements are bucketed by
//!    local row and a row-pointer array of `nrows + 1` entries is built. The
//!    pointer arrays of all blocks are packed into a freshly sized `g_i`.
//! 4. **Completion.** A final barrier publishes the structure.

use std::ops::Range;

use crate::comm::{ReduceOp, RemoteMemory};
use crate::config::{Binning, FailurePolicy};
use crate::debug_invariants::DebugInvariants;
use crate::ga_error::GaError;
use crate::global::distribution::Patch;
use crate::global::element::ElementType;
use crate::global::registry::{GaHandle, GlobalArrays};
use crate::sparse::bucket::BucketList;
use crate::sparse::builder::TripleBuffer;

/// Directory entry of one non-empty column block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    /// Global column-block id, i.e. the process owning that column range.
    pub blkidx: usize,
    /// Element offset of the block in the local value and column arrays.
    pub offset: usize,
    /// Number of elements in the block.
    pub blksize: usize,
}

/// Global shape of a sparse matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SparseShape {
    pub idim: usize,
    pub jdim: usize,
    pub ty: ElementType,
}

/// Assembled storage of a sparse array as seen by one process.
#[derive(Clone, Debug)]
pub(crate) struct AssembledLayout {
    pub g_data: GaHandle,
    pub g_i: GaHandle,
    pub g_j: GaHandle,
    pub rows: Range<usize>,
    pub blocks: Vec<BlockEntry>,
}

impl AssembledLayout {
    pub(crate) fn nrows(&self) -> usize {
        self.rows.len()
    }

    /// Directory position of column block `icol`. The directory holds at
    /// most one entry per process, so a linear scan is enough.
    pub(crate) fn find(&self, icol: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.blkidx == icol)
    }

    pub(crate) fn local_len(&self) -> usize {
        self.blocks.iter().map(|b| b.blksize).sum()
    }

    pub(crate) fn handles(&self) -> [GaHandle; 3] {
        [self.g_data, self.g_i, self.g_j]
    }
}

impl DebugInvariants for AssembledLayout {
    fn validate_invariants(&self) -> Result<(), GaError> {
        let bad = |reason: String| GaError::InvalidDistribution {
            op: "assemble",
            reason,
        };
        let mut next = 0;
        let mut prev: Option<usize> = None;
        for b in &self.blocks {
            if b.blksize == 0 {
                return Err(bad(format!("empty column block {}", b.blkidx)));
            }
            if prev.is_some_and(|p| p >= b.blkidx) {
                return Err(bad(format!("column block {} out of order", b.blkidx)));
            }
            if b.offset != next {
                return Err(bad(format!(
                    "column block {} starts at {} instead of {next}",
                    b.blkidx, b.offset
                )));
            }
            prev = Some(b.blkidx);
            next += b.blksize;
        }
        Ok(())
    }
}

/// Run all four phases. Collective over every process of the group.
///
/// Returns `Ok(None)` when distributed storage could not be obtained. On
/// `Ok(None)` and on `Err` every intermediate array has been released and
/// `triples` is untouched.
pub(crate) fn assemble<C: RemoteMemory>(
    ga: &mut GlobalArrays<C>,
    shape: SparseShape,
    triples: &TripleBuffer,
) -> Result<Option<AssembledLayout>, GaError> {
    let mut live = Vec::new();
    let result = run_phases(ga, shape, triples, &mut live);
    if let Err(e) = &result {
        log::warn!("rank {}: assembly failed: {e}", ga.rank());
        for h in live {
            ga.discard(h);
        }
    }
    result
}

/// Body of [`assemble`]. Every array created along the way is pushed onto
/// `live`; handles destroyed later go stale and are skipped on unwind.
fn run_phases<C: RemoteMemory>(
    ga: &mut GlobalArrays<C>,
    shape: SparseShape,
    triples: &TripleBuffer,
    live: &mut Vec<GaHandle>,
) -> Result<Option<AssembledLayout>, GaError> {
    let nproc = ga.nproc();
    let me = ga.rank();
    let binning = ga.config().binning;
    let policy = ga.config().failure_policy;
    let es = shape.ty.size();

    if binning == Binning::Strided && shape.idim % nproc != 0 {
        log::warn!(
            "rank {me}: strided binning of {} rows over {nproc} processes gives uneven row blocks",
            shape.idim
        );
    }

    log::debug!("rank {me}: assembly phase 1, {} local triples", triples.len());
    let dest: Vec<usize> = triples
        .rows()
        .iter()
        .map(|&i| binning.owner(i, shape.idim, nproc))
        .collect();
    let by_dest = BucketList::new(nproc, &dest);
    let Some((offsets, sizes)) = claim_offsets(ga, by_dest.counts(), policy, live)? else {
        return Ok(None);
    };

    let (g_data, ok_data) = ga.create_irregular(shape.ty, &sizes)?;
    live.push(g_data);
    let (g_j, ok_j) = ga.create_irregular(ElementType::Long, &sizes)?;
    live.push(g_j);
    let (g_i, ok_i) = ga.create_irregular(ElementType::Long, &sizes)?;
    live.push(g_i);
    if !checkpoint(ga, policy, ok_data && ok_j && ok_i, "row storage") {
        release(ga, &[g_data, g_j, g_i])?;
        return Ok(None);
    }

    let mut base = 0;
    let map: Vec<usize> = sizes
        .iter()
        .map(|&n| {
            let start = base;
            base += n;
            start
        })
        .collect();
    for k in 0..nproc {
        let dest = (k + me) % nproc;
        let n = by_dest.counts()[dest];
        if n == 0 {
            continue;
        }
        let mut rows = Vec::with_capacity(n);
        let mut cols = Vec::with_capacity(n);
        let mut vals = Vec::with_capacity(n * es);
        for t in by_dest.iter(dest) {
            rows.push(triples.rows()[t] as i64);
            cols.push(triples.columns()[t] as i64);
            vals.extend_from_slice(triples.value_bytes(t));
        }
        let start = map[dest] + offsets[dest];
        log::trace!("rank {me}: scatter {n} triples to rank {dest} at {start}");
        let patch = Patch::span(start..start + n);
        ga.put_bytes(g_data, &patch, &vals)?;
        ga.put(g_i, &patch, &rows)?;
        ga.put(g_j, &patch, &cols)?;
    }
    ga.comm().barrier();

    log::debug!("rank {me}: assembly phase 2");
    let rows = binning.range(shape.idim, nproc, me);
    let nlocal = sizes[me];
    let local_i: Vec<usize> = ga.access_local::<i64>(g_i)?.iter().map(|&r| r as usize).collect();
    let local_j: Vec<usize> = ga.access_local::<i64>(g_j)?.iter().map(|&c| c as usize).collect();
    let data = ga.access_bytes(g_data)?.to_vec();
    if let Some(&stray) = local_i.iter().find(|&&r| !rows.contains(&r)) {
        return Err(GaError::InvalidDistribution {
            op: "assemble",
            reason: format!("row {stray} delivered to rank {me} owning {rows:?}"),
        });
    }

    let col_block: Vec<usize> = local_j
        .iter()
        .map(|&j| binning.owner(j, shape.jdim, nproc))
        .collect();
    let by_col = BucketList::new(nproc, &col_block);
    let mut blocks = Vec::new();
    let mut order = Vec::with_capacity(nlocal);
    for (b, &n) in by_col.counts().iter().enumerate() {
        if n == 0 {
            continue;
        }
        blocks.push(BlockEntry {
            blkidx: b,
            offset: order.len(),
            blksize: n,
        });
        order.extend(by_col.iter(b));
    }

    log::debug!("rank {me}: assembly phase 3, {} column blocks", blocks.len());
    ga.destroy(g_i)?;
    let nrows = rows.len();
    let stride = nrows + 1;
    let mut slots = vec![0i64; nproc];
    slots[me] = (stride * blocks.len()) as i64;
    ga.comm().allreduce(&mut slots, ReduceOp::Sum);
    let slots: Vec<usize> = slots.into_iter().map(|s| s as usize).collect();
    let (g_i, ok) = ga.create_irregular(ElementType::Long, &slots)?;
    live.push(g_i);
    if !checkpoint(ga, policy, ok, "row pointers") {
        release(ga, &[g_data, g_j, g_i])?;
        return Ok(None);
    }

    let mut ptrs = vec![0i64; slots[me]];
    let mut cols_out = vec![0i64; nlocal];
    let mut vals_out = vec![0u8; nlocal * es];
    for (n, blk) in blocks.iter().enumerate() {
        let members = &order[blk.offset..blk.offset + blk.blksize];
        let local_rows: Vec<usize> = members.iter().map(|&k| local_i[k] - rows.start).collect();
        let by_row = BucketList::new(nrows, &local_rows);
        let ptr = &mut ptrs[n * stride..(n + 1) * stride];
        let mut pos = blk.offset;
        for (r, slot) in ptr.iter_mut().take(nrows).enumerate() {
            *slot = (pos - blk.offset) as i64;
            let start = pos;
            for m in by_row.iter(r) {
                let k = members[m];
                cols_out[pos] = local_j[k] as i64;
                vals_out[pos * es..(pos + 1) * es].copy_from_slice(&data[k * es..(k + 1) * es]);
                pos += 1;
            }
            if ga.config().sort_columns {
                sort_row(&mut cols_out[start..pos], &mut vals_out[start * es..pos * es], es);
            }
        }
        ptr[nrows] = blk.blksize as i64;
    }
    ga.access_local::<i64>(g_i)?.copy_from_slice(&ptrs);
    ga.access_local::<i64>(g_j)?.copy_from_slice(&cols_out);
    ga.access_bytes(g_data)?.copy_from_slice(&vals_out);

    ga.comm().barrier();
    log::debug!("rank {me}: assembly phase 4, {nlocal} elements in {} blocks", blocks.len());
    let layout = AssembledLayout {
        g_data,
        g_i,
        g_j,
        rows,
        blocks,
    };
    crate::debug_invariants!(layout.validate_invariants(), "assembled layout");
    Ok(Some(layout))
}

/// Claim a slice of every destination's row block. Returns the claimed start
/// offsets per destination and the total element count per process.
fn claim_offsets<C: RemoteMemory>(
    ga: &mut GlobalArrays<C>,
    counts: &[usize],
    policy: FailurePolicy,
    live: &mut Vec<GaHandle>,
) -> Result<Option<(Vec<usize>, Vec<usize>)>, GaError> {
    let nproc = counts.len();
    let me = ga.rank();
    let counter = ga.create_handle()?;
    live.push(counter);
    ga.set_data(counter, &[nproc], ElementType::Long)?;
    let ok = ga.allocate(counter)?;
    if !checkpoint(ga, policy, ok, "offset counters") {
        ga.destroy(counter)?;
        return Ok(None);
    }
    ga.zero(counter)?;

    let mut offsets = vec![0; nproc];
    for k in 0..nproc {
        let dest = (k + me) % nproc;
        if counts[dest] > 0 {
            offsets[dest] = ga.read_inc(counter, &[dest], counts[dest] as i64)? as usize;
        }
    }
    ga.comm().barrier();

    let mut totals = vec![0i64; nproc];
    ga.get(counter, &Patch::span(0..nproc), &mut totals)?;
    ga.destroy(counter)?;
    Ok(Some((offsets, totals.into_iter().map(|t| t as usize).collect())))
}

/// Decide whether assembly may continue after an allocation step.
fn checkpoint<C: RemoteMemory>(
    ga: &GlobalArrays<C>,
    policy: FailurePolicy,
    ok: bool,
    what: &str,
) -> bool {
    let go = match policy {
        FailurePolicy::AllReduce => ga.comm().all_agree(ok),
        FailurePolicy::Local => ok,
    };
    if !go {
        log::warn!(
            "rank {}: assembly aborted, allocation of {what} failed{}",
            ga.rank(),
            if ok { " on another process" } else { "" }
        );
    }
    go
}

fn release<C: RemoteMemory>(ga: &mut GlobalArrays<C>, handles: &[GaHandle]) -> Result<(), GaError> {
    for &h in handles {
        ga.destroy(h)?;
    }
    Ok(())
}

/// Stable sort of one row's entries by column.
fn sort_row(cols: &mut [i64], vals: &mut [u8], es: usize) {
    let mut perm: Vec<usize> = (0..cols.len()).collect();
    perm.sort_by_key(|&p| cols[p]);
    let sorted_cols: Vec<i64> = perm.iter().map(|&p| cols[p]).collect();
    let sorted_vals: Vec<u8> = perm
        .iter()
        .flat_map(|&p| vals[p * es..(p + 1) * es].iter().copied())
        .collect();
    cols.copy_from_slice(&sorted_cols);
    vals.copy_from_slice(&sorted_vals);
}
