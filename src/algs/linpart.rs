//! Linear partitioning of a global id space across ranks.
//!
//! Globals `0..total` are distributed in contiguous blocks, the first
//! `total % comm_size` ranks receiving one extra. This addressing is the
//! backbone of owner lookup when rebuilding connectivity across ranks: any
//! rank can compute the owner of any global id without communication.

use crate::topology::remotes::Remotes;
use crate::topology::{Go, Lo};

/// Number of globals owned by `rank` under linear partitioning.
pub fn linear_partition_size(total: Go, comm_size: usize, rank: usize) -> Lo {
    let quot = total / comm_size as Go;
    let rem = total % comm_size as Go;
    let extra = u64::from((rank as Go) < rem);
    (quot + extra) as Lo
}

/// Map each global id to its linear owner `(rank, index on that rank)`.
pub fn globals_to_linear_owners(globals: &[Go], total: Go, comm_size: usize) -> Remotes {
    let quot = total / comm_size as Go;
    let rem = total % comm_size as Go;
    // ids below the split live on ranks holding quot+1 globals
    let split = (quot + 1) * rem;
    let mut ranks = Vec::with_capacity(globals.len());
    let mut idxs = Vec::with_capacity(globals.len());
    for &g in globals {
        debug_assert!(g < total);
        let (rank, idx) = if g < split {
            (g / (quot + 1), g % (quot + 1))
        } else {
            (rem + (g - split) / quot, (g - split) % quot)
        };
        ranks.push(rank as i32);
        idxs.push(idx as Lo);
    }
    Remotes { ranks, idxs }
}

/// Total global count recovered from the local maxima: callers pass the
/// all-reduced maximum plus one.
pub fn find_total_globals(local_globals: &[Go]) -> Go {
    local_globals.iter().copied().max().map_or(0, |m| m + 1)
}
