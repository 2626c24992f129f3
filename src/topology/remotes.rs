//! Remote references: each entity copy names its owning `(rank, local id)`.
//!
//! Owners hold the canonical value of every shared array. `sync` broadcasts
//! owner values to all copies; `reduce` folds copy contributions into the
//! owner slot (sort-then-segment, so the result is independent of traversal
//! order) and then broadcasts back. On a serial communicator with identity
//! remotes both collapse to the identity, but the algorithms stay honest for
//! any local aliasing (periodic identifications use non-trivial remotes).

use crate::algs::map::invert_map_by_sorting;
use crate::mesh_error::{MeshAdaptError, Result};
use crate::topology::Lo;

/// Owning references for each local entity copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Remotes {
    /// Owning rank per copy.
    pub ranks: Vec<i32>,
    /// Local index on the owning rank per copy.
    pub idxs: Vec<Lo>,
}

impl Remotes {
    /// Identity ownership: every copy owns itself on `rank`.
    pub fn identity(n: usize, rank: i32) -> Self {
        Remotes {
            ranks: vec![rank; n],
            idxs: (0..n as Lo).collect(),
        }
    }

    /// Number of copies described.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// True when no copies are described.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// True when every copy owns itself.
    pub fn is_identity(&self, rank: i32) -> bool {
        self.ranks.iter().all(|&r| r == rank)
            && self.idxs.iter().enumerate().all(|(i, &j)| i as Lo == j)
    }
}

/// Reduction applied by [`reduce_to_owners`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OwnerReduce {
    Sum,
    Min,
    Max,
}

/// Broadcast owner values to all copies: `out[i] = data[owner_idx(i)]`.
/// Owners must be local (single-rank communicator).
pub fn sync_from_owners<T: Copy>(
    remotes: &Remotes,
    data: &[T],
    width: usize,
) -> Result<Vec<T>> {
    if data.len() != remotes.len() * width {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: data.len(),
            width,
        });
    }
    let mut out = Vec::with_capacity(data.len());
    for i in 0..remotes.len() {
        let j = remotes.idxs[i] as usize;
        out.extend_from_slice(&data[j * width..(j + 1) * width]);
    }
    Ok(out)
}

/// Fold every copy's contribution into its owner slot, then broadcast back.
pub fn reduce_to_owners(
    remotes: &Remotes,
    data: &[f64],
    width: usize,
    op: OwnerReduce,
) -> Result<Vec<f64>> {
    if data.len() != remotes.len() * width {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: data.len(),
            width,
        });
    }
    let n = remotes.len();
    let owners = invert_map_by_sorting(&remotes.idxs, n);
    let mut reduced = data.to_vec();
    for owner in 0..n {
        let copies = owners.row(owner);
        if copies.len() < 2 {
            continue;
        }
        for w in 0..width {
            let mut acc = data[copies[0] as usize * width + w];
            for &c in &copies[1..] {
                let v = data[c as usize * width + w];
                acc = match op {
                    OwnerReduce::Sum => acc + v,
                    OwnerReduce::Min => acc.min(v),
                    OwnerReduce::Max => acc.max(v),
                };
            }
            reduced[owner * width + w] = acc;
        }
    }
    sync_from_owners(remotes, &reduced, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips() {
        let r = Remotes::identity(3, 0);
        assert!(r.is_identity(0));
        let data = [1.0, 2.0, 3.0];
        assert_eq!(sync_from_owners(&r, &data, 1).unwrap(), data.to_vec());
        assert_eq!(
            reduce_to_owners(&r, &data, 1, OwnerReduce::Sum).unwrap(),
            data.to_vec()
        );
    }

    #[test]
    fn aliased_copies_follow_owner() {
        // copies 1 and 2 both owned by slot 1
        let r = Remotes {
            ranks: vec![0, 0, 0],
            idxs: vec![0, 1, 1],
        };
        assert!(!r.is_identity(0));
        let data = [5.0, 7.0, 9.0];
        assert_eq!(
            sync_from_owners(&r, &data, 1).unwrap(),
            vec![5.0, 7.0, 7.0]
        );
        assert_eq!(
            reduce_to_owners(&r, &data, 1, OwnerReduce::Sum).unwrap(),
            vec![5.0, 16.0, 16.0]
        );
        assert_eq!(
            reduce_to_owners(&r, &data, 1, OwnerReduce::Max).unwrap(),
            vec![5.0, 9.0, 9.0]
        );
        assert_eq!(
            reduce_to_owners(&r, &data, 1, OwnerReduce::Min).unwrap(),
            vec![5.0, 7.0, 7.0]
        );
    }

    #[test]
    fn size_mismatch_reported() {
        let r = Remotes::identity(2, 0);
        assert!(matches!(
            sync_from_owners(&r, &[1.0], 1),
            Err(MeshAdaptError::ArraySizeMismatch { .. })
        ));
    }
}
