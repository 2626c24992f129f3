//! Lexicographic key sorting returning permutations.

use crate::topology::Lo;
use rayon::prelude::*;

/// Sort fixed-width integer keys lexicographically and return the permutation
/// from sorted position to original key index. Equal keys keep their original
/// relative order, so the result is fully deterministic.
pub fn sort_by_keys(keys: &[Lo], width: usize) -> Vec<Lo> {
    debug_assert_eq!(keys.len() % width, 0);
    let n = keys.len() / width;
    let mut perm: Vec<Lo> = (0..n as Lo).collect();
    perm.par_sort_unstable_by(|&a, &b| {
        let ka = &keys[a as usize * width..(a as usize + 1) * width];
        let kb = &keys[b as usize * width..(b as usize + 1) * width];
        ka.cmp(kb).then(a.cmp(&b))
    });
    perm
}

/// Positions where the sorted key stream changes value; always marks index 0
/// of a non-empty stream. Used to segment sorted duplicates.
pub fn find_jumps(sorted_keys: &[Lo], width: usize) -> Vec<u8> {
    debug_assert_eq!(sorted_keys.len() % width, 0);
    let n = sorted_keys.len() / width;
    crate::algs::arrays::parallel_map(n, |i| {
        if i == 0 {
            return 1;
        }
        let prev = &sorted_keys[(i - 1) * width..i * width];
        let here = &sorted_keys[i * width..(i + 1) * width];
        u8::from(prev != here)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_width() {
        assert_eq!(sort_by_keys(&[0, 1], 1), vec![0, 1]);
        assert_eq!(sort_by_keys(&[3, 1, 2], 1), vec![1, 2, 0]);
    }

    #[test]
    fn pair_keys() {
        assert_eq!(sort_by_keys(&[0, 2, 0, 1], 2), vec![1, 0]);
        assert_eq!(sort_by_keys(&[0, 2, 1, 1], 2), vec![0, 1]);
    }

    #[test]
    fn triple_keys() {
        assert_eq!(sort_by_keys(&[1, 2, 3, 1, 2, 2, 3, 0, 0], 3), vec![1, 0, 2]);
    }

    #[test]
    fn ties_keep_original_order() {
        assert_eq!(sort_by_keys(&[5, 5, 1], 1), vec![2, 0, 1]);
    }

    #[test]
    fn jumps_segment_duplicates() {
        assert_eq!(find_jumps(&[0, 0, 1, 2, 2], 1), vec![1, 0, 1, 1, 0]);
        assert_eq!(find_jumps(&[0, 1, 0, 1, 0, 2], 2), vec![1, 0, 1]);
        assert!(find_jumps(&[], 2).is_empty());
    }
}
