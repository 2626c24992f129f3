//! Scans, gathers, scatters, and map inversion.
//!
//! Map inversion is offered in two forms with identical output: a
//! sort-then-segment version and an atomic-counter version whose buckets are
//! sorted afterwards. Both are deterministic in value (per-target neighbor
//! lists come out ascending), so callers may pick either.

use crate::topology::{Graph, Lo, NONE};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Exclusive prefix sum with the total appended; `counts` of length n yields
/// offsets of length n+1.
pub fn offset_scan<T: Into<Lo> + Copy>(counts: &[T]) -> Vec<Lo> {
    let mut out = Vec::with_capacity(counts.len() + 1);
    let mut acc: Lo = 0;
    out.push(0);
    for &c in counts {
        acc += c.into();
        out.push(acc);
    }
    out
}

/// Indices of the set entries of a mark array, ascending.
pub fn collect_marked(marks: &[u8]) -> Vec<Lo> {
    marks
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i as Lo)
        .collect()
}

/// Gather: `out[i*w..] = data[a2b[i]*w..]`.
pub fn unmap<T: Copy + Send + Sync>(a2b: &[Lo], data: &[T], width: usize) -> Vec<T> {
    if a2b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![data[0]; a2b.len() * width];
    out.par_chunks_mut(width).enumerate().for_each(|(a, chunk)| {
        let b = a2b[a] as usize;
        chunk.copy_from_slice(&data[b * width..(b + 1) * width]);
    });
    out
}

/// Scatter with fill: start from `init` everywhere, then
/// `out[a2b[i]*w..] = data[i*w..]`.
pub fn map_onto<T: Copy + Send + Sync>(
    data: &[T],
    a2b: &[Lo],
    nb: usize,
    init: T,
    width: usize,
) -> Vec<T> {
    let mut out = vec![init; nb * width];
    map_into(data, a2b, &mut out, width);
    out
}

/// Scatter into an existing buffer: `out[a2b[i]*w..] = data[i*w..]`.
pub fn map_into<T: Copy>(data: &[T], a2b: &[Lo], out: &mut [T], width: usize) {
    for (a, &b) in a2b.iter().enumerate() {
        let b = b as usize;
        out[b * width..(b + 1) * width].copy_from_slice(&data[a * width..(a + 1) * width]);
    }
}

/// Scatter through a permutation: `out[perm[i]*w..] = data[i*w..]`.
pub fn permute<T: Copy + Send + Sync>(data: &[T], perm: &[Lo], width: usize) -> Vec<T> {
    if perm.is_empty() {
        return Vec::new();
    }
    map_onto(data, perm, perm.len(), data[0], width)
}

/// Expand per-fan data to per-item data: item `j` in fan `i`
/// (`offsets[i] <= j < offsets[i+1]`) receives `data[i*w..]`.
pub fn expand<T: Copy + Send + Sync>(data: &[T], offsets: &[Lo], width: usize) -> Vec<T> {
    let funnel = invert_fan(offsets);
    unmap(&funnel, data, width)
}

/// Offsets → per-item fan index: `[0,2,4,6]` becomes `[0,0,1,1,2,2]`.
pub fn invert_fan(offsets: &[Lo]) -> Vec<Lo> {
    if offsets.is_empty() {
        return Vec::new();
    }
    let total = *offsets.last().unwrap_or(&0) as usize;
    let mut out = vec![0 as Lo; total];
    for i in 0..offsets.len() - 1 {
        for j in offsets[i]..offsets[i + 1] {
            out[j as usize] = i as Lo;
        }
    }
    out
}

/// Per-item fan index → offsets; `funnel` must be sorted ascending.
pub fn invert_funnel(funnel: &[Lo], nfans: usize) -> Vec<Lo> {
    let mut out = vec![0 as Lo; nfans + 1];
    for &f in funnel {
        out[f as usize + 1] += 1;
    }
    for i in 0..nfans {
        out[i + 1] += out[i];
    }
    out
}

/// Invert an injective map; unmapped targets hold [`NONE`].
pub fn invert_injective_map(a2b: &[Lo], nb: usize) -> Vec<Lo> {
    let mut out = vec![NONE; nb];
    for (a, &b) in a2b.iter().enumerate() {
        debug_assert_eq!(out[b as usize], NONE, "map not injective at {b}");
        out[b as usize] = a as Lo;
    }
    out
}

/// Invert a (possibly many-to-one) map by sorting `(target, source)` pairs.
pub fn invert_map_by_sorting(a2b: &[Lo], nb: usize) -> Graph {
    let mut pairs: Vec<(Lo, Lo)> = a2b
        .iter()
        .enumerate()
        .map(|(a, &b)| (b, a as Lo))
        .collect();
    pairs.par_sort_unstable();
    let mut a2ab = vec![0 as Lo; nb + 1];
    for &(b, _) in &pairs {
        a2ab[b as usize + 1] += 1;
    }
    for i in 0..nb {
        a2ab[i + 1] += a2ab[i];
    }
    let ab2b = pairs.into_iter().map(|(_, a)| a).collect();
    Graph { a2ab, ab2b }
}

/// Invert a map with atomic counters; each bucket is sorted afterwards so the
/// result is identical to [`invert_map_by_sorting`].
pub fn invert_map_by_atomics(a2b: &[Lo], nb: usize) -> Graph {
    let degrees: Vec<AtomicU32> = (0..nb).map(|_| AtomicU32::new(0)).collect();
    a2b.par_iter().for_each(|&b| {
        degrees[b as usize].fetch_add(1, Ordering::Relaxed);
    });
    let counts: Vec<Lo> = degrees.iter().map(|d| d.load(Ordering::Relaxed)).collect();
    let a2ab = offset_scan(&counts);
    let slots: Vec<AtomicU32> = a2ab[..nb].iter().map(|&o| AtomicU32::new(o)).collect();
    let total = *a2ab.last().unwrap() as usize;
    let ab2b: Vec<AtomicU32> = (0..total).map(|_| AtomicU32::new(0)).collect();
    a2b.par_iter().enumerate().for_each(|(a, &b)| {
        let slot = slots[b as usize].fetch_add(1, Ordering::Relaxed);
        ab2b[slot as usize].store(a as Lo, Ordering::Relaxed);
    });
    let mut ab2b: Vec<Lo> = ab2b.into_iter().map(|x| x.into_inner()).collect();
    for b in 0..nb {
        ab2b[a2ab[b] as usize..a2ab[b + 1] as usize].sort_unstable();
    }
    Graph { a2ab, ab2b }
}
