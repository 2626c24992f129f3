//! Elementwise array kernels and tolerance-based comparison.
//!
//! These are the leaf operations every pass is built from: predicate maps
//! producing mark arrays, parallel gathers into fresh buffers, and the
//! `are_close` comparison that drives iterative convergence tests.

use rayon::prelude::*;

/// Map a pure function over `0..n` into a fresh buffer.
pub fn parallel_map<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Send + Sync,
{
    (0..n).into_par_iter().map(f).collect()
}

/// Fill an `n * width` buffer, handing each index its output slice.
pub fn parallel_fill<T, F>(n: usize, width: usize, init: T, f: F) -> Vec<T>
where
    T: Clone + Send + Sync,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    let mut out = vec![init; n * width];
    out.par_chunks_mut(width)
        .enumerate()
        .for_each(|(i, chunk)| f(i, chunk));
    out
}

/// Marks where `a[i] < b`.
pub fn each_lt<T: PartialOrd + Sync>(a: &[T], b: T) -> Vec<u8> {
    parallel_map(a.len(), |i| u8::from(a[i] < b))
}

/// Marks where `a[i] > b`.
pub fn each_gt<T: PartialOrd + Sync>(a: &[T], b: T) -> Vec<u8> {
    parallel_map(a.len(), |i| u8::from(a[i] > b))
}

/// Marks where `a[i] == b`.
pub fn each_eq_to<T: PartialEq + Sync>(a: &[T], b: T) -> Vec<u8> {
    parallel_map(a.len(), |i| u8::from(a[i] == b))
}

/// Marks where `a[i] != b`.
pub fn each_neq_to<T: PartialEq + Sync>(a: &[T], b: T) -> Vec<u8> {
    parallel_map(a.len(), |i| u8::from(a[i] != b))
}

/// Flip a mark array.
pub fn invert_marks(marks: &[u8]) -> Vec<u8> {
    parallel_map(marks.len(), |i| u8::from(marks[i] == 0))
}

/// Elementwise logical-and of two mark arrays.
pub fn land_each(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    parallel_map(a.len(), |i| u8::from(a[i] != 0 && b[i] != 0))
}

/// Elementwise logical-or of two mark arrays.
pub fn lor_each(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    parallel_map(a.len(), |i| u8::from(a[i] != 0 || b[i] != 0))
}

/// Largest value, or `None` for an empty slice.
pub fn max_of<T: PartialOrd + Copy>(a: &[T]) -> Option<T> {
    a.iter()
        .copied()
        .fold(None, |m, x| match m {
            Some(m) if m >= x => Some(m),
            _ => Some(x),
        })
}

/// Smallest value, or `None` for an empty slice.
pub fn min_of<T: PartialOrd + Copy>(a: &[T]) -> Option<T> {
    a.iter()
        .copied()
        .fold(None, |m, x| match m {
            Some(m) if m <= x => Some(m),
            _ => Some(x),
        })
}

/// Default relative tolerance for `are_close`.
pub const CLOSE_TOL: f64 = 1e-6;
/// Default absolute floor for `are_close`.
pub const CLOSE_FLOOR: f64 = 1e-8;

/// Tolerance comparison: values both below `floor` compare equal; otherwise
/// the relative difference against the larger magnitude must be within `tol`.
pub fn are_close_with(a: f64, b: f64, tol: f64, floor: f64) -> bool {
    let am = a.abs();
    let bm = b.abs();
    if am <= floor && bm <= floor {
        return true;
    }
    (b - a).abs() / am.max(bm) <= tol
}

/// `are_close_with` at the default tolerances.
pub fn are_close(a: f64, b: f64) -> bool {
    are_close_with(a, b, CLOSE_TOL, CLOSE_FLOOR)
}

/// Slicewise `are_close_with`; false on length mismatch.
pub fn are_close_arrays_with(a: &[f64], b: &[f64], tol: f64, floor: f64) -> bool {
    a.len() == b.len()
        && a.par_iter()
            .zip(b.par_iter())
            .all(|(&x, &y)| are_close_with(x, y, tol, floor))
}

/// Slicewise `are_close` at the default tolerances.
pub fn are_close_arrays(a: &[f64], b: &[f64]) -> bool {
    are_close_arrays_with(a, b, CLOSE_TOL, CLOSE_FLOOR)
}

/// Pointwise convex combination `(1-t)*a + t*b`.
pub fn interpolate_between(a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
    debug_assert_eq!(a.len(), b.len());
    parallel_map(a.len(), |i| (1.0 - t) * a[i] + t * b[i])
}

/// Tile one `width`-entry pattern `n` times.
pub fn repeat_pattern<T: Clone + Send + Sync>(n: usize, pattern: &[T]) -> Vec<T> {
    parallel_fill(n, pattern.len(), pattern[0].clone(), |_, chunk| {
        chunk.clone_from_slice(pattern)
    })
}
