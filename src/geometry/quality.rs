//! Element shape quality: the mean-ratio family.
//!
//! For a tetrahedron with volume `V` and edge-length-squared sum `S`, the
//! mean ratio cubed is `15552 V^2 / S^3`; for a triangle with area `A` it is
//! `48 A^2 / S^2`. Both live in `[0, 1]` with the equilateral simplex at 1,
//! degenerate elements at 0, and inverted elements negative (the signed
//! measure carries through squared terms via `copysign`-free negation below).
//!
//! Sources: Li, Shephard & Beall, "3D anisotropic mesh adaptation by mesh
//! modification", CMAME 194 (2005); the triangle variant is the same
//! measure's 2D form.

use crate::geometry::{
    determinant, dot, element_size, gather_symms, mat_vec, sub_v, Matrix, Vector,
};
use crate::topology::{down_template, simplex_degree, Lo};

/// Triangle mean ratio squared from area and edge lengths squared.
#[inline]
pub fn triangle_mean_ratio_squared(a: f64, lsq: &[f64; 3]) -> f64 {
    let s: f64 = lsq.iter().sum();
    48.0 * (a * a.abs()) / (s * s)
}

/// Tet mean ratio cubed from volume and edge lengths squared.
#[inline]
pub fn tet_mean_ratio_cubed(v: f64, lsq: &[f64; 6]) -> f64 {
    let s: f64 = lsq.iter().sum();
    15552.0 * (v * v.abs()) / (s * s * s)
}

/// Mean-ratio quality from a (possibly metric-space) signed size and edge
/// lengths squared, dispatched on dimension.
pub fn mean_ratio<const D: usize>(size: f64, lsq: &[f64]) -> f64 {
    match D {
        2 => {
            debug_assert_eq!(lsq.len(), 3);
            triangle_mean_ratio_squared(size, &[lsq[0], lsq[1], lsq[2]])
        }
        3 => {
            debug_assert_eq!(lsq.len(), 6);
            tet_mean_ratio_cubed(
                size,
                &[lsq[0], lsq[1], lsq[2], lsq[3], lsq[4], lsq[5]],
            )
        }
        _ => unreachable!("mean_ratio only for D in {{2, 3}}"),
    }
}

/// Edge vectors of a simplex in template order.
pub fn element_edge_vectors<const D: usize, const N: usize>(
    p: &[Vector<D>; N],
) -> Vec<Vector<D>> {
    let deg = simplex_degree(D, 1);
    (0..deg)
        .map(|e| {
            let a = down_template(D, 1, e, 0);
            let b = down_template(D, 1, e, 1);
            sub_v(p[b], p[a])
        })
        .collect()
}

/// Quality of a simplex in plain coordinates.
pub fn real_element_quality<const D: usize, const N: usize>(p: &[Vector<D>; N]) -> f64 {
    let size = element_size::<D, N>(p);
    let lsq: Vec<f64> = element_edge_vectors(p)
        .into_iter()
        .map(|v| dot(v, v))
        .collect();
    mean_ratio::<D>(size, &lsq)
}

/// Quality of a simplex as seen through one metric tensor: edge lengths are
/// measured in the metric and the signed size scales by `sqrt(det M)`.
pub fn metric_element_quality<const D: usize, const N: usize>(
    p: &[Vector<D>; N],
    m: &Matrix<D>,
) -> f64 {
    let size = element_size::<D, N>(p) * determinant(m).sqrt();
    let lsq: Vec<f64> = element_edge_vectors(p)
        .into_iter()
        .map(|v| dot(v, mat_vec(m, v)))
        .collect();
    mean_ratio::<D>(size, &lsq)
}

/// Quality of a simplex with one metric per vertex: edge lengths average the
/// endpoint quadratic forms, the size uses the log-averaged metric.
pub fn hetero_metric_element_quality<const D: usize, const N: usize>(
    p: &[Vector<D>; N],
    ms: &[Matrix<D>; N],
) -> f64 {
    let avg = crate::metric::average_metrics(ms.as_slice());
    let size = element_size::<D, N>(p) * determinant(&avg).sqrt();
    let deg = simplex_degree(D, 1);
    let mut lsq = Vec::with_capacity(deg);
    for e in 0..deg {
        let a = down_template(D, 1, e, 0);
        let b = down_template(D, 1, e, 1);
        let v = sub_v(p[b], p[a]);
        lsq.push(0.5 * (dot(v, mat_vec(&ms[a], v)) + dot(v, mat_vec(&ms[b], v))));
    }
    mean_ratio::<D>(size, &lsq)
}

/// Per-element qualities over a whole connectivity buffer, in plain
/// coordinates.
pub fn all_real_qualities<const D: usize, const N: usize>(
    ev2v: &[Lo],
    coords: &[f64],
) -> Vec<f64> {
    let n = ev2v.len() / N;
    crate::algs::arrays::parallel_map(n, |e| {
        let p = crate::geometry::gather_vectors::<D, N>(coords, &ev2v[e * N..(e + 1) * N]);
        real_element_quality(&p)
    })
}

/// Per-element qualities under a vertex metric field.
pub fn all_metric_qualities<const D: usize, const N: usize>(
    ev2v: &[Lo],
    coords: &[f64],
    metrics: &[f64],
) -> Vec<f64> {
    let n = ev2v.len() / N;
    crate::algs::arrays::parallel_map(n, |e| {
        let verts = &ev2v[e * N..(e + 1) * N];
        let p = crate::geometry::gather_vectors::<D, N>(coords, verts);
        let ms = gather_symms::<D, N>(metrics, verts);
        hetero_metric_element_quality(&p, &ms)
    })
}
