//! Anisotropic metric algebra.
//!
//! A metric is a symmetric positive-definite matrix whose unit ball's
//! principal axes give the desired edge directions and lengths. This module
//! holds the single-tensor operations; buffer-level services over a mesh
//! (interpolation, projection, gradation, scaling) live in [`field`], and
//! Hessian recovery in [`hessian`].

pub mod field;
pub mod hessian;

use crate::geometry::eigen::{compose_ortho, decompose_eigen, EigenDecomp};
use crate::geometry::{
    determinant, dot, mat_mul, mat_vec, norm, scale_v, sub_v, Matrix, Vector,
};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::topology::{down_template, simplex_degree, Lo};

pub use crate::geometry::sym_dofs;

/// Metric eigenvalues from desired lengths: `1 / h^2`.
pub fn metric_eigenvalues<const D: usize>(h: [f64; D]) -> [f64; D] {
    std::array::from_fn(|i| 1.0 / (h[i] * h[i]))
}

/// Metric with orthonormal axes `q` and desired lengths `h`.
pub fn compose_metric<const D: usize>(q: &[Vector<D>; D], h: [f64; D]) -> Matrix<D> {
    compose_ortho(q, &metric_eigenvalues(h))
}

/// Desired edge length along direction `dir` under metric `m`.
pub fn metric_desired_length<const D: usize>(m: &Matrix<D>, dir: Vector<D>) -> f64 {
    1.0 / dot(dir, mat_vec(m, dir)).sqrt()
}

/// Principal axes scaled by their desired lengths, for visualization and
/// coarsening directions.
pub fn axes_from_metric<const D: usize>(m: &Matrix<D>) -> [Vector<D>; D] {
    let d = decompose_eigen(m);
    std::array::from_fn(|i| scale_v(d.q[i], 1.0 / d.l[i].sqrt()))
}

fn spd_decompose<const D: usize>(m: &Matrix<D>) -> Result<EigenDecomp<D>> {
    let d = decompose_eigen(m);
    for &l in &d.l {
        if l <= 0.0 {
            return Err(MeshAdaptError::NotPositiveDefinite(l));
        }
    }
    Ok(d)
}

/// Symmetric matrix logarithm of an SPD metric.
pub fn linearize_metric<const D: usize>(m: &Matrix<D>) -> Result<Matrix<D>> {
    let d = spd_decompose(m)?;
    Ok(compose_ortho(&d.q, &d.l.map(f64::ln)))
}

/// Symmetric matrix exponential; inverse of [`linearize_metric`].
pub fn delinearize_metric<const D: usize>(lm: &Matrix<D>) -> Matrix<D> {
    let d = decompose_eigen(lm);
    compose_ortho(&d.q, &d.l.map(f64::exp))
}

/// Log-domain convex combination of two metrics.
pub fn interpolate_metrics<const D: usize>(
    a: &Matrix<D>,
    b: &Matrix<D>,
    t: f64,
) -> Result<Matrix<D>> {
    let la = linearize_metric(a)?;
    let lb = linearize_metric(b)?;
    let mix: Matrix<D> =
        std::array::from_fn(|i| std::array::from_fn(|j| (1.0 - t) * la[i][j] + t * lb[i][j]));
    Ok(delinearize_metric(&mix))
}

/// Log-domain average of a set of metrics. Non-SPD entries are a caller bug;
/// this inner kernel asserts rather than reporting.
pub fn average_metrics<const D: usize>(ms: &[Matrix<D>]) -> Matrix<D> {
    debug_assert!(!ms.is_empty());
    let mut acc = [[0.0; D]; D];
    for m in ms {
        let d = decompose_eigen(m);
        debug_assert!(d.l.iter().all(|&l| l > 0.0), "metric not SPD");
        let lm = compose_ortho(&d.q, &d.l.map(f64::ln));
        for i in 0..D {
            for j in 0..D {
                acc[i][j] += lm[i][j];
            }
        }
    }
    let inv = 1.0 / ms.len() as f64;
    for row in &mut acc {
        for x in row {
            *x *= inv;
        }
    }
    delinearize_metric(&acc)
}

/// Intersection of two metrics by simultaneous reduction: the result's unit
/// ball is (to within eigensolver accuracy) the intersection of the input
/// balls, and `intersect(M, M) = M`.
///
/// Reduction goes through `M1^{-1/2}`: with
/// `B = M1^{-1/2} M2 M1^{-1/2} = U diag(beta) U^T`, the common eigenframe is
/// `P = M1^{-1/2} U` and the intersection takes `max(1, beta_i)` per axis.
pub fn intersect_metrics<const D: usize>(m1: &Matrix<D>, m2: &Matrix<D>) -> Result<Matrix<D>> {
    let d1 = spd_decompose(m1)?;
    let sqrt1 = compose_ortho(&d1.q, &d1.l.map(f64::sqrt));
    let inv_sqrt1 = compose_ortho(&d1.q, &d1.l.map(|l| 1.0 / l.sqrt()));
    let b = mat_mul(&mat_mul(&inv_sqrt1, m2), &inv_sqrt1);
    // symmetrize against roundoff before decomposing
    let b: Matrix<D> = std::array::from_fn(|i| {
        std::array::from_fn(|j| 0.5 * (b[i][j] + b[j][i]))
    });
    let db = spd_decompose(&b)?;
    let l: [f64; D] = db.l.map(|beta| beta.max(1.0));
    let core = compose_ortho(&db.q, &l);
    let out = mat_mul(&mat_mul(&sqrt1, &core), &sqrt1);
    Ok(std::array::from_fn(|i| {
        std::array::from_fn(|j| 0.5 * (out[i][j] + out[j][i]))
    }))
}

/// Length of an edge whose endpoint lengths disagree: the exact integral of
/// the log-interpolated metric along the edge, `(l_a - l_b) / ln(l_a / l_b)`,
/// falling back to the mean when the endpoints nearly agree. Halving a
/// segment in metric space halves this measure.
pub fn edge_length(l_a: f64, l_b: f64) -> f64 {
    if crate::algs::arrays::are_close_with(l_a, l_b, 1e-6, 0.0) {
        return 0.5 * (l_a + l_b);
    }
    (l_a - l_b) / (l_a / l_b).ln()
}

/// Edge length under endpoint metric tensors.
pub fn metric_edge_length<const D: usize>(
    x_a: Vector<D>,
    x_b: Vector<D>,
    m_a: &Matrix<D>,
    m_b: &Matrix<D>,
) -> f64 {
    let v = sub_v(x_b, x_a);
    let l_a = dot(v, mat_vec(m_a, v)).sqrt();
    let l_b = dot(v, mat_vec(m_b, v)).sqrt();
    edge_length(l_a, l_b)
}

/// Edge length under endpoint isotropic sizes.
pub fn iso_edge_length<const D: usize>(
    x_a: Vector<D>,
    x_b: Vector<D>,
    h_a: f64,
    h_b: f64,
) -> f64 {
    let real = norm(sub_v(x_b, x_a));
    edge_length(real / h_a, real / h_b)
}

/// Gaussian elimination with partial pivoting on an `n x n` system with its
/// right-hand side in column `n`. Storage is fixed at the largest caller
/// (the 3D quadratic patch fit); `None` signals a singular system.
pub(crate) fn gauss_solve<const R: usize, const C: usize>(
    n: usize,
    a: &mut [[f64; C]; R],
) -> Option<[f64; R]> {
    debug_assert!(n <= R && n < C);
    let mut amax = 0.0f64;
    for row in a.iter().take(n) {
        for &x in row.iter().take(n) {
            amax = amax.max(x.abs());
        }
    }
    if amax == 0.0 {
        return None;
    }
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-14 * amax {
            return None;
        }
        a.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..=n {
                a[row][k] -= f * a[col][k];
            }
        }
    }
    let mut x = [0.0; R];
    for col in (0..n).rev() {
        let mut s = a[col][n];
        for k in col + 1..n {
            s -= a[col][k] * x[k];
        }
        x[col] = s / a[col][col];
    }
    Some(x)
}

/// The unique metric under which every edge of the simplex has length one,
/// from inverting the edge Gram relation.
pub fn element_implied_metric<const D: usize, const N: usize>(
    p: &[Vector<D>; N],
) -> Result<Matrix<D>> {
    let ndofs = sym_dofs(D);
    let nedges = simplex_degree(D, 1);
    debug_assert_eq!(ndofs, nedges);
    let mut system = [[0.0; 7]; 6];
    for e in 0..nedges {
        let a = down_template(D, 1, e, 0);
        let b = down_template(D, 1, e, 1);
        let v = sub_v(p[b], p[a]);
        // unknown order matches the symmetric packing: diagonal then upper
        for i in 0..D {
            system[e][i] = v[i] * v[i];
        }
        let mut k = D;
        for i in 0..D {
            for j in i + 1..D {
                system[e][k] = 2.0 * v[i] * v[j];
                k += 1;
            }
        }
        system[e][ndofs] = 1.0;
    }
    let x = gauss_solve(ndofs, &mut system).ok_or_else(|| {
        MeshAdaptError::Precondition("degenerate element has no implied metric".into())
    })?;
    let m = crate::geometry::get_symm::<D>(&x[..ndofs], 0);
    spd_decompose(&m)?;
    Ok(m)
}

/// Hessian-driven metric with error equidistribution (Alauzet & Frey):
/// eigenvalues of `|H|` scale by `dim^2 / (2 (dim+1)^2 eps)` and clamp into
/// the `[1/h_max^2, 1/h_min^2]` band.
pub fn metric_from_hessian<const D: usize>(
    hessian: &Matrix<D>,
    eps: f64,
    h_min: f64,
    h_max: f64,
) -> Matrix<D> {
    let d = decompose_eigen(hessian);
    let c_num = (D * D) as f64;
    let c_denom = 2.0 * ((D + 1) * (D + 1)) as f64;
    let l: [f64; D] = std::array::from_fn(|i| {
        let val = c_num * d.l[i].abs() / (c_denom * eps);
        val.clamp(1.0 / (h_max * h_max), 1.0 / (h_min * h_min))
    });
    compose_ortho(&d.q, &l)
}

/// Metric size factor `sqrt(det M)`: the ratio of metric measure to real
/// measure for any region.
pub fn metric_size_factor<const D: usize>(m: &Matrix<D>) -> f64 {
    determinant(m).sqrt()
}

/// Measure of the regular `dim`-simplex with unit edges; the target element
/// measure in metric space.
pub fn unit_simplex_size(dim: usize) -> f64 {
    match dim {
        2 => 3.0f64.sqrt() / 4.0,
        3 => 2.0f64.sqrt() / 12.0,
        _ => unreachable!("unit_simplex_size only for 2 and 3"),
    }
}

/// Gather per-vertex packed metrics for one entity.
pub fn gather_metrics<const D: usize, const N: usize>(
    metrics: &[f64],
    verts: &[Lo],
) -> [Matrix<D>; N] {
    crate::geometry::gather_symms::<D, N>(metrics, verts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{mat_mul, rotate_2d, rotate_3d};
    use approx::assert_relative_eq;

    fn frame_3d() -> [Vector<3>; 3] {
        let pi = std::f64::consts::PI;
        let q = mat_mul(
            &rotate_3d(pi / 4.0, [0.0, 0.0, 1.0]),
            &rotate_3d(pi / 4.0, [0.0, 1.0, 0.0]),
        );
        std::array::from_fn(|i| [q[0][i], q[1][i], q[2][i]])
    }

    fn assert_mat_close<const D: usize>(a: &Matrix<D>, b: &Matrix<D>, tol: f64) {
        for i in 0..D {
            for j in 0..D {
                assert_relative_eq!(a[i][j], b[i][j], epsilon = tol, max_relative = tol);
            }
        }
    }

    #[test]
    fn log_exp_roundtrip() {
        let frame = frame_3d();
        let m = compose_metric(&frame, [0.1, 1.0, 10.0]);
        let back = delinearize_metric(&linearize_metric(&m).unwrap());
        assert_mat_close(&m, &back, 1e-10);
        let m2 = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.5, 2.0]);
        let back2 = delinearize_metric(&linearize_metric(&m2).unwrap());
        assert_mat_close(&m2, &back2, 1e-12);
    }

    #[test]
    fn non_spd_metric_is_rejected() {
        let m: Matrix<2> = [[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            linearize_metric(&m),
            Err(MeshAdaptError::NotPositiveDefinite(_))
        ));
    }

    #[test]
    fn interpolation_hits_endpoints_and_stays_spd() {
        let a = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.01, 1.0]);
        let b = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [1.0, 1.0]);
        assert_mat_close(&interpolate_metrics(&a, &b, 0.0).unwrap(), &a, 1e-10);
        assert_mat_close(&interpolate_metrics(&a, &b, 1.0).unwrap(), &b, 1e-10);
        for k in 0..=10 {
            let t = k as f64 / 10.0;
            let m = interpolate_metrics(&a, &b, t).unwrap();
            let d = decompose_eigen(&m);
            assert!(d.l.iter().all(|&l| l > 0.0));
        }
    }

    /// Intersections in a shared frame take the stricter length per axis.
    #[test]
    fn intersect_in_shared_frame() {
        let frame = frame_3d();
        let cases = [
            ([0.5, 1.0, 1.0], [1.0, 0.5, 1.0], [0.5, 0.5, 1.0]),
            ([1e-3, 1.0, 1.0], [1.0, 1.0, 1e-3], [1e-3, 1.0, 1e-3]),
            ([1e-3, 1e-3, 1.0], [1.0, 1.0, 1e-3], [1e-3, 1e-3, 1e-3]),
            ([1e-6, 1e-3, 1e-3], [1e-3, 1e-3, 1e-6], [1e-6, 1e-3, 1e-6]),
        ];
        for (h1, h2, want) in cases {
            let m1 = compose_metric(&frame, h1);
            let m2 = compose_metric(&frame, h2);
            let mi = intersect_metrics(&m1, &m2).unwrap();
            for i in 0..3 {
                let got = metric_desired_length(&mi, frame[i]);
                assert_relative_eq!(got, want[i], max_relative = 1e-3);
            }
        }
    }

    /// When one ellipsoid contains the other, intersection returns the
    /// stricter metric exactly.
    #[test]
    fn intersect_subset_returns_stricter() {
        let m1 = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [1.0, 2.0]);
        let r = rotate_2d(std::f64::consts::PI / 4.0);
        let frame2: [Vector<2>; 2] = std::array::from_fn(|i| [r[0][i], r[1][i]]);
        let m2 = compose_metric(&frame2, [2.0, 3.0]);
        assert_mat_close(&intersect_metrics(&m2, &m1).unwrap(), &m1, 1e-9);
        assert_mat_close(&intersect_metrics(&m1, &m2).unwrap(), &m1, 1e-9);
    }

    #[test]
    fn intersect_self_is_identity_map() {
        let frame = frame_3d();
        let m = compose_metric(&frame, [0.1, 1.0, 7.0]);
        assert_mat_close(&intersect_metrics(&m, &m).unwrap(), &m, 1e-9);
    }

    #[test]
    fn intersection_ball_contained_in_both() {
        let m1 = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [1.0, 0.25]);
        let r = rotate_2d(0.6);
        let frame2: [Vector<2>; 2] = std::array::from_fn(|i| [r[0][i], r[1][i]]);
        let m2 = compose_metric(&frame2, [0.5, 2.0]);
        let mi = intersect_metrics(&m1, &m2).unwrap();
        for k in 0..32 {
            let ang = k as f64 * std::f64::consts::PI / 16.0;
            let v = [ang.cos(), ang.sin()];
            let qi = dot(v, mat_vec(&mi, v));
            let q1 = dot(v, mat_vec(&m1, v));
            let q2 = dot(v, mat_vec(&m2, v));
            assert!(qi >= q1.max(q2) - 1e-8);
        }
    }

    #[test]
    fn log_mean_edge_length() {
        assert_relative_eq!(edge_length(1.0, 1.0), 1.0);
        let l = edge_length(1.0, 2.0);
        assert!(l > 1.0 && l < 1.5);
        assert_relative_eq!(l, 1.0 / 2.0f64.ln(), epsilon = 1e-12);
        // symmetric in its arguments
        assert_relative_eq!(edge_length(2.0, 1.0), l, epsilon = 1e-12);
    }

    #[test]
    fn metric_length_halves_on_split() {
        let m = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.2, 5.0]);
        let a = [0.0, 0.0];
        let b = [1.0, 1.0];
        let mid = [0.5, 0.5];
        let whole = metric_edge_length(a, b, &m, &m);
        let half = metric_edge_length(a, mid, &m, &m);
        assert_relative_eq!(half, whole / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn iso_length_is_size_relative() {
        assert_relative_eq!(
            iso_edge_length([0.0, 0.0], [2.0, 0.0], 1.0, 1.0),
            2.0
        );
        assert_relative_eq!(
            iso_edge_length([0.0, 0.0], [2.0, 0.0], 2.0, 2.0),
            1.0
        );
    }

    /// Perfect simplices with edge length 2 imply the metric that asks for
    /// length-2 edges.
    #[test]
    fn implied_metric_of_perfect_elements() {
        let tri: [Vector<2>; 3] = [[1.0, 0.0], [0.0, 3.0f64.sqrt()], [-1.0, 0.0]];
        let want2 = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [2.0, 2.0]);
        assert_mat_close(&element_implied_metric(&tri).unwrap(), &want2, 1e-12);

        let z = 1.0 / 2.0f64.sqrt();
        let tet: [Vector<3>; 4] =
            [[1.0, 0.0, -z], [-1.0, 0.0, -z], [0.0, -1.0, z], [0.0, 1.0, z]];
        let frame: [Vector<3>; 3] =
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let want3 = compose_metric(&frame, [2.0, 2.0, 2.0]);
        assert_mat_close(&element_implied_metric(&tet).unwrap(), &want3, 1e-12);
    }

    #[test]
    fn degenerate_element_has_no_implied_metric() {
        let flat: [Vector<2>; 3] = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        assert!(element_implied_metric(&flat).is_err());
    }

    #[test]
    fn hessian_metric_clamps_to_band() {
        let hess: Matrix<2> = [[2.0, 0.0], [0.0, -8.0]];
        let m = metric_from_hessian(&hess, 1e-2, 0.05, 10.0);
        let d = decompose_eigen(&m);
        for l in d.l {
            assert!(l >= 1.0 / (10.0 * 10.0) - 1e-12);
            assert!(l <= 1.0 / (0.05 * 0.05) + 1e-12);
        }
        // in-band eigenvalue matches the equidistribution constant
        let expect = 4.0 * 8.0 / (2.0 * 9.0 * 1e-2);
        let got = d.l.iter().cloned().fold(0.0f64, f64::max);
        assert_relative_eq!(got, expect, epsilon = 1e-9);
    }

    #[test]
    fn axes_scale_by_desired_length() {
        let m = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.5, 4.0]);
        let axes = axes_from_metric(&m);
        let mut lens: Vec<f64> = axes.iter().map(|a| norm(*a)).collect();
        lens.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(lens[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(lens[1], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn unit_sizes() {
        assert_relative_eq!(unit_simplex_size(2), 3.0f64.sqrt() / 4.0);
        assert_relative_eq!(unit_simplex_size(3), 2.0f64.sqrt() / 12.0);
    }
}
