//! Symmetric eigendecomposition for 2x2 and 3x3 matrices.
//!
//! 2x2 uses the closed form. 3x3 goes through the characteristic cubic,
//! solved in depressed trigonometric form with explicit multiplicity
//! detection; eigenvectors are extracted as kernels of `M - lambda I` and
//! degenerate spaces are completed by Gram-Schmidt. The zero matrix
//! decomposes to the identity basis, which is the limit value the rest of
//! the kernel relies on for degenerate input.

use crate::geometry::{
    cross, dot, form_ortho_basis, invert, mat_mul, normalize, outer, sub_v, transpose,
    Matrix, Vector,
};

/// Eigenbasis (as an array of eigenvectors) with matching eigenvalues.
#[derive(Clone, Copy, Debug)]
pub struct EigenDecomp<const D: usize> {
    pub q: [Vector<D>; D],
    pub l: [f64; D],
}

/// Roots of a cubic with multiplicities; duplicated roots come last.
#[derive(Clone, Copy, Debug)]
pub struct CubicRoots {
    pub n: usize,
    pub roots: [f64; 3],
    pub mults: [usize; 3],
}

/// Real roots of `x^3 + a x^2 + b x + c`, with multiplicity. Repeated roots
/// are merged and ordered after the simple ones.
pub fn solve_cubic(a: f64, b: f64, c: f64) -> CubicRoots {
    // depressed form t^3 + p t + q, x = t - a/3
    let p = b - a * a / 3.0;
    let q = c + (2.0 * a * a * a - 9.0 * a * b) / 27.0;
    let shift = -a / 3.0;
    let scale = (q * q / 4.0).abs() + (p * p * p / 27.0).abs();
    let tol = 1e-12 * scale.max(f64::MIN_POSITIVE);
    if scale <= f64::MIN_POSITIVE {
        return CubicRoots {
            n: 1,
            roots: [shift, 0.0, 0.0],
            mults: [3, 0, 0],
        };
    }
    let disc = q * q / 4.0 + p * p * p / 27.0;
    if disc > tol {
        let s = (-q / 2.0 + disc.sqrt()).cbrt();
        let t = (-q / 2.0 - disc.sqrt()).cbrt();
        CubicRoots {
            n: 1,
            roots: [s + t + shift, 0.0, 0.0],
            mults: [1, 0, 0],
        }
    } else if disc < -tol {
        // three distinct roots via the trigonometric form
        let amp = 2.0 * (-p / 3.0).sqrt();
        let arg = (3.0 * q / (2.0 * p) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0);
        let theta = arg.acos();
        let mut roots = [0.0; 3];
        for (k, r) in roots.iter_mut().enumerate() {
            *r = amp * ((theta + 2.0 * std::f64::consts::PI * k as f64) / 3.0).cos() + shift;
        }
        CubicRoots {
            n: 3,
            roots,
            mults: [1, 1, 1],
        }
    } else {
        // vanishing discriminant: a repeated root. The root magnitude scale
        // separates the triple case (p and q both vanish) from the double.
        let xscale = p.abs().sqrt().max(q.abs().cbrt());
        if p.abs() <= 1e-10 * xscale * xscale {
            return CubicRoots {
                n: 1,
                roots: [shift, 0.0, 0.0],
                mults: [3, 0, 0],
            };
        }
        let single = 3.0 * q / p + shift;
        let double = -3.0 * q / (2.0 * p) + shift;
        if crate::algs::arrays::are_close(single, double) {
            return CubicRoots {
                n: 1,
                roots: [(single + 2.0 * double) / 3.0, 0.0, 0.0],
                mults: [3, 0, 0],
            };
        }
        CubicRoots {
            n: 2,
            roots: [single, double, 0.0],
            mults: [1, 2, 0],
        }
    }
}

/// `Q diag(l) Q^{-1}` for a general eigenbasis.
pub fn compose_eigen<const D: usize>(q: &[Vector<D>; D], l: &[f64; D]) -> Matrix<D> {
    let cols: Matrix<D> = transpose(&std::array::from_fn(|i| q[i]));
    let mut scaled = cols;
    for i in 0..D {
        for j in 0..D {
            scaled[i][j] *= l[j];
        }
    }
    mat_mul(&scaled, &invert(&cols))
}

/// `Q diag(l) Q^T` for an orthonormal eigenbasis.
pub fn compose_ortho<const D: usize>(q: &[Vector<D>; D], l: &[f64; D]) -> Matrix<D> {
    let mut m = [[0.0; D]; D];
    for k in 0..D {
        debug_assert!((dot(q[k], q[k]) - 1.0).abs() < 1e-6, "basis not unit");
        let o = outer(q[k], q[k]);
        for i in 0..D {
            for j in 0..D {
                m[i][j] += l[k] * o[i][j];
            }
        }
    }
    m
}

fn max_abs<const D: usize>(m: &Matrix<D>) -> f64 {
    let mut s = 0.0f64;
    for row in m {
        for &x in row {
            s = s.max(x.abs());
        }
    }
    s
}

fn decompose_2x2(m: &Matrix<2>) -> EigenDecomp<2> {
    let (a, b, c) = (m[0][0], m[0][1], m[1][1]);
    let scale = a.abs().max(b.abs()).max(c.abs());
    if scale == 0.0 || b.abs() <= 1e-15 * scale {
        return EigenDecomp {
            q: [[1.0, 0.0], [0.0, 1.0]],
            l: [a, c],
        };
    }
    let mid = 0.5 * (a + c);
    let rad = (0.25 * (a - c) * (a - c) + b * b).sqrt();
    let l = [mid + rad, mid - rad];
    // rows of (M - l0 I) span the complement of the first eigenvector
    let v0: Vector<2> = if (a - l[0]).abs() > (c - l[0]).abs() {
        [b, l[0] - a]
    } else {
        [l[0] - c, b]
    };
    let q0 = normalize(v0);
    let q1 = [-q0[1], q0[0]];
    EigenDecomp { q: [q0, q1], l }
}

fn single_eigenvector(m: &Matrix<3>, l: f64) -> Vector<3> {
    let a: Matrix<3> = std::array::from_fn(|i| {
        std::array::from_fn(|j| m[i][j] - if i == j { l } else { 0.0 })
    });
    let candidates = [
        cross(a[0], a[1]),
        cross(a[0], a[2]),
        cross(a[1], a[2]),
    ];
    let mut best = candidates[0];
    for c in &candidates[1..] {
        if dot(*c, *c) > dot(best, best) {
            best = *c;
        }
    }
    normalize(best)
}

fn decompose_3x3(m: &Matrix<3>) -> EigenDecomp<3> {
    let ident: [Vector<3>; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let scale = max_abs(m);
    if scale == 0.0 {
        return EigenDecomp {
            q: ident,
            l: [0.0; 3],
        };
    }
    let s: Matrix<3> = std::array::from_fn(|i| std::array::from_fn(|j| m[i][j] / scale));
    let tr = s[0][0] + s[1][1] + s[2][2];
    let minors = s[0][0] * s[1][1] - s[0][1] * s[1][0]
        + s[1][1] * s[2][2] - s[1][2] * s[2][1]
        + s[0][0] * s[2][2] - s[0][2] * s[2][0];
    let det = crate::geometry::determinant(&s);
    let roots = solve_cubic(-tr, minors, -det);
    match roots.n {
        1 => EigenDecomp {
            q: ident,
            l: [roots.roots[0] * scale; 3],
        },
        2 => {
            // simple root first; its eigenvector anchors the basis and the
            // double root's plane is completed orthogonally
            let q0 = single_eigenvector(&s, roots.roots[0]);
            let basis = form_ortho_basis(q0);
            EigenDecomp {
                q: basis,
                l: [
                    roots.roots[0] * scale,
                    roots.roots[1] * scale,
                    roots.roots[1] * scale,
                ],
            }
        }
        _ => {
            let q0 = single_eigenvector(&s, roots.roots[0]);
            let q1raw = single_eigenvector(&s, roots.roots[1]);
            // Gram-Schmidt guards against loss of orthogonality when two
            // roots are merely close
            let q1 = normalize(sub_v(q1raw, crate::geometry::scale_v(q0, dot(q0, q1raw))));
            let q2 = cross(q0, q1);
            EigenDecomp {
                q: [q0, q1, q2],
                l: [
                    roots.roots[0] * scale,
                    roots.roots[1] * scale,
                    roots.roots[2] * scale,
                ],
            }
        }
    }
}

/// Eigendecomposition of a symmetric `D x D` matrix.
pub fn decompose_eigen<const D: usize>(m: &Matrix<D>) -> EigenDecomp<D> {
    match D {
        2 => {
            let m2: Matrix<2> = std::array::from_fn(|i| std::array::from_fn(|j| m[i][j]));
            let d = decompose_2x2(&m2);
            EigenDecomp {
                q: std::array::from_fn(|i| std::array::from_fn(|j| d.q[i][j])),
                l: std::array::from_fn(|i| d.l[i]),
            }
        }
        3 => {
            let m3: Matrix<3> = std::array::from_fn(|i| std::array::from_fn(|j| m[i][j]));
            let d = decompose_3x3(&m3);
            EigenDecomp {
                q: std::array::from_fn(|i| std::array::from_fn(|j| d.q[i][j])),
                l: std::array::from_fn(|i| d.l[i]),
            }
        }
        _ => unreachable!("decompose_eigen only for D in {{2, 3}}"),
    }
}
