//! Gradient and Hessian recovery from vertex fields.
//!
//! Recovery fits a full quadratic polynomial to the vertex values over each
//! vertex's neighbor patch (least squares, widened ring by ring while the
//! normal system is rank-deficient) and reads derivatives off the fit. A
//! quadratic vertex field is therefore recovered exactly at every vertex,
//! boundary included.

use crate::algs::arrays::parallel_fill;
use crate::geometry::{set_symm, sym_dofs, Matrix};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::metric::gauss_solve;
use crate::topology::{Lo, Mesh, VERT};

/// Coefficient count of a full quadratic in `dim` variables.
fn nparams(dim: usize) -> usize {
    1 + dim + sym_dofs(dim)
}

/// Quadratic monomial basis at offset `dx`, scaled coordinates.
/// Order: 1, x_i..., x_i^2..., then upper products row-major.
fn basis<const D: usize>(dx: [f64; D]) -> [f64; 10] {
    let mut b = [0.0; 10];
    b[0] = 1.0;
    for i in 0..D {
        b[1 + i] = dx[i];
        b[1 + D + i] = dx[i] * dx[i];
    }
    let mut k = 1 + 2 * D;
    for i in 0..D {
        for j in i + 1..D {
            b[k] = dx[i] * dx[j];
            k += 1;
        }
    }
    b
}

/// One ring of vertices around the given seed set (excluding the seeds).
fn next_ring(star: &crate::topology::Graph, seeds: &[Lo]) -> Vec<Lo> {
    let mut out = Vec::new();
    for &s in seeds {
        for &u in star.row(s as usize) {
            if !seeds.contains(&u) && !out.contains(&u) {
                out.push(u);
            }
        }
    }
    out
}

struct PatchFit<const D: usize> {
    coeffs: [f64; 10],
    scale: f64,
}

impl<const D: usize> PatchFit<D> {
    fn value(&self) -> f64 {
        self.coeffs[0]
    }

    fn gradient(&self) -> [f64; D] {
        std::array::from_fn(|i| self.coeffs[1 + i] / self.scale)
    }

    fn hessian(&self) -> Matrix<D> {
        let s2 = self.scale * self.scale;
        let mut m = [[0.0; D]; D];
        for i in 0..D {
            m[i][i] = 2.0 * self.coeffs[1 + D + i] / s2;
        }
        let mut k = 1 + 2 * D;
        for i in 0..D {
            for j in i + 1..D {
                m[i][j] = self.coeffs[k] / s2;
                m[j][i] = m[i][j];
                k += 1;
            }
        }
        m
    }
}

fn fit_patch<const D: usize>(
    coords: &[f64],
    values: &[f64],
    v: usize,
    patch: &[Lo],
) -> Option<PatchFit<D>> {
    let np = nparams(D);
    let x_v: [f64; D] = std::array::from_fn(|d| coords[v * D + d]);
    // scale offsets to the patch radius for conditioning
    let mut scale = 0.0f64;
    for &u in patch {
        for d in 0..D {
            scale = scale.max((coords[u as usize * D + d] - x_v[d]).abs());
        }
    }
    if scale == 0.0 {
        return None;
    }
    let mut normal = [[0.0f64; 11]; 10];
    for &u in patch {
        let dx: [f64; D] =
            std::array::from_fn(|d| (coords[u as usize * D + d] - x_v[d]) / scale);
        let b = basis::<D>(dx);
        let val = values[u as usize];
        for i in 0..np {
            for j in 0..np {
                normal[i][j] += b[i] * b[j];
            }
            normal[i][np] += b[i] * val;
        }
    }
    let coeffs = gauss_solve(np, &mut normal)?;
    Some(PatchFit { coeffs, scale })
}

fn fit_at_vertex<const D: usize>(
    mesh: &Mesh,
    star: &crate::topology::Graph,
    values: &[f64],
    v: usize,
) -> Option<PatchFit<D>> {
    let coords = mesh.coords();
    let mut patch: Vec<Lo> = vec![v as Lo];
    patch.extend_from_slice(star.row(v));
    for _ in 0..3 {
        if patch.len() >= nparams(D) {
            if let Some(fit) = fit_patch::<D>(coords, values, v, &patch) {
                return Some(fit);
            }
        }
        patch.extend(next_ring(star, &patch));
    }
    fit_patch::<D>(coords, values, v, &patch)
}

fn recover_dim<const D: usize, F: Fn(&PatchFit<D>, &mut [f64]) + Send + Sync>(
    mesh: &Mesh,
    values: &[f64],
    width: usize,
    emit: F,
) -> Result<Vec<f64>> {
    if values.len() != mesh.nverts() {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: values.len(),
            width: 1,
        });
    }
    if !mesh.owners_have_all_upward(VERT) {
        return Err(MeshAdaptError::Precondition(
            "derivative recovery requires owners to see all upward adjacency".into(),
        ));
    }
    let star = mesh.ask_star(VERT);
    let out = parallel_fill(mesh.nverts(), width, 0.0, |v, chunk| {
        if let Some(fit) = fit_at_vertex::<D>(mesh, &star, values, v) {
            emit(&fit, chunk);
        }
    });
    mesh.sync_array(VERT, &out, width)
}

/// Recover vertex gradients of a scalar vertex field.
pub fn recover_gradients(mesh: &Mesh, values: &[f64]) -> Result<Vec<f64>> {
    match mesh.dim() {
        2 => recover_dim::<2, _>(mesh, values, 2, |fit, out| {
            out.copy_from_slice(&fit.gradient())
        }),
        _ => recover_dim::<3, _>(mesh, values, 3, |fit, out| {
            out.copy_from_slice(&fit.gradient())
        }),
    }
}

/// Recover per-vertex Hessians of a scalar vertex field, packed
/// symmetrically; exact for quadratic fields.
pub fn recover_hessians(mesh: &Mesh, values: &[f64]) -> Result<Vec<f64>> {
    match mesh.dim() {
        2 => recover_dim::<2, _>(mesh, values, sym_dofs(2), |fit, out| {
            set_symm::<2>(out, 0, &fit.hessian())
        }),
        _ => recover_dim::<3, _>(mesh, values, sym_dofs(3), |fit, out| {
            set_symm::<3>(out, 0, &fit.hessian())
        }),
    }
}

/// Recover the smoothed field itself (the fit evaluated at each vertex).
pub fn recover_values(mesh: &Mesh, values: &[f64]) -> Result<Vec<f64>> {
    match mesh.dim() {
        2 => recover_dim::<2, _>(mesh, values, 1, |fit, out| out[0] = fit.value()),
        _ => recover_dim::<3, _>(mesh, values, 1, |fit, out| out[0] = fit.value()),
    }
}
