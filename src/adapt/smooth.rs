//! Vertex smoothing: Laplacian relaxation with classification pinning.
//!
//! `solve_laplacian` relaxes any vertex field to the graph-Laplacian
//! equilibrium with boundary-classified vertices held fixed. Position
//! smoothing applies one such sweep to the coordinates, clamps each
//! vertex's displacement to `max_motion_allowed`, and backs the whole move
//! off geometrically until no cell drops below the quality floor, so the
//! pass leaves a valid mesh on every branch.

use crate::adapt::mark::mark_by_class_dim;
use crate::adapt::AdaptOpts;
use crate::algs::arrays::{invert_marks, parallel_fill};
use crate::algs::map::collect_marked;
use crate::mesh_error::{MeshAdaptError, Result};
use crate::topology::{Lo, Mesh, VERT};

const MAX_LAPLACE_ITERS: usize = 1000;

/// Unweighted average of star-neighbor values per vertex.
fn graph_average(mesh: &Mesh, state: &[f64], width: usize) -> Vec<f64> {
    let star = mesh.ask_star(VERT);
    parallel_fill(mesh.nverts(), width, 0.0, |v, chunk| {
        let row = star.row(v);
        if row.is_empty() {
            chunk.copy_from_slice(&state[v * width..(v + 1) * width]);
            return;
        }
        for &u in row {
            for k in 0..width {
                chunk[k] += state[u as usize * width + k];
            }
        }
        for x in chunk {
            *x /= row.len() as f64;
        }
    })
}

/// Jacobi-iterate a vertex field to its Laplacian equilibrium, holding
/// vertices classified below the mesh dimension at their initial values.
/// Convergence is judged by `are_close` with the given tolerances across all
/// ranks; the iteration cap logs a warning and keeps the best iterate.
pub fn solve_laplacian(
    mesh: &Mesh,
    initial: &[f64],
    width: usize,
    tol: f64,
    floor: f64,
) -> Result<Vec<f64>> {
    if initial.len() != mesh.nverts() * width {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: initial.len(),
            width,
        });
    }
    if !mesh.owners_have_all_upward(VERT) {
        return Err(MeshAdaptError::Precondition(
            "laplacian smoothing requires owners to see all upward adjacency".into(),
        ));
    }
    let interior = mark_by_class_dim(mesh, VERT, mesh.dim() as i8)?;
    let boundary = invert_marks(&interior);
    let b2v = collect_marked(&boundary);
    let mut state = initial.to_vec();
    for niters in 1..=MAX_LAPLACE_ITERS {
        let mut next = graph_average(mesh, &state, width);
        for &b in &b2v {
            let b = b as usize;
            next[b * width..(b + 1) * width]
                .copy_from_slice(&initial[b * width..(b + 1) * width]);
        }
        let next = mesh.sync_array(VERT, &next, width)?;
        let done = mesh
            .comm()
            .reduce_and(crate::algs::arrays::are_close_arrays_with(
                &state, &next, tol, floor,
            ));
        state = next;
        if done {
            log::debug!("laplacian solve took {niters} iterations");
            return Ok(state);
        }
    }
    log::warn!("laplacian solve hit the {MAX_LAPLACE_ITERS}-iteration cap");
    Ok(state)
}

/// One position-smoothing sweep: move interior vertices toward their star
/// average, clamped to `max_motion_allowed`, backing off until the worst
/// element quality stays at or above `min_quality_allowed` and above its
/// pre-move worst. Returns whether any vertex moved.
pub fn smooth_positions_once(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    if opts.max_motion_allowed <= 0.0 {
        return Ok(false);
    }
    let dim = mesh.dim();
    let interior = mark_by_class_dim(mesh, VERT, dim as i8)?;
    let movers: Vec<Lo> = collect_marked(&interior);
    if movers.is_empty() {
        return Ok(false);
    }
    let old_coords = mesh.coords().as_ref().clone();
    let averaged = graph_average(mesh, &old_coords, dim);
    let quals_before = crate::metric::field::element_qualities(mesh)?;
    let worst_before = quals_before.iter().cloned().fold(f64::INFINITY, f64::min);
    // motion clamped per vertex, then backed off collectively
    let mut motion: Vec<f64> = vec![0.0; old_coords.len()];
    for &v in &movers {
        let v = v as usize;
        let mut d2 = 0.0;
        for k in 0..dim {
            let d = averaged[v * dim + k] - old_coords[v * dim + k];
            motion[v * dim + k] = d;
            d2 += d * d;
        }
        let dist = d2.sqrt();
        if dist > opts.max_motion_allowed {
            let scale = opts.max_motion_allowed / dist;
            for k in 0..dim {
                motion[v * dim + k] *= scale;
            }
        }
    }
    let mut factor = 1.0;
    for _ in 0..5 {
        let moved: Vec<f64> = old_coords
            .iter()
            .zip(motion.iter())
            .map(|(&x, &m)| x + factor * m)
            .collect();
        let trial = mesh.trial_with_coords(moved)?;
        let quals = crate::metric::field::element_qualities(&trial)?;
        let worst = quals.iter().cloned().fold(f64::INFINITY, f64::min);
        if worst >= opts.min_quality_allowed.min(worst_before) && worst > 0.0 {
            *mesh = trial;
            return Ok(true);
        }
        factor *= 0.5;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::build_box_2d;
    use crate::topology::classify::classify_by_angles;
    use approx::assert_relative_eq;

    fn classified_box(n: usize) -> Mesh {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, n, n).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        mesh
    }

    #[test]
    fn laplacian_flattens_interior_spike() {
        let mesh = classified_box(4);
        // boundary holds a linear field; a spiked interior must relax to it
        let exact: Vec<f64> = (0..mesh.nverts())
            .map(|v| {
                let x = mesh.vert_coords(v);
                x[0] + 2.0 * x[1]
            })
            .collect();
        let mut initial = exact.clone();
        let interior = mark_by_class_dim(&mesh, VERT, 2).unwrap();
        for v in 0..mesh.nverts() {
            if interior[v] != 0 {
                initial[v] = 100.0;
            }
        }
        let solved = solve_laplacian(&mesh, &initial, 1, 1e-10, 1e-12).unwrap();
        // harmonic with linear boundary data on a symmetric grid: linear
        for v in 0..mesh.nverts() {
            assert_relative_eq!(solved[v], exact[v], epsilon = 1e-6);
        }
    }

    #[test]
    fn smoothing_restores_a_perturbed_grid() {
        let mut mesh = classified_box(3);
        // perturb one interior vertex off-center
        let interior = mark_by_class_dim(&mesh, VERT, 2).unwrap();
        let v = collect_marked(&interior)[0] as usize;
        let mut coords = mesh.coords().as_ref().clone();
        coords[v * 2] += 0.12;
        coords[v * 2 + 1] -= 0.09;
        mesh = mesh.trial_with_coords(coords).unwrap();
        let worst_before = crate::metric::field::element_qualities(&mesh)
            .unwrap()
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        let mut opts = AdaptOpts::new(2);
        opts.max_motion_allowed = 0.2;
        opts.min_quality_allowed = 0.0;
        assert!(smooth_positions_once(&mut mesh, &opts).unwrap());
        let worst_after = crate::metric::field::element_qualities(&mesh)
            .unwrap()
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        assert!(worst_after >= worst_before);
    }

    #[test]
    fn smoothing_disabled_by_zero_motion() {
        let mut mesh = classified_box(2);
        let opts = AdaptOpts::new(2);
        assert!(!smooth_positions_once(&mut mesh, &opts).unwrap());
    }
}
