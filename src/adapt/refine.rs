//! Refinement: edge split with cavity bisection.
//!
//! Candidate edges are those longer than `max_length_desired` under the size
//! field. Each selected key edge gains a midpoint vertex; every incident
//! cell bisects along the split edge. Candidates whose worst new cell would
//! fall below `min_quality_allowed` are gated out before selection.

use crate::adapt::indset::find_indset;
use crate::adapt::modify::{rebuild, RewritePlan};
use crate::adapt::AdaptOpts;
use crate::algs::arrays::{each_gt, parallel_map};
use crate::algs::map::{collect_marked, map_onto};
use crate::geometry::quality::{hetero_metric_element_quality, real_element_quality};
use crate::geometry::{gather_vectors, get_symm, Matrix};
use crate::mesh_error::Result;
use crate::metric::field::edge_lengths;
use crate::metric::interpolate_metrics;
use crate::topology::{Lo, Mesh, EDGE, VERT};

/// Vertex metric source for cavity evaluation: the attached metric field, an
/// isotropic size field, or nothing (plain coordinates).
enum MetricView {
    Metric(std::sync::Arc<Vec<f64>>),
    None,
}

impl MetricView {
    fn open(mesh: &Mesh) -> Result<MetricView> {
        if mesh.has_tag(VERT, "metric") {
            return Ok(MetricView::Metric(mesh.get_array::<f64>(VERT, "metric")?));
        }
        if mesh.has_tag(VERT, "size") {
            // sizes expand to diagonal tensors once, keeping one code path
            let sizes = mesh.get_array::<f64>(VERT, "size")?;
            let buf = crate::metric::field::metrics_from_sizes(mesh.dim(), &sizes)?;
            return Ok(MetricView::Metric(std::sync::Arc::new(buf)));
        }
        Ok(MetricView::None)
    }
}

fn refine_qualities_dim<const D: usize, const N: usize>(
    mesh: &Mesh,
    view: &MetricView,
    cands2edges: &[Lo],
) -> Vec<f64> {
    let ev2v = mesh.ask_verts_of(1);
    let e2c = mesh.ask_up(1, mesh.dim());
    let cv2v = mesh.ask_verts_of(mesh.dim());
    let coords = mesh.coords();
    parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let (a, b) = (ev2v[e * 2], ev2v[e * 2 + 1]);
        let pa: [f64; D] = std::array::from_fn(|d| coords[a as usize * D + d]);
        let pb: [f64; D] = std::array::from_fn(|d| coords[b as usize * D + d]);
        let mid: [f64; D] = std::array::from_fn(|d| 0.5 * (pa[d] + pb[d]));
        let mid_metric: Option<Matrix<D>> = match view {
            MetricView::Metric(m) => interpolate_metrics(
                &get_symm::<D>(m, a as usize),
                &get_symm::<D>(m, b as usize),
                0.5,
            )
            .ok(),
            MetricView::None => None,
        };
        let mut worst = f64::INFINITY;
        for &c in e2c.row(e) {
            let cell = &cv2v[c as usize * N..(c as usize + 1) * N];
            for &replaced in [a, b].iter() {
                let mut p = gather_vectors::<D, N>(coords, cell);
                let mut ms: Option<[Matrix<D>; N]> = match view {
                    MetricView::Metric(m) => {
                        Some(std::array::from_fn(|i| get_symm::<D>(m, cell[i] as usize)))
                    }
                    MetricView::None => None,
                };
                for (i, &v) in cell.iter().enumerate() {
                    if v == replaced {
                        p[i] = mid;
                        if let (Some(ms), Some(mm)) = (ms.as_mut(), mid_metric.as_ref()) {
                            ms[i] = *mm;
                        }
                    }
                }
                let q = match &ms {
                    Some(ms) => hetero_metric_element_quality::<D, N>(&p, ms),
                    None => real_element_quality::<D, N>(&p),
                };
                worst = worst.min(q);
            }
        }
        worst
    })
}

/// Minimum post-split cell quality per candidate edge, with the midpoint
/// metric interpolated between the endpoints.
pub fn refine_qualities(mesh: &Mesh, cands2edges: &[Lo]) -> Result<Vec<f64>> {
    let view = MetricView::open(mesh)?;
    Ok(match mesh.dim() {
        2 => refine_qualities_dim::<2, 3>(mesh, &view, cands2edges),
        _ => refine_qualities_dim::<3, 4>(mesh, &view, cands2edges),
    })
}

fn other_verts(entity: &[Lo], edge: &[Lo]) -> Vec<Lo> {
    entity
        .iter()
        .copied()
        .filter(|v| !edge.contains(v))
        .collect()
}

/// Build the rewrite plan for a set of key edges.
fn refine_plan(mesh: &Mesh, keys2edges: &[Lo]) -> RewritePlan {
    let dim = mesh.dim();
    let ev2v = mesh.ask_verts_of(1);
    let cv2v = mesh.ask_verts_of(dim);
    let coords = mesh.coords();
    let e2c = mesh.ask_up(1, dim);
    let mut plan = RewritePlan::new(mesh);
    for &e in keys2edges {
        let e = e as usize;
        let edge = &ev2v[e * 2..e * 2 + 2];
        let (a, b) = (edge[0], edge[1]);
        let mid_coords: Vec<f64> = (0..dim)
            .map(|d| 0.5 * (coords[a as usize * dim + d] + coords[b as usize * dim + d]))
            .collect();
        let m = plan.push_vert(mesh, &mid_coords, (EDGE, e as Lo));
        plan.push_prod(1, &[a, m], (EDGE, e as Lo));
        plan.push_prod(1, &[m, b], (EDGE, e as Lo));
        if dim == 3 {
            let e2f = mesh.ask_up(1, 2);
            let fv2v = mesh.ask_verts_of(2);
            for &f in e2f.row(e) {
                let face = &fv2v[f as usize * 3..(f as usize + 1) * 3];
                let w = other_verts(face, edge)[0];
                plan.push_prod(1, &[m, w], (2, f));
                // the two face halves
                for &replaced in &[a, b] {
                    let half: Vec<Lo> = face
                        .iter()
                        .map(|&v| if v == replaced { m } else { v })
                        .collect();
                    plan.push_prod(2, &half, (2, f));
                }
            }
        }
        for &c in e2c.row(e) {
            let cell = &cv2v[c as usize * (dim + 1)..(c as usize + 1) * (dim + 1)];
            plan.dead_cells[c as usize] = 1;
            if dim == 2 {
                let w = other_verts(cell, edge)[0];
                plan.push_prod(1, &[m, w], (2, c));
            } else {
                // the interior bisecting face through the cell's other verts
                let uv = other_verts(cell, edge);
                plan.push_prod(2, &[m, uv[0], uv[1]], (3, c));
            }
            for &replaced in &[a, b] {
                let half: Vec<Lo> = cell
                    .iter()
                    .map(|&v| if v == replaced { m } else { v })
                    .collect();
                plan.push_prod(dim, &half, (dim, c));
            }
        }
    }
    plan
}

/// One refinement pass over the marked candidate edges. Returns the rebuilt
/// mesh when any cavity fired.
pub fn refine(mesh: &Mesh, opts: &AdaptOpts, cand_marks: &[u8]) -> Result<Option<Mesh>> {
    let cands2edges = collect_marked(cand_marks);
    let cand_quals = refine_qualities(mesh, &cands2edges)?;
    let kept: Vec<u8> = cand_quals
        .iter()
        .map(|&q| u8::from(q >= opts.min_quality_allowed))
        .collect();
    let kept2edges: Vec<Lo> = collect_marked(&kept)
        .iter()
        .map(|&k| cands2edges[k as usize])
        .collect();
    let kept_quals: Vec<f64> = collect_marked(&kept)
        .iter()
        .map(|&k| cand_quals[k as usize])
        .collect();
    let edge_quals = map_onto(&kept_quals, &kept2edges, mesh.nedges(), -1.0, 1);
    let edge_cands = map_onto(&vec![1u8; kept2edges.len()], &kept2edges, mesh.nedges(), 0, 1);
    let keys = find_indset(mesh, EDGE, &edge_quals, &edge_cands)?;
    let keys2edges = collect_marked(&keys);
    let nkeys = keys2edges.len() as i64;
    let total = crate::algs::communicator::allreduce_int(
        mesh.comm().as_ref(),
        nkeys,
        crate::algs::communicator::ReduceOp::Sum,
    );
    if total == 0 {
        return Ok(None);
    }
    log::debug!("refining {total} edges");
    let plan = refine_plan(mesh, &keys2edges);
    let (new_mesh, _) = rebuild(mesh, &plan)?;
    Ok(Some(new_mesh))
}

/// Refine every edge longer than `max_length_desired`; repeat-callable.
pub fn refine_by_size(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    let lengths = edge_lengths(mesh)?;
    let cands = each_gt(&lengths, opts.max_length_desired);
    let any = cands.iter().any(|&m| m != 0);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
    match refine(mesh, opts, &cands)? {
        Some(new_mesh) => {
            *mesh = new_mesh;
            Ok(true)
        }
        None => Ok(false),
    }
}
