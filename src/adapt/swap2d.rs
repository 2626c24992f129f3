//! 2D edge swap: flip the shared edge of a triangle pair.
//!
//! The key is an interior edge whose two triangles form a quad; the cavity
//! is replaced by the other diagonal's pair. A swap fires only when the new
//! minimum quality strictly beats both the old minimum and the quality
//! floor, so a non-convex quad (one flipped triangle inverts) rejects
//! itself through its negative quality.

use crate::adapt::indset::find_indset;
use crate::adapt::modify::{rebuild, RewritePlan};
use crate::adapt::AdaptOpts;
use crate::algs::arrays::parallel_map;
use crate::algs::map::{collect_marked, map_onto};
use crate::geometry::quality::{hetero_metric_element_quality, real_element_quality};
use crate::geometry::{gather_vectors, get_symm, Matrix};
use crate::mesh_error::Result;
use crate::metric::field::element_qualities;
use crate::topology::classify::CLASS_DIM;
use crate::topology::{Lo, Mesh, EDGE, TRI, VERT};

fn opposite_vert(tri: &[Lo], edge: &[Lo]) -> Lo {
    *tri.iter()
        .find(|&&v| !edge.contains(&v))
        .expect("degenerate triangle")
}

/// The flipped triangle pair for one key edge, oriented like the cavity:
/// each old triangle donates its slot order with the far edge endpoint
/// replaced by the other triangle's opposite vertex.
fn flipped_tris(mesh: &Mesh, e: usize) -> Option<[(Lo, Vec<Lo>); 2]> {
    let ev2v = mesh.ask_verts_of(1);
    let e2t = mesh.ask_up(EDGE, TRI);
    let row = e2t.row(e);
    if row.len() != 2 {
        return None;
    }
    let (t0, t1) = (row[0], row[1]);
    let tv2v = mesh.ask_verts_of(2);
    let edge = &ev2v[e * 2..e * 2 + 2];
    let (a, b) = (edge[0], edge[1]);
    let tri0 = &tv2v[t0 as usize * 3..(t0 as usize + 1) * 3];
    let tri1 = &tv2v[t1 as usize * 3..(t1 as usize + 1) * 3];
    let w0 = opposite_vert(tri0, edge);
    let w1 = opposite_vert(tri1, edge);
    let new0: Vec<Lo> = tri0.iter().map(|&v| if v == b { w1 } else { v }).collect();
    let new1: Vec<Lo> = tri1.iter().map(|&v| if v == a { w0 } else { v }).collect();
    Some([(t0, new0), (t1, new1)])
}

/// Minimum flipped-pair quality per candidate edge; `-1` for edges that are
/// not flippable (boundary).
pub fn swap2d_qualities(mesh: &Mesh, cands2edges: &[Lo]) -> Result<Vec<f64>> {
    let metrics = if mesh.has_tag(VERT, "metric") {
        Some(mesh.get_array::<f64>(VERT, "metric")?)
    } else {
        None
    };
    let coords = mesh.coords();
    Ok(parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let Some(pair) = flipped_tris(mesh, e) else {
            return -1.0;
        };
        let mut worst = f64::INFINITY;
        for (_, tri) in &pair {
            let p = gather_vectors::<2, 3>(coords, tri);
            let q = match &metrics {
                Some(m) => {
                    let ms: [Matrix<2>; 3] =
                        std::array::from_fn(|i| get_symm::<2>(m, tri[i] as usize));
                    hetero_metric_element_quality::<2, 3>(&p, &ms)
                }
                None => real_element_quality::<2, 3>(&p),
            };
            worst = worst.min(q);
        }
        worst
    }))
}

fn swap2d_plan(mesh: &Mesh, keys2edges: &[Lo]) -> RewritePlan {
    let ev2v = mesh.ask_verts_of(1);
    let tv2v = mesh.ask_verts_of(2);
    let mut plan = RewritePlan::new(mesh);
    for &e in keys2edges {
        let e = e as usize;
        let pair = flipped_tris(mesh, e).expect("keys are interior edges");
        let edge = &ev2v[e * 2..e * 2 + 2];
        let mut chord = [0 as Lo; 2];
        for (k, (t, _)) in pair.iter().enumerate() {
            chord[k] = opposite_vert(&tv2v[*t as usize * 3..(*t as usize + 1) * 3], edge);
        }
        plan.push_prod(1, &chord, (EDGE, e as Lo));
        for (t, tri) in &pair {
            plan.dead_cells[*t as usize] = 1;
            plan.push_prod(2, tri, (TRI, *t));
        }
    }
    plan
}

/// One 2D swap pass: flip interior edges whose cavities sit below the
/// desired quality, whenever flipping strictly improves the worst cell.
pub fn swap_edges_2d(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    let quals = element_qualities(mesh)?;
    let e2t = mesh.ask_up(EDGE, TRI);
    let e_class_dim = mesh.get_array::<i8>(EDGE, CLASS_DIM)?;
    let cavity_min: Vec<f64> = parallel_map(mesh.nedges(), |e| {
        e2t.row(e)
            .iter()
            .map(|&t| quals[t as usize])
            .fold(f64::INFINITY, f64::min)
    });
    let cands: Vec<u8> = parallel_map(mesh.nedges(), |e| {
        u8::from(
            e2t.row(e).len() == 2
                && e_class_dim[e] as usize == mesh.dim()
                && cavity_min[e] < opts.min_quality_desired,
        )
    });
    let any = cands.iter().any(|&m| m != 0);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
    let cands2edges = collect_marked(&cands);
    let cand_quals = swap2d_qualities(mesh, &cands2edges)?;
    let kept: Vec<u8> = cands2edges
        .iter()
        .enumerate()
        .map(|(cand, &e)| {
            let q = cand_quals[cand];
            u8::from(q > cavity_min[e as usize] && q > opts.min_quality_allowed)
        })
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
    let total = crate::algs::communicator::allreduce_int(
        mesh.comm().as_ref(),
        keys2edges.len() as i64,
        crate::algs::communicator::ReduceOp::Sum,
    );
    if total == 0 {
        return Ok(false);
    }
    log::debug!("swapping {total} edges");
    let plan = swap2d_plan(mesh, &keys2edges);
    let (new_mesh, _) = rebuild(mesh, &plan)?;
    *mesh = new_mesh;
    Ok(true)
}
