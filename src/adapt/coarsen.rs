//! Coarsening: edge collapse with rail choice.
//!
//! The pipeline follows the original staging: an element-based pre-filter
//! (classification), a ghosted stage that prunes codes by exposure,
//! overshoot, and cavity quality, chooses a rail per collapsing vertex, and
//! selects an independent set, then an element-based rewrite. Ephemeral tags
//! (`collapse_code` at edges; `key`, `collapse_quality`, `collapse_rail` at
//! vertices) carry state between the stages exactly as a repartition would
//! require.

use crate::adapt::collapse::{
    check_collapse_class, check_collapse_exposure, collapses, do_collapse, dont_collapse,
    DONT_COLLAPSE,
};
use crate::adapt::indset::{find_indset, find_indset_with_graph, get_buffered_conflicts, get_buffered_elems};
use crate::adapt::mark::{mark_down, mark_sliver_layers};
use crate::adapt::modify::{rebuild, RewritePlan};
use crate::adapt::overshoot::prevent_overshoot;
use crate::adapt::AdaptOpts;
use crate::algs::arrays::{each_lt, each_neq_to, parallel_map};
use crate::algs::map::{collect_marked, map_onto, unmap};
use crate::geometry::quality::{hetero_metric_element_quality, real_element_quality};
use crate::geometry::{gather_vectors, get_symm, Matrix};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::metric::field::{edge_lengths, element_qualities};
use crate::topology::mesh::Parting;
use crate::topology::{Lo, Mesh, EDGE, NONE, VERT, XferPolicy};

/// Whether a collapse may exceed the desired edge length.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Overshoot {
    Forbid,
    Allow,
}

/// Whether a collapse must strictly improve its cavity.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Improve {
    DontCare,
    Locally,
}

fn get_edge_codes(mesh: &mut Mesh) -> Result<Vec<i8>> {
    let codes = mesh.get_array::<i8>(EDGE, "collapse_code")?;
    mesh.remove_tag(EDGE, "collapse_code")?;
    Ok(codes.as_ref().clone())
}

fn put_edge_codes(mesh: &mut Mesh, cands2edges: &[Lo], cand_codes: &[i8]) -> Result<()> {
    let edge_codes = map_onto(cand_codes, cands2edges, mesh.nedges(), DONT_COLLAPSE, 1);
    mesh.add_tag(EDGE, "collapse_code", 1, XferPolicy::DontTransfer, edge_codes)
}

fn filter_coarsen_candidates(
    cands2edges: &mut Vec<Lo>,
    cand_codes: &mut Vec<i8>,
    cand_quals: Option<&mut Vec<f64>>,
) {
    let keep = each_neq_to(cand_codes, DONT_COLLAPSE);
    let new2old = collect_marked(&keep);
    *cands2edges = unmap(&new2old, cands2edges, 1);
    *cand_codes = unmap(&new2old, cand_codes, 1);
    if let Some(quals) = cand_quals {
        *quals = unmap(&new2old, quals, 2);
    }
}

/// Element-based pre-filter: classification admissibility only.
fn coarsen_element_based1(mesh: &mut Mesh) -> Result<bool> {
    let edge_codes = get_edge_codes(mesh)?;
    let edges_are_cands = each_neq_to(&edge_codes, DONT_COLLAPSE);
    let cands2edges = collect_marked(&edges_are_cands);
    let cand_codes = unmap(&cands2edges, &edge_codes, 1);
    let cand_codes = check_collapse_class(mesh, &cands2edges, &cand_codes)?;
    let any = cand_codes.iter().any(|&c| c != DONT_COLLAPSE);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
    put_edge_codes(mesh, &cands2edges, &cand_codes)?;
    Ok(true)
}

struct MetricGather {
    metrics: Option<std::sync::Arc<Vec<f64>>>,
}

impl MetricGather {
    fn open(mesh: &Mesh) -> Result<MetricGather> {
        let metrics = if mesh.has_tag(VERT, "metric") {
            Some(mesh.get_array::<f64>(VERT, "metric")?)
        } else if mesh.has_tag(VERT, "size") {
            let sizes = mesh.get_array::<f64>(VERT, "size")?;
            Some(std::sync::Arc::new(
                crate::metric::field::metrics_from_sizes(mesh.dim(), &sizes)?,
            ))
        } else {
            None
        };
        Ok(MetricGather { metrics })
    }
}

fn rewired_quality_dim<const D: usize, const N: usize>(
    mesh: &Mesh,
    gather: &MetricGather,
    cell_verts: &[Lo],
    v_col: Lo,
    v_onto: Lo,
) -> f64 {
    let coords = mesh.coords();
    let rewired: [Lo; N] = std::array::from_fn(|i| {
        if cell_verts[i] == v_col {
            v_onto
        } else {
            cell_verts[i]
        }
    });
    let p = gather_vectors::<D, N>(coords, &rewired);
    match &gather.metrics {
        Some(m) => {
            let ms: [Matrix<D>; N] =
                std::array::from_fn(|i| get_symm::<D>(m, rewired[i] as usize));
            hetero_metric_element_quality::<D, N>(&p, &ms)
        }
        None => real_element_quality::<D, N>(&p),
    }
}

fn direction_quality(
    mesh: &Mesh,
    gather: &MetricGather,
    v_col: Lo,
    v_onto: Lo,
) -> f64 {
    let dim = mesh.dim();
    let v2c = mesh.ask_up(VERT, dim);
    let cv2v = mesh.ask_verts_of(dim);
    let nev = dim + 1;
    let mut worst = 1.0f64;
    for &c in v2c.row(v_col as usize) {
        let cell = &cv2v[c as usize * nev..(c as usize + 1) * nev];
        if cell.contains(&v_onto) {
            continue;
        }
        let q = match dim {
            2 => rewired_quality_dim::<2, 3>(mesh, gather, cell, v_col, v_onto),
            _ => rewired_quality_dim::<3, 4>(mesh, gather, cell, v_col, v_onto),
        };
        worst = worst.min(q);
    }
    worst
}

/// Minimum rewired-cell quality per candidate and direction (`ncands * 2`,
/// `-1` for directions the code forbids).
pub fn coarsen_qualities(
    mesh: &Mesh,
    cands2edges: &[Lo],
    cand_codes: &[i8],
) -> Result<Vec<f64>> {
    let gather = MetricGather::open(mesh)?;
    let ev2v = mesh.ask_verts_of(1);
    Ok(crate::algs::arrays::parallel_fill(
        cands2edges.len(),
        2,
        -1.0,
        |cand, out| {
            let e = cands2edges[cand] as usize;
            for eev in 0..2 {
                if !collapses(cand_codes[cand], eev) {
                    continue;
                }
                let v_col = ev2v[e * 2 + eev];
                let v_onto = ev2v[e * 2 + (1 - eev)];
                out[eev] = direction_quality(mesh, &gather, v_col, v_onto);
            }
        },
    ))
}

/// Clear directions whose cavity quality falls below the floor.
pub fn filter_coarsen_min_qual(cand_codes: &[i8], cand_quals: &[f64], floor: f64) -> Vec<i8> {
    parallel_map(cand_codes.len(), |cand| {
        let mut code = cand_codes[cand];
        for eev in 0..2 {
            if collapses(code, eev) && cand_quals[cand * 2 + eev] < floor {
                code = dont_collapse(code, eev);
            }
        }
        code
    })
}

/// Clear directions that do not strictly improve their cavity's worst
/// quality. Interaction between adjacent improving collapses is left to the
/// independent-set scheduler.
pub fn filter_coarsen_improve(
    mesh: &Mesh,
    cands2edges: &[Lo],
    cand_codes: &[i8],
    cand_quals: &[f64],
) -> Result<Vec<i8>> {
    let dim = mesh.dim();
    let elem_quals = element_qualities(mesh)?;
    let v2c = mesh.ask_up(VERT, dim);
    let ev2v = mesh.ask_verts_of(1);
    Ok(parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let mut code = cand_codes[cand];
        for eev in 0..2 {
            if !collapses(code, eev) {
                continue;
            }
            let v_col = ev2v[e * 2 + eev] as usize;
            let old_worst = v2c
                .row(v_col)
                .iter()
                .map(|&c| elem_quals[c as usize])
                .fold(f64::INFINITY, f64::min);
            if cand_quals[cand * 2 + eev] <= old_worst {
                code = dont_collapse(code, eev);
            }
        }
        code
    }))
}

/// Fold edge-direction candidates onto vertices: each collapsing vertex
/// keeps its best direction's quality and records the target vertex (the
/// rail) by global id so every rank makes the same choice.
fn choose_rails(
    mesh: &Mesh,
    cands2edges: &[Lo],
    cand_codes: &[i8],
    cand_quals: &[f64],
) -> (Vec<u8>, Vec<f64>, Vec<i64>) {
    let ev2v = mesh.ask_verts_of(1);
    let globals = mesh.globals(VERT);
    let nverts = mesh.nverts();
    let mut verts_are_cands = vec![0u8; nverts];
    let mut vert_quals = vec![-1.0f64; nverts];
    let mut vert_rails = vec![-1i64; nverts];
    for (cand, &e) in cands2edges.iter().enumerate() {
        for eev in 0..2 {
            if !collapses(cand_codes[cand], eev) {
                continue;
            }
            let v_col = ev2v[e as usize * 2 + eev] as usize;
            let v_onto = ev2v[e as usize * 2 + (1 - eev)];
            let qual = cand_quals[cand * 2 + eev];
            let rail = globals[v_onto as usize] as i64;
            let better = qual > vert_quals[v_col]
                || (qual == vert_quals[v_col] && rail < vert_rails[v_col]);
            if better {
                verts_are_cands[v_col] = 1;
                vert_quals[v_col] = qual;
                vert_rails[v_col] = rail;
            }
        }
    }
    (verts_are_cands, vert_quals, vert_rails)
}

/// Resolve each key vertex's rail global id back to the edge and direction.
fn find_rails(
    mesh: &Mesh,
    keys2verts: &[Lo],
    vert_rails: &[i64],
) -> Result<(Vec<Lo>, Vec<u8>)> {
    let v2e = mesh.ask_up(VERT, EDGE);
    let ev2v = mesh.ask_verts_of(1);
    let globals = mesh.globals(VERT);
    let mut rails2edges = Vec::with_capacity(keys2verts.len());
    let mut col_dirs = Vec::with_capacity(keys2verts.len());
    for &v in keys2verts {
        let rail = vert_rails[v as usize];
        let mut found = NONE;
        let mut dir = 0u8;
        for &e in v2e.row(v as usize) {
            let verts = &ev2v[e as usize * 2..e as usize * 2 + 2];
            let eev = usize::from(verts[1] == v);
            debug_assert_eq!(verts[eev], v);
            let other = verts[1 - eev];
            if globals[other as usize] as i64 == rail {
                found = e;
                dir = eev as u8;
                break;
            }
        }
        if found == NONE {
            return Err(MeshAdaptError::InvariantViolation(format!(
                "vertex {v} has no edge to its rail {rail}"
            )));
        }
        rails2edges.push(found);
        col_dirs.push(dir);
    }
    Ok((rails2edges, col_dirs))
}

fn coarsen_plan(
    mesh: &Mesh,
    keys2verts: &[Lo],
    rails2edges: &[Lo],
    col_dirs: &[u8],
) -> RewritePlan {
    let dim = mesh.dim();
    let ev2v = mesh.ask_verts_of(1);
    let mut plan = RewritePlan::new(mesh);
    for (k, &v_col) in keys2verts.iter().enumerate() {
        let e = rails2edges[k] as usize;
        let eev = col_dirs[k] as usize;
        let v_onto = ev2v[e * 2 + (1 - eev)];
        plan.dead_verts[v_col as usize] = 1;
        let v2c = mesh.ask_up(VERT, dim);
        for &c in v2c.row(v_col as usize) {
            plan.dead_cells[c as usize] = 1;
        }
        for d in 1..=dim {
            let v2d = mesh.ask_up(VERT, d);
            let dv2v = mesh.ask_verts_of(d);
            let ndv = d + 1;
            for &ent in v2d.row(v_col as usize) {
                let verts = &dv2v[ent as usize * ndv..(ent as usize + 1) * ndv];
                if verts.contains(&v_onto) {
                    continue;
                }
                let rewired: Vec<Lo> = verts
                    .iter()
                    .map(|&v| if v == v_col { v_onto } else { v })
                    .collect();
                plan.push_prod(d, &rewired, (d, ent));
            }
        }
    }
    plan
}

/// Ghosted stage: prune codes, evaluate cavities, choose rails, select keys.
fn coarsen_ghosted(
    mesh: &mut Mesh,
    opts: &AdaptOpts,
    overshoot: Overshoot,
    improve: Improve,
) -> Result<bool> {
    let edge_codes = get_edge_codes(mesh)?;
    let edges_are_cands = each_neq_to(&edge_codes, DONT_COLLAPSE);
    let mut cands2edges = collect_marked(&edges_are_cands);
    let mut cand_codes = unmap(&cands2edges, &edge_codes, 1);
    cand_codes = check_collapse_exposure(mesh, &cands2edges, &cand_codes)?;
    filter_coarsen_candidates(&mut cands2edges, &mut cand_codes, None);
    if overshoot == Overshoot::Forbid {
        cand_codes = prevent_overshoot(mesh, opts, &cands2edges, &cand_codes)?;
        filter_coarsen_candidates(&mut cands2edges, &mut cand_codes, None);
    }
    if mesh.comm().reduce_and(cands2edges.is_empty()) {
        return Ok(false);
    }
    let mut cand_quals = coarsen_qualities(mesh, &cands2edges, &cand_codes)?;
    cand_codes = filter_coarsen_min_qual(&cand_codes, &cand_quals, opts.min_quality_allowed);
    if improve == Improve::Locally {
        cand_codes = filter_coarsen_improve(mesh, &cands2edges, &cand_codes, &cand_quals)?;
    }
    filter_coarsen_candidates(&mut cands2edges, &mut cand_codes, Some(&mut cand_quals));
    if mesh.comm().reduce_and(cands2edges.is_empty()) {
        return Ok(false);
    }
    let (verts_are_cands, vert_quals, vert_rails) =
        choose_rails(mesh, &cands2edges, &cand_codes, &cand_quals);
    let verts_are_keys = if mesh.comm().size() > 1 {
        let prelim = find_indset(mesh, VERT, &vert_quals, &verts_are_cands)?;
        let buf_elems = get_buffered_elems(mesh, &prelim, 3);
        let buf_conflicts = get_buffered_conflicts(mesh, &buf_elems, &prelim);
        find_indset_with_graph(mesh, VERT, &buf_conflicts, &vert_quals, &prelim)?
    } else {
        find_indset(mesh, VERT, &vert_quals, &verts_are_cands)?
    };
    let any = verts_are_keys.iter().any(|&k| k != 0);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
    let key_marks: Vec<i8> = verts_are_keys.iter().map(|&k| k as i8).collect();
    mesh.add_tag(VERT, "key", 1, XferPolicy::DontTransfer, key_marks)?;
    mesh.add_tag(VERT, "collapse_quality", 1, XferPolicy::DontTransfer, vert_quals)?;
    mesh.add_tag(VERT, "collapse_rail", 1, XferPolicy::DontTransfer, vert_rails)?;
    Ok(true)
}

/// Element-based rewrite from the tags the ghosted stage left behind.
fn coarsen_element_based2(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<()> {
    let verts_are_keys = mesh.get_array::<i8>(VERT, "key")?;
    let vert_rails = mesh.get_array::<i64>(VERT, "collapse_rail")?;
    let keys2verts = collect_marked(
        &verts_are_keys.iter().map(|&k| k as u8).collect::<Vec<_>>(),
    );
    mesh.remove_tag(VERT, "key")?;
    mesh.remove_tag(VERT, "collapse_quality")?;
    mesh.remove_tag(VERT, "collapse_rail")?;
    if opts.verbosity >= crate::adapt::Verbosity::EachRebuild {
        let total = crate::algs::communicator::allreduce_int(
            mesh.comm().as_ref(),
            keys2verts.len() as i64,
            crate::algs::communicator::ReduceOp::Sum,
        );
        log::info!("coarsening {total} vertices");
    }
    let (rails2edges, col_dirs) = find_rails(mesh, &keys2verts, &vert_rails)?;
    let plan = coarsen_plan(mesh, &keys2verts, &rails2edges, &col_dirs);
    let (new_mesh, _) = rebuild(mesh, &plan)?;
    *mesh = new_mesh;
    Ok(())
}

fn coarsen(
    mesh: &mut Mesh,
    opts: &AdaptOpts,
    overshoot: Overshoot,
    improve: Improve,
) -> Result<bool> {
    if !coarsen_element_based1(mesh)? {
        return Ok(false);
    }
    let nghost_layers = if mesh.comm().size() > 1 { 3 } else { 1 };
    mesh.set_parting(Parting::Ghosted {
        nlayers: nghost_layers,
    });
    if !coarsen_ghosted(mesh, opts, overshoot, improve)? {
        mesh.set_parting(Parting::ElemBased);
        return Ok(false);
    }
    mesh.set_parting(Parting::ElemBased);
    coarsen_element_based2(mesh, opts)?;
    Ok(true)
}

fn coarsen_verts(
    mesh: &mut Mesh,
    opts: &AdaptOpts,
    vert_marks: &[u8],
    overshoot: Overshoot,
    improve: Improve,
) -> Result<bool> {
    let ev2v = mesh.ask_verts_of(1);
    let edge_codes: Vec<i8> = parallel_map(mesh.nedges(), |e| {
        let mut code = DONT_COLLAPSE;
        for eev in 0..2 {
            if vert_marks[ev2v[e * 2 + eev] as usize] != 0 {
                code = do_collapse(code, eev);
            }
        }
        code
    });
    mesh.add_tag(EDGE, "collapse_code", 1, XferPolicy::DontTransfer, edge_codes)?;
    coarsen(mesh, opts, overshoot, improve)
}

fn coarsen_ents(
    mesh: &mut Mesh,
    opts: &AdaptOpts,
    ent_dim: usize,
    marks: &[u8],
    overshoot: Overshoot,
    improve: Improve,
) -> Result<bool> {
    let vert_marks = if ent_dim == VERT {
        marks.to_vec()
    } else {
        mark_down(mesh, ent_dim, VERT, marks)
    };
    coarsen_verts(mesh, opts, &vert_marks, overshoot, improve)
}

/// Collapse edges shorter than `min_length_desired`.
pub fn coarsen_by_size(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    let lengths = edge_lengths(mesh)?;
    let edge_is_cand = each_lt(&lengths, opts.min_length_desired);
    let any = edge_is_cand.iter().any(|&m| m != 0);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
    coarsen_ents(mesh, opts, EDGE, &edge_is_cand, Overshoot::Forbid, Improve::DontCare)
}

/// Collapse the neighborhoods of sliver elements, allowing overshoot but
/// requiring local improvement.
pub fn coarsen_slivers(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    mesh.set_parting(Parting::Ghosted { nlayers: 1 });
    let quals = element_qualities(mesh)?;
    let elems_are_cands =
        mark_sliver_layers(mesh, opts.min_quality_desired, opts.nsliver_layers, &quals);
    let any = elems_are_cands.iter().any(|&m| m != 0);
    if !mesh.comm().reduce_or(any) {
        mesh.set_parting(Parting::ElemBased);
        return Ok(false);
    }
    let dim = mesh.dim();
    coarsen_ents(mesh, opts, dim, &elems_are_cands, Overshoot::Allow, Improve::Locally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::metric::field::element_sizes;
    use crate::topology::build::build_box_2d;
    use crate::topology::classify::classify_by_angles;

    fn sized_box(n: usize, size: f64) -> Mesh {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, n, n).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        let nverts = mesh.nverts();
        mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![size; nverts])
            .unwrap();
        mesh
    }

    #[test]
    fn short_edges_collapse() {
        // edges of length 0.25 against a size field asking for 1.0
        let mut mesh = sized_box(4, 1.0);
        let mut opts = AdaptOpts::new(2);
        opts.min_length_desired = 0.5;
        opts.max_length_desired = 4.0;
        opts.min_quality_allowed = 0.1;
        let before = mesh.nelems();
        assert!(coarsen_by_size(&mut mesh, &opts).unwrap());
        assert!(mesh.nelems() < before);
        for s in element_sizes(&mesh) {
            assert!(s > 0.0, "coarsening must not invert cells");
        }
        // the boundary box is preserved: total area unchanged
        let total: f64 = element_sizes(&mesh).iter().sum();
        approx::assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn well_sized_mesh_declines() {
        let mut mesh = sized_box(4, 0.25);
        let mut opts = AdaptOpts::new(2);
        opts.min_length_desired = 0.7;
        // every edge measures >= 1 under its size field
        assert!(!coarsen_by_size(&mut mesh, &opts).unwrap());
    }

    #[test]
    fn repeated_coarsening_terminates() {
        let mut mesh = sized_box(6, 1.0);
        let mut opts = AdaptOpts::new(2);
        opts.min_length_desired = 0.9;
        opts.max_length_desired = 2.5;
        opts.min_quality_allowed = 0.1;
        let mut rounds = 0;
        while coarsen_by_size(&mut mesh, &opts).unwrap() {
            rounds += 1;
            assert!(rounds < 40, "coarsening must reach a fixed point");
        }
        assert!(mesh.nelems() >= 2);
        for s in element_sizes(&mesh) {
            assert!(s > 0.0);
        }
    }

    #[test]
    fn sliver_pass_requires_improvement() {
        let mut mesh = sized_box(3, 0.33);
        let quals_before = element_qualities(&mesh).unwrap();
        let worst_before = quals_before.iter().cloned().fold(f64::INFINITY, f64::min);
        let mut opts = AdaptOpts::new(2);
        // right triangles score 0.75; set the bar above them
        opts.min_quality_desired = 0.9;
        opts.nsliver_layers = 1;
        opts.min_quality_allowed = 0.1;
        let fired = coarsen_slivers(&mut mesh, &opts).unwrap();
        if fired {
            let quals_after = element_qualities(&mesh).unwrap();
            let worst_after = quals_after.iter().cloned().fold(f64::INFINITY, f64::min);
            assert!(worst_after > worst_before - 1e-12);
        }
    }
}
