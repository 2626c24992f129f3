//! 3D edge swap: remove an edge by retriangulating its link loop.
//!
//! The link of an interior edge is a closed loop of vertices, ordered by the
//! orientation of the surrounding tetrahedra. Each triangulation of that
//! loop polygon, paired with the edge's two endpoints as apexes, yields a
//! replacement cavity; a dynamic program over loop intervals (Klincsek's
//! construction) finds the triangulation maximizing the minimum tetrahedron
//! quality. The swap fires only when that optimum strictly beats the old
//! cavity's worst cell.

use crate::adapt::indset::find_indset;
use crate::adapt::modify::{rebuild, RewritePlan};
use crate::adapt::AdaptOpts;
use crate::algs::map::collect_marked;
use crate::geometry::quality::{hetero_metric_element_quality, real_element_quality};
use crate::geometry::{gather_vectors, get_symm, Matrix};
use crate::mesh_error::Result;
use crate::metric::field::element_qualities;
use crate::topology::classify::CLASS_DIM;
use crate::topology::{Lo, Mesh, EDGE, TET, VERT};
use hashbrown::HashMap;

/// The ordered link loop of an edge: `eev2v` are the edge endpoints as
/// stored, `verts` the loop in the winding that makes `(l_i, l_{i+1},
/// eev2v[1], eev2v[0])` agree with the stored tetrahedra orientations.
#[derive(Clone, Debug)]
pub struct EdgeLoop {
    pub edge: Lo,
    pub eev2v: [Lo; 2],
    pub verts: Vec<Lo>,
    pub cavity: Vec<Lo>,
}

/// Parity of the permutation taking `stored` to `target` (true = even).
fn permutation_is_even(stored: &[Lo; 4], target: &[Lo; 4]) -> bool {
    let pos: [usize; 4] = std::array::from_fn(|i| {
        target
            .iter()
            .position(|&t| t == stored[i])
            .expect("tuples must be permutations of each other")
    });
    let mut inversions = 0;
    for i in 0..4 {
        for j in i + 1..4 {
            if pos[i] > pos[j] {
                inversions += 1;
            }
        }
    }
    inversions % 2 == 0
}

/// Find the closed link loop of `edge`, or `None` when the edge touches the
/// boundary (open fan) or the fan is irregular.
pub fn find_loop(mesh: &Mesh, edge: usize) -> Option<EdgeLoop> {
    let ev2v = mesh.ask_verts_of(1);
    let e2c = mesh.ask_up(EDGE, TET);
    let cv2v = mesh.ask_verts_of(3);
    let e0 = ev2v[edge * 2];
    let e1 = ev2v[edge * 2 + 1];
    let cavity: Vec<Lo> = e2c.row(edge).to_vec();
    let mut succ: HashMap<Lo, Lo> = HashMap::with_capacity(cavity.len());
    for &c in &cavity {
        let cell: [Lo; 4] = std::array::from_fn(|i| cv2v[c as usize * 4 + i]);
        let others: Vec<Lo> = cell
            .iter()
            .copied()
            .filter(|&v| v != e0 && v != e1)
            .collect();
        if others.len() != 2 {
            return None;
        }
        let (u, v) = (others[0], others[1]);
        let directed = if permutation_is_even(&cell, &[u, v, e1, e0]) {
            (u, v)
        } else {
            (v, u)
        };
        if succ.insert(directed.0, directed.1).is_some() {
            return None;
        }
    }
    // walk the cycle; an interior edge closes after exactly one lap
    let n = cavity.len();
    if n < 3 {
        return None;
    }
    let start = *succ.keys().min()?;
    let mut verts = Vec::with_capacity(n);
    let mut at = start;
    for _ in 0..n {
        verts.push(at);
        at = *succ.get(&at)?;
    }
    if at != start || verts.len() != n {
        return None;
    }
    Some(EdgeLoop {
        edge: edge as Lo,
        eev2v: [e0, e1],
        verts,
        cavity,
    })
}

struct TetMeasure {
    metrics: Option<std::sync::Arc<Vec<f64>>>,
}

impl TetMeasure {
    fn open(mesh: &Mesh) -> Result<TetMeasure> {
        let metrics = if mesh.has_tag(VERT, "metric") {
            Some(mesh.get_array::<f64>(VERT, "metric")?)
        } else {
            None
        };
        Ok(TetMeasure { metrics })
    }

    fn quality(&self, mesh: &Mesh, tet: [Lo; 4]) -> f64 {
        let p = gather_vectors::<3, 4>(mesh.coords(), &tet);
        match &self.metrics {
            Some(m) => {
                let ms: [Matrix<3>; 4] =
                    std::array::from_fn(|i| get_symm::<3>(m, tet[i] as usize));
                hetero_metric_element_quality::<3, 4>(&p, &ms)
            }
            None => real_element_quality::<3, 4>(&p),
        }
    }
}

/// The chosen retriangulation of one loop: its worst new-tet quality and the
/// triangle list as loop-vertex index triples.
#[derive(Clone, Debug)]
pub struct LoopChoice {
    pub quality: f64,
    pub triangles: Vec<(usize, usize, usize)>,
}

/// Quality of the tet pair a loop triangle spawns with both apexes.
fn triangle_pair_quality(
    mesh: &Mesh,
    measure: &TetMeasure,
    lp: &EdgeLoop,
    (i, k, j): (usize, usize, usize),
) -> f64 {
    let (p, q, r) = (lp.verts[i], lp.verts[k], lp.verts[j]);
    let top = measure.quality(mesh, [p, q, r, lp.eev2v[0]]);
    let bottom = measure.quality(mesh, [p, r, q, lp.eev2v[1]]);
    top.min(bottom)
}

/// Klincsek-style interval dynamic program: among all triangulations of the
/// loop polygon, maximize the minimum tet quality.
pub fn choose_triangulation(
    mesh: &Mesh,
    measure: &TetMeasure,
    lp: &EdgeLoop,
) -> LoopChoice {
    let n = lp.verts.len();
    let mut best = vec![vec![f64::INFINITY; n]; n];
    let mut pick = vec![vec![0usize; n]; n];
    for gap in 2..n {
        for i in 0..n - gap {
            let j = i + gap;
            let mut best_q = f64::NEG_INFINITY;
            let mut best_k = i + 1;
            for k in i + 1..j {
                let q = triangle_pair_quality(mesh, measure, lp, (i, k, j))
                    .min(best[i][k])
                    .min(best[k][j]);
                if q > best_q {
                    best_q = q;
                    best_k = k;
                }
            }
            best[i][j] = best_q;
            pick[i][j] = best_k;
        }
    }
    let mut triangles = Vec::with_capacity(n - 2);
    let mut stack = vec![(0usize, n - 1)];
    while let Some((i, j)) = stack.pop() {
        if j - i < 2 {
            continue;
        }
        let k = pick[i][j];
        triangles.push((i, k, j));
        stack.push((i, k));
        stack.push((k, j));
    }
    LoopChoice {
        quality: best[0][n - 1],
        triangles,
    }
}

fn swap3d_plan(mesh: &Mesh, keys: &[(EdgeLoop, LoopChoice)]) -> RewritePlan {
    let mut plan = RewritePlan::new(mesh);
    for (lp, choice) in keys {
        let e0 = lp.eev2v[0];
        let e1 = lp.eev2v[1];
        let edge_key = lp.edge;
        for &c in &lp.cavity {
            plan.dead_cells[c as usize] = 1;
        }
        let n = lp.verts.len();
        for (which, &(i, k, j)) in choice.triangles.iter().enumerate() {
            let (p, q, r) = (lp.verts[i], lp.verts[k], lp.verts[j]);
            // interior chords of the polygon become new edges with apex faces
            for (x, y) in [(i, k), (k, j), (i, j)] {
                let is_ring_side = y == x + 1 || (x == 0 && y == n - 1);
                if !is_ring_side && x < y {
                    plan.push_prod(1, &[lp.verts[x], lp.verts[y]], (EDGE, edge_key));
                    plan.push_prod(2, &[lp.verts[x], lp.verts[y], e0], (EDGE, edge_key));
                    plan.push_prod(2, &[lp.verts[x], lp.verts[y], e1], (EDGE, edge_key));
                }
            }
            plan.push_prod(2, &[p, q, r], (EDGE, edge_key));
            let parent = lp.cavity[which % lp.cavity.len()];
            plan.push_prod(3, &[p, q, r, e0], (TET, parent));
            plan.push_prod(3, &[p, r, q, e1], (TET, parent));
        }
    }
    plan
}

/// One 3D swap pass over edges whose cavities sit below the desired quality.
pub fn swap_edges_3d(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    let quals = element_qualities(mesh)?;
    let e2c = mesh.ask_up(EDGE, TET);
    let e_class_dim = mesh.get_array::<i8>(EDGE, CLASS_DIM)?;
    let measure = TetMeasure::open(mesh)?;
    let cavity_min: Vec<f64> = crate::algs::arrays::parallel_map(mesh.nedges(), |e| {
        e2c.row(e)
            .iter()
            .map(|&c| quals[c as usize])
            .fold(f64::INFINITY, f64::min)
    });
    let mut cand_choices: Vec<Option<(EdgeLoop, LoopChoice)>> = vec![None; mesh.nedges()];
    let mut edge_quals = vec![-1.0f64; mesh.nedges()];
    let mut edge_cands = vec![0u8; mesh.nedges()];
    for e in 0..mesh.nedges() {
        if e_class_dim[e] as usize != 3 || cavity_min[e] >= opts.min_quality_desired {
            continue;
        }
        if e2c.row(e).len() > opts.swap3d_max_loop_size {
            continue;
        }
        let Some(lp) = find_loop(mesh, e) else {
            continue;
        };
        let choice = choose_triangulation(mesh, &measure, &lp);
        if choice.quality > cavity_min[e] && choice.quality > opts.min_quality_allowed {
            edge_quals[e] = choice.quality;
            edge_cands[e] = 1;
            cand_choices[e] = Some((lp, choice));
        }
    }
    let any = edge_cands.iter().any(|&m| m != 0);
    if !mesh.comm().reduce_or(any) {
        return Ok(false);
    }
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
    let chosen: Vec<(EdgeLoop, LoopChoice)> = keys2edges
        .iter()
        .map(|&e| cand_choices[e as usize].clone().expect("keys are candidates"))
        .collect();
    let plan = swap3d_plan(mesh, &chosen);
    let (new_mesh, _) = rebuild(mesh, &plan)?;
    *mesh = new_mesh;
    Ok(true)
}

/// Quality-driven edge swapping for either dimension.
pub fn swap_edges(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    match mesh.dim() {
        2 => crate::adapt::swap2d::swap_edges_2d(mesh, opts),
        _ => swap_edges_3d(mesh, opts),
    }
}
