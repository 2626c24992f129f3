//! Collapse codes and admissibility checks.
//!
//! A collapse candidate edge carries a two-bit code saying which endpoints
//! may collapse onto the other. Classification compatibility and boundary
//! exposure prune the code before any quality is evaluated.

use crate::geometry::{cross, dot, sub_v, Vector};
use crate::mesh_error::Result;
use crate::topology::classify::{CLASS_DIM, CLASS_ID};
use crate::topology::{Lo, Mesh, EDGE, VERT};

/// No direction may collapse.
pub const DONT_COLLAPSE: i8 = 0;
/// Both directions may collapse.
pub const COLLAPSE_BOTH: i8 = 3;

/// Allow collapsing endpoint `eev` (0 or 1).
#[inline]
pub const fn do_collapse(code: i8, eev: usize) -> i8 {
    code | (1 << eev)
}

/// Forbid collapsing endpoint `eev`.
#[inline]
pub const fn dont_collapse(code: i8, eev: usize) -> i8 {
    code & !(1 << eev)
}

/// Whether the code allows collapsing endpoint `eev`.
#[inline]
pub const fn collapses(code: i8, eev: usize) -> bool {
    code & (1 << eev) != 0
}

/// Classification compatibility: an endpoint may only collapse along an edge
/// classified on the same model feature it is classified on. A vertex on a
/// model vertex never collapses; a vertex on a model edge only slides along
/// that model edge; interior vertices collapse along interior edges.
pub fn check_collapse_class(
    mesh: &Mesh,
    cands2edges: &[Lo],
    cand_codes: &[i8],
) -> Result<Vec<i8>> {
    let ev2v = mesh.ask_verts_of(1);
    let v_class_dim = mesh.get_array::<i8>(VERT, CLASS_DIM)?;
    let v_class_id = mesh.get_array::<i32>(VERT, CLASS_ID)?;
    let e_class_dim = mesh.get_array::<i8>(EDGE, CLASS_DIM)?;
    let e_class_id = mesh.get_array::<i32>(EDGE, CLASS_ID)?;
    let out = crate::algs::arrays::parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let mut code = cand_codes[cand];
        for eev in 0..2 {
            if !collapses(code, eev) {
                continue;
            }
            let v = ev2v[e * 2 + eev] as usize;
            if v_class_dim[v] != e_class_dim[e] || v_class_id[v] != e_class_id[e] {
                code = dont_collapse(code, eev);
            }
        }
        code
    });
    Ok(out)
}

fn side_fold_flips<const D: usize>(
    coords: &[f64],
    side: &[Lo],
    v_col: Lo,
    v_onto: Lo,
) -> bool {
    let pos = |v: Lo| -> Vector<D> {
        std::array::from_fn(|d| coords[v as usize * D + d])
    };
    match D {
        2 => {
            // boundary edge (v, w): direction along the boundary must not
            // reverse when v slides onto the target
            let w = if side[0] == v_col { side[1] } else { side[0] };
            let before = sub_v(pos(w), pos(v_col));
            let after = sub_v(pos(w), pos(v_onto));
            dot(before, after) <= 0.0
        }
        _ => {
            let p: Vec<Vector<3>> = side
                .iter()
                .map(|&v| {
                    let q = pos(if v == v_col { v_onto } else { v });
                    [q[0], q[1], q.get(2).copied().unwrap_or(0.0)]
                })
                .collect();
            let o: Vec<Vector<3>> = side
                .iter()
                .map(|&v| {
                    let q = pos(v);
                    [q[0], q[1], q.get(2).copied().unwrap_or(0.0)]
                })
                .collect();
            let before = cross(sub_v(o[1], o[0]), sub_v(o[2], o[0]));
            let after = cross(sub_v(p[1], p[0]), sub_v(p[2], p[0]));
            dot(before, after) <= 0.0
        }
    }
}

/// Surface exposure: forbid a direction whose rewiring would fold a boundary
/// side over itself (reverse its orientation relative to the model surface).
pub fn check_collapse_exposure(
    mesh: &Mesh,
    cands2edges: &[Lo],
    cand_codes: &[i8],
) -> Result<Vec<i8>> {
    let dim = mesh.dim();
    let ev2v = mesh.ask_verts_of(1);
    let sv2v = mesh.ask_verts_of(dim - 1);
    let v2s = mesh.ask_up(VERT, dim - 1);
    let s_class_dim = mesh.get_array::<i8>(dim - 1, CLASS_DIM)?;
    let coords = mesh.coords();
    let nsv = dim;
    let out = crate::algs::arrays::parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let mut code = cand_codes[cand];
        for eev in 0..2 {
            if !collapses(code, eev) {
                continue;
            }
            let v_col = ev2v[e * 2 + eev];
            let v_onto = ev2v[e * 2 + (1 - eev)];
            for &s in v2s.row(v_col as usize) {
                if s_class_dim[s as usize] as usize >= dim {
                    continue;
                }
                let side = &sv2v[s as usize * nsv..(s as usize + 1) * nsv];
                if side.contains(&v_onto) {
                    continue;
                }
                let flips = match dim {
                    2 => side_fold_flips::<2>(coords, side, v_col, v_onto),
                    _ => side_fold_flips::<3>(coords, side, v_col, v_onto),
                };
                if flips {
                    code = dont_collapse(code, eev);
                    break;
                }
            }
        }
        code
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::build_box_2d;
    use crate::topology::classify::classify_by_angles;

    #[test]
    fn code_bits() {
        assert_eq!(do_collapse(DONT_COLLAPSE, 0), 1);
        assert_eq!(do_collapse(DONT_COLLAPSE, 1), 2);
        assert_eq!(do_collapse(do_collapse(DONT_COLLAPSE, 0), 1), COLLAPSE_BOTH);
        assert!(collapses(COLLAPSE_BOTH, 0));
        assert!(collapses(COLLAPSE_BOTH, 1));
        assert_eq!(dont_collapse(COLLAPSE_BOTH, 0), 2);
        assert!(!collapses(dont_collapse(COLLAPSE_BOTH, 1), 1));
    }

    #[test]
    fn corners_never_collapse() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        let v_class_dim = mesh.get_array::<i8>(VERT, CLASS_DIM).unwrap();
        let ev2v = mesh.ask_verts_of(1);
        let cands: Vec<Lo> = (0..mesh.nedges() as Lo).collect();
        let codes = vec![COLLAPSE_BOTH; mesh.nedges()];
        let out = check_collapse_class(&mesh, &cands, &codes).unwrap();
        for e in 0..mesh.nedges() {
            for eev in 0..2 {
                let v = ev2v[e * 2 + eev] as usize;
                if v_class_dim[v] == 0 {
                    assert!(!collapses(out[e], eev), "corner vertex may not collapse");
                }
            }
        }
        // interior edges keep both interior endpoints collapsible
        let e_class_dim = mesh.get_array::<i8>(EDGE, CLASS_DIM).unwrap();
        let some_interior = (0..mesh.nedges()).find(|&e| {
            e_class_dim[e] == 2
                && (0..2).all(|eev| v_class_dim[ev2v[e * 2 + eev] as usize] == 2)
        });
        if let Some(e) = some_interior {
            assert_eq!(out[e], COLLAPSE_BOTH);
        }
    }

    #[test]
    fn boundary_vertex_cannot_collapse_inward() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        let v_class_dim = mesh.get_array::<i8>(VERT, CLASS_DIM).unwrap();
        let e_class_dim = mesh.get_array::<i8>(EDGE, CLASS_DIM).unwrap();
        let ev2v = mesh.ask_verts_of(1);
        let cands: Vec<Lo> = (0..mesh.nedges() as Lo).collect();
        let codes = vec![COLLAPSE_BOTH; mesh.nedges()];
        let out = check_collapse_class(&mesh, &cands, &codes).unwrap();
        for e in 0..mesh.nedges() {
            if e_class_dim[e] == 2 {
                for eev in 0..2 {
                    let v = ev2v[e * 2 + eev] as usize;
                    if v_class_dim[v] < 2 {
                        assert!(!collapses(out[e], eev));
                    }
                }
            }
        }
    }

    #[test]
    fn exposure_blocks_boundary_folds() {
        // 1x3 strip: collapsing a boundary vertex past its neighbor along
        // the boundary would fold the boundary edge chain
        let mut mesh = build_box_2d(NoComm::world(), 3.0, 1.0, 3, 1).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        let cands: Vec<Lo> = (0..mesh.nedges() as Lo).collect();
        let codes = vec![COLLAPSE_BOTH; mesh.nedges()];
        let out = check_collapse_exposure(&mesh, &cands, &codes).unwrap();
        // no code gains bits, some may lose them
        for e in 0..mesh.nedges() {
            for eev in 0..2 {
                if collapses(out[e], eev) {
                    assert!(collapses(codes[e], eev));
                }
            }
        }
    }
}
