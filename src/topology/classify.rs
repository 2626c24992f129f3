//! Geometric classification by feature angles.
//!
//! Classification assigns every entity the `(class_dim, class_id)` of the
//! model feature it lies on. Without CAD data the model is inferred from the
//! mesh itself: exposed sides become surface patches (split where the
//! dihedral angle is sharp), patch boundaries become model edges, and sharp
//! corners become model vertices. Ids are opaque; only equality matters.

use crate::algs::map::offset_scan;
use crate::geometry::{cross, dot, normalize, sub_v, Vector};
use crate::mesh_error::Result;
use crate::topology::mesh::{Mesh, XferPolicy};
use crate::topology::{Lo, NONE, VERT};

/// Tag names holding the classification.
pub const CLASS_DIM: &str = "class_dim";
pub const CLASS_ID: &str = "class_id";

/// Marks of sides (dimension `dim - 1`) bounding exactly one cell.
pub fn mark_exposed_sides(mesh: &Mesh) -> Vec<u8> {
    let dim = mesh.dim();
    let sides2cells = mesh.ask_up(dim - 1, dim);
    crate::algs::arrays::parallel_map(mesh.nents(dim - 1), |s| {
        u8::from(sides2cells.row(s).len() == 1)
    })
}

/// Union-find over entity ids, used to grow feature components.
struct Components {
    parent: Vec<Lo>,
}

impl Components {
    fn new(n: usize) -> Self {
        Components {
            parent: (0..n as Lo).collect(),
        }
    }

    fn find(&mut self, mut x: Lo) -> Lo {
        while self.parent[x as usize] != x {
            let up = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = up;
            x = up;
        }
        x
    }

    fn union(&mut self, a: Lo, b: Lo) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // lowest root wins so ids come out deterministic
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi as usize] = lo;
        }
    }

    /// Dense component ids ordered by each component's lowest member.
    fn label(&mut self, members: &[Lo]) -> Vec<(Lo, i32)> {
        let mut roots: Vec<Lo> = members.iter().map(|&m| self.find(m)).collect();
        let mut unique = roots.clone();
        unique.sort_unstable();
        unique.dedup();
        let id_of = |r: Lo| unique.binary_search(&r).unwrap() as i32;
        roots
            .drain(..)
            .zip(members.iter())
            .map(|(r, &m)| (m, id_of(r)))
            .collect()
    }
}

fn vert_pos<const D: usize>(coords: &[f64], v: Lo) -> Vector<D> {
    std::array::from_fn(|d| coords[v as usize * D + d])
}

/// Outward-ish normal of a boundary side from its stored vertex order.
fn side_normal(mesh: &Mesh, s: usize) -> Vector<3> {
    let sv2v = mesh.ask_verts_of(mesh.dim() - 1);
    let coords = mesh.coords();
    match mesh.dim() {
        2 => {
            let a = vert_pos::<2>(coords, sv2v[s * 2]);
            let b = vert_pos::<2>(coords, sv2v[s * 2 + 1]);
            let t = sub_v(b, a);
            normalize([t[1], -t[0], 0.0])
        }
        _ => {
            let a = vert_pos::<3>(coords, sv2v[s * 3]);
            let b = vert_pos::<3>(coords, sv2v[s * 3 + 1]);
            let c = vert_pos::<3>(coords, sv2v[s * 3 + 2]);
            normalize(cross(sub_v(b, a), sub_v(c, a)))
        }
    }
}

/// Angle between two unit vectors, insensitive to sign (stored orientations
/// of derived sides are arbitrary).
fn unsigned_angle(a: Vector<3>, b: Vector<3>) -> f64 {
    dot(a, b).abs().clamp(0.0, 1.0).acos()
}

/// Classify all entities by feature angles: boundary sides sharing a
/// near-parallel normal merge into one surface patch; patch borders and
/// sharp hinges become model edges; their endpoints and corners become model
/// vertices. Interior entities classify to the single region `(dim, 0)`.
///
/// Attaches `class_dim` (I8) and `class_id` (I32) at every entity dimension,
/// replacing previous classification.
pub fn classify_by_angles(mesh: &mut Mesh, sharp_angle: f64) -> Result<()> {
    let dim = mesh.dim();
    let exposed = mark_exposed_sides(mesh);
    let nsides = mesh.nents(dim - 1);
    let boundary_sides: Vec<Lo> = crate::algs::map::collect_marked(&exposed);

    // group boundary sides into surface patches across smooth hinges
    let normals: Vec<Vector<3>> = boundary_sides
        .iter()
        .map(|&s| side_normal(mesh, s as usize))
        .collect();
    let side_index: Vec<Lo> = {
        let mut idx = vec![NONE; nsides];
        for (i, &s) in boundary_sides.iter().enumerate() {
            idx[s as usize] = i as Lo;
        }
        idx
    };
    let hinges2sides = mesh.ask_up(dim - 2, dim - 1);
    let mut patches = Components::new(boundary_sides.len());
    let nhinges = mesh.nents(dim - 2);
    let mut hinge_is_sharp = vec![false; nhinges];
    for h in 0..nhinges {
        let adj_boundary: Vec<Lo> = hinges2sides
            .row(h)
            .iter()
            .copied()
            .filter(|&s| exposed[s as usize] != 0)
            .collect();
        if adj_boundary.len() == 2 {
            let (i, j) = (
                side_index[adj_boundary[0] as usize],
                side_index[adj_boundary[1] as usize],
            );
            if unsigned_angle(normals[i as usize], normals[j as usize]) <= sharp_angle {
                patches.union(i, j);
            } else {
                hinge_is_sharp[h] = true;
            }
        } else if adj_boundary.len() > 2 {
            // non-manifold junction acts as a crease
            hinge_is_sharp[h] = true;
        }
    }
    let members: Vec<Lo> = (0..boundary_sides.len() as Lo).collect();
    let patch_ids = patches.label(&members);

    // side classification
    let mut side_class_dim = vec![dim as i8; nsides];
    let mut side_class_id = vec![0i32; nsides];
    for &(member, id) in &patch_ids {
        let s = boundary_sides[member as usize] as usize;
        side_class_dim[s] = (dim - 1) as i8;
        side_class_id[s] = id;
    }

    // hinge entities: sharp hinges (and hinges between two different
    // patches) become model edges in 3D / model vertices in 2D
    let mut hinge_class_dim = vec![dim as i8; nhinges];
    let mut hinge_class_id = vec![0i32; nhinges];
    let mut hinge_on_feature = vec![false; nhinges];
    for h in 0..nhinges {
        let adj_boundary: Vec<Lo> = hinges2sides
            .row(h)
            .iter()
            .copied()
            .filter(|&s| exposed[s as usize] != 0)
            .collect();
        if adj_boundary.is_empty() {
            continue;
        }
        let pids: Vec<i32> = adj_boundary
            .iter()
            .map(|&s| side_class_id[s as usize])
            .collect();
        let crease = hinge_is_sharp[h] || pids.windows(2).any(|w| w[0] != w[1]);
        if crease {
            hinge_on_feature[h] = true;
        } else {
            hinge_class_dim[h] = (dim - 1) as i8;
            hinge_class_id[h] = pids[0];
        }
    }

    if dim == 3 {
        classify_creases_3d(
            mesh,
            &mut hinge_class_dim,
            &mut hinge_class_id,
            &hinge_on_feature,
            sharp_angle,
        );
    } else {
        // 2D: feature hinges are vertices; give each its own model vertex id
        let mut next = 0;
        for h in 0..nhinges {
            if hinge_on_feature[h] {
                hinge_class_dim[h] = 0;
                hinge_class_id[h] = next;
                next += 1;
            }
        }
    }

    // vertices inherit the lowest classification of their upward entities
    let (vert_class_dim, vert_class_id) = classify_verts(
        mesh,
        &side_class_dim,
        &side_class_id,
        &hinge_class_dim,
        &hinge_class_id,
    );

    let ncells = mesh.nelems();
    set_class(mesh, dim, vec![dim as i8; ncells], vec![0i32; ncells])?;
    set_class(mesh, dim - 1, side_class_dim, side_class_id)?;
    if dim == 3 {
        set_class(mesh, 1, hinge_class_dim, hinge_class_id)?;
    }
    set_class(mesh, VERT, vert_class_dim, vert_class_id)?;
    Ok(())
}

/// Group crease edges of a 3D mesh into model edges, splitting at sharp
/// turns and at junction vertices; isolated or corner endpoints become model
/// vertices later via vertex classification.
fn classify_creases_3d(
    mesh: &Mesh,
    edge_class_dim: &mut [i8],
    edge_class_id: &mut [i32],
    edge_on_feature: &[bool],
    sharp_angle: f64,
) {
    let coords = mesh.coords();
    let ev2v = mesh.ask_verts_of(1);
    let crease_edges: Vec<Lo> = (0..mesh.nedges() as Lo)
        .filter(|&e| edge_on_feature[e as usize])
        .collect();
    let edge_index: Vec<Lo> = {
        let mut idx = vec![NONE; mesh.nedges()];
        for (i, &e) in crease_edges.iter().enumerate() {
            idx[e as usize] = i as Lo;
        }
        idx
    };
    // per-vertex incident crease edges
    let mut degrees = vec![0 as Lo; mesh.nverts()];
    for &e in &crease_edges {
        degrees[ev2v[e as usize * 2] as usize] += 1;
        degrees[ev2v[e as usize * 2 + 1] as usize] += 1;
    }
    let offsets = offset_scan(&degrees);
    let mut slots: Vec<Lo> = offsets[..mesh.nverts()].to_vec();
    let mut v2crease = vec![0 as Lo; *offsets.last().unwrap() as usize];
    for &e in &crease_edges {
        for k in 0..2 {
            let v = ev2v[e as usize * 2 + k] as usize;
            v2crease[slots[v] as usize] = e;
            slots[v] += 1;
        }
    }
    let mut curves = Components::new(crease_edges.len());
    for v in 0..mesh.nverts() {
        let incident = &v2crease[offsets[v] as usize..offsets[v + 1] as usize];
        if incident.len() != 2 {
            continue;
        }
        let dir = |e: Lo| -> Vector<3> {
            let a = vert_pos::<3>(coords, ev2v[e as usize * 2]);
            let b = vert_pos::<3>(coords, ev2v[e as usize * 2 + 1]);
            normalize(sub_v(b, a))
        };
        if unsigned_angle(dir(incident[0]), dir(incident[1])) <= sharp_angle {
            curves.union(
                edge_index[incident[0] as usize],
                edge_index[incident[1] as usize],
            );
        }
    }
    let members: Vec<Lo> = (0..crease_edges.len() as Lo).collect();
    for (member, id) in curves.label(&members) {
        let e = crease_edges[member as usize] as usize;
        edge_class_dim[e] = 1;
        edge_class_id[e] = id;
    }
}

/// A vertex classifies to the lowest-dimensional feature among its upward
/// entities: surface patch from its sides, model edge from its creases, and
/// a model vertex where creases end or meet.
fn classify_verts(
    mesh: &Mesh,
    side_class_dim: &[i8],
    side_class_id: &[i32],
    hinge_class_dim: &[i8],
    hinge_class_id: &[i32],
) -> (Vec<i8>, Vec<i32>) {
    let dim = mesh.dim();
    let nverts = mesh.nverts();
    let mut class_dim = vec![dim as i8; nverts];
    let mut class_id = vec![0i32; nverts];
    let sides_up = mesh.ask_up(VERT, dim - 1);
    for v in 0..nverts {
        for &s in sides_up.row(v) {
            let cd = side_class_dim[s as usize];
            if cd < class_dim[v] {
                class_dim[v] = cd;
                class_id[v] = side_class_id[s as usize];
            }
        }
    }
    if dim == 2 {
        // hinges are the vertices themselves
        for v in 0..nverts {
            if hinge_class_dim[v] == 0 {
                class_dim[v] = 0;
                class_id[v] = hinge_class_id[v];
            }
        }
        return (class_dim, class_id);
    }
    let edges_up = mesh.ask_up(VERT, 1);
    for v in 0..nverts {
        let mut curve_ids: Vec<i32> = edges_up
            .row(v)
            .iter()
            .filter(|&&e| hinge_class_dim[e as usize] == 1)
            .map(|&e| hinge_class_id[e as usize])
            .collect();
        if curve_ids.is_empty() {
            continue;
        }
        let ncreases = curve_ids.len();
        curve_ids.sort_unstable();
        curve_ids.dedup();
        if ncreases == 2 && curve_ids.len() == 1 {
            // interior of one model edge
            class_dim[v] = 1;
            class_id[v] = curve_ids[0];
        } else {
            // dangling end or junction of model edges
            class_dim[v] = 0;
            class_id[v] = v as i32;
        }
    }
    (class_dim, class_id)
}

/// Replace the classification tags at one entity dimension.
fn set_class(mesh: &mut Mesh, d: usize, class_dim: Vec<i8>, class_id: Vec<i32>) -> Result<()> {
    if mesh.has_tag(d, CLASS_DIM) {
        mesh.remove_tag(d, CLASS_DIM)?;
    }
    if mesh.has_tag(d, CLASS_ID) {
        mesh.remove_tag(d, CLASS_ID)?;
    }
    mesh.add_tag(d, CLASS_DIM, 1, XferPolicy::Inherit, class_dim)?;
    mesh.add_tag(d, CLASS_ID, 1, XferPolicy::Inherit, class_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::{build_box_2d, build_box_3d};
    use std::f64::consts::PI;

    #[test]
    fn square_corners_become_model_vertices() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 3, 3).unwrap();
        classify_by_angles(&mut mesh, PI / 4.0).unwrap();
        let class_dim = mesh.get_array::<i8>(VERT, CLASS_DIM).unwrap();
        let corners = class_dim.iter().filter(|&&d| d == 0).count();
        assert_eq!(corners, 4);
        // boundary verts minus corners live on model edges
        let on_curves = class_dim.iter().filter(|&&d| d == 1).count();
        assert_eq!(on_curves, 4 * 2);
        let interior = class_dim.iter().filter(|&&d| d == 2).count();
        assert_eq!(interior, 4);
        // the four box sides are distinct model edges
        let edge_dims = mesh.get_array::<i8>(1, CLASS_DIM).unwrap();
        let edge_ids = mesh.get_array::<i32>(1, CLASS_ID).unwrap();
        let mut boundary_ids: Vec<i32> = edge_dims
            .iter()
            .zip(edge_ids.iter())
            .filter(|(&d, _)| d == 1)
            .map(|(_, &i)| i)
            .collect();
        boundary_ids.sort_unstable();
        boundary_ids.dedup();
        assert_eq!(boundary_ids.len(), 4);
    }

    #[test]
    fn cube_classifies_patches_curves_corners() {
        let mut mesh = build_box_3d(NoComm::world(), 1.0, 1.0, 1.0, 2, 2, 2).unwrap();
        classify_by_angles(&mut mesh, PI / 4.0).unwrap();
        let face_dims = mesh.get_array::<i8>(2, CLASS_DIM).unwrap();
        let face_ids = mesh.get_array::<i32>(2, CLASS_ID).unwrap();
        let mut patch_ids: Vec<i32> = face_dims
            .iter()
            .zip(face_ids.iter())
            .filter(|(&d, _)| d == 2)
            .map(|(_, &i)| i)
            .collect();
        patch_ids.sort_unstable();
        patch_ids.dedup();
        assert_eq!(patch_ids.len(), 6);

        let vert_dims = mesh.get_array::<i8>(VERT, CLASS_DIM).unwrap();
        assert_eq!(vert_dims.iter().filter(|&&d| d == 0).count(), 8);
        assert_eq!(vert_dims.iter().filter(|&&d| d == 1).count(), 12);
        assert_eq!(vert_dims.iter().filter(|&&d| d == 2).count(), 6);
        assert_eq!(vert_dims.iter().filter(|&&d| d == 3).count(), 1);
    }

    #[test]
    fn exposed_side_count_matches_boundary() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        let exposed = mark_exposed_sides(&mesh);
        assert_eq!(
            exposed.iter().map(|&m| m as usize).sum::<usize>(),
            4 * 2
        );
    }
}
