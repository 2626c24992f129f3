//! The topology rewrite shared by refine, coarsen, and swap.
//!
//! An operator pass describes its chosen cavities as a [`RewritePlan`]: dead
//! cells and vertices, new vertices with their parent entities, and product
//! entities per dimension as vertex tuples (in the extended numbering where
//! old vertices keep their ids and new vertices follow). `rebuild` then
//! assembles the next mesh version in four stages: renumber survivors,
//! concatenate survivor and product cells, rederive intermediate dimensions
//! with canonical orientations, and recover the same-entity and product maps
//! that field transfer consumes.

use crate::mesh_error::{MeshAdaptError, Result};
use crate::topology::{simplex_nverts, Lo, Mesh, NONE};
use hashbrown::HashMap;

/// Product entities of one dimension: flat vertex tuples in the extended
/// numbering plus the old entity each product derives from.
#[derive(Clone, Debug, Default)]
pub struct ProductList {
    pub verts: Vec<Lo>,
    pub parents: Vec<(usize, Lo)>,
}

/// Everything an operator decided for one rewrite.
#[derive(Clone, Debug)]
pub struct RewritePlan {
    /// Coordinates of new vertices, `nnew * dim`.
    pub new_vert_coords: Vec<f64>,
    /// Parent (dim, old id) per new vertex.
    pub new_vert_parents: Vec<(usize, Lo)>,
    /// Old cells removed by some cavity.
    pub dead_cells: Vec<u8>,
    /// Old vertices removed (collapse targets only).
    pub dead_verts: Vec<u8>,
    /// Products per dimension, `prods[1..=dim]`; `prods[0]` stays empty.
    pub prods: Vec<ProductList>,
}

impl RewritePlan {
    /// An empty plan frame for a mesh (no cavities yet).
    pub fn new(mesh: &Mesh) -> Self {
        RewritePlan {
            new_vert_coords: Vec::new(),
            new_vert_parents: Vec::new(),
            dead_cells: vec![0; mesh.nelems()],
            dead_verts: vec![0; mesh.nverts()],
            prods: vec![ProductList::default(); mesh.dim() + 1],
        }
    }

    /// Register a new vertex, returning its extended id.
    pub fn push_vert(&mut self, mesh: &Mesh, coords: &[f64], parent: (usize, Lo)) -> Lo {
        let ext = (mesh.nverts() + self.new_vert_parents.len()) as Lo;
        self.new_vert_coords.extend_from_slice(coords);
        self.new_vert_parents.push(parent);
        ext
    }

    /// Register a product entity of dimension `d`.
    pub fn push_prod(&mut self, d: usize, verts: &[Lo], parent: (usize, Lo)) {
        debug_assert_eq!(verts.len(), simplex_nverts(d));
        self.prods[d].verts.extend_from_slice(verts);
        self.prods[d].parents.push(parent);
    }
}

/// Maps from the rewrite, used for field transfer.
#[derive(Clone, Debug)]
pub struct RewriteMaps {
    /// Old vertex to new vertex ([`NONE`] for dead vertices).
    pub old_verts2new_verts: Vec<Lo>,
    /// Per dimension: surviving old entity ids.
    pub same_ents2old_ents: Vec<Vec<Lo>>,
    /// Per dimension: their ids in the new mesh, aligned with the above.
    pub same_ents2new_ents: Vec<Vec<Lo>>,
    /// Per dimension: new ids of products.
    pub prods2new_ents: Vec<Vec<Lo>>,
    /// Per dimension: parent (dim, old id) per product, aligned.
    pub prod_parents: Vec<Vec<(usize, Lo)>>,
}

fn sorted_tuple(verts: &[Lo]) -> Vec<Lo> {
    let mut t = verts.to_vec();
    t.sort_unstable();
    t
}

/// Assemble the next mesh version from a rewrite plan.
pub fn rebuild(mesh: &Mesh, plan: &RewritePlan) -> Result<(Mesh, RewriteMaps)> {
    let dim = mesh.dim();
    let nverts_old = mesh.nverts();
    let nnew_verts = plan.new_vert_parents.len();
    if plan.new_vert_coords.len() != nnew_verts * dim
        || plan.dead_verts.len() != nverts_old
        || plan.dead_cells.len() != mesh.nelems()
        || plan.prods.len() != dim + 1
    {
        return Err(MeshAdaptError::InvariantViolation(
            "rewrite plan buffers disagree with the mesh".into(),
        ));
    }

    // stage 1: renumber surviving vertices, append products
    let mut old2new = vec![NONE; nverts_old];
    let mut nsurv_verts = 0;
    for v in 0..nverts_old {
        if plan.dead_verts[v] == 0 {
            old2new[v] = nsurv_verts as Lo;
            nsurv_verts += 1;
        }
    }
    let ext2new = |old2new: &[Lo], x: Lo| -> Result<Lo> {
        if (x as usize) < nverts_old {
            let mapped = old2new[x as usize];
            if mapped == NONE {
                return Err(MeshAdaptError::InvariantViolation(format!(
                    "product references dead vertex {x}"
                )));
            }
            Ok(mapped)
        } else {
            Ok((nsurv_verts + (x as usize - nverts_old)) as Lo)
        }
    };
    let mut coords = Vec::with_capacity((nsurv_verts + nnew_verts) * dim);
    for v in 0..nverts_old {
        if plan.dead_verts[v] == 0 {
            coords.extend_from_slice(mesh.vert_coords(v));
        }
    }
    coords.extend_from_slice(&plan.new_vert_coords);

    // stage 2: concatenate surviving cells with product cells
    let nev = simplex_nverts(dim);
    let old_ev2v = mesh.ask_verts_of(dim);
    let mut new_ev2v = Vec::new();
    let mut same_cells2old = Vec::new();
    for c in 0..mesh.nelems() {
        if plan.dead_cells[c] != 0 {
            continue;
        }
        same_cells2old.push(c as Lo);
        for &v in &old_ev2v[c * nev..(c + 1) * nev] {
            let mapped = old2new[v as usize];
            if mapped == NONE {
                return Err(MeshAdaptError::InvariantViolation(format!(
                    "surviving cell {c} references dead vertex {v}"
                )));
            }
            new_ev2v.push(mapped);
        }
    }
    let nsame_cells = same_cells2old.len();
    for x in &plan.prods[dim].verts {
        new_ev2v.push(ext2new(&old2new, *x)?);
    }
    let nprod_cells = plan.prods[dim].parents.len();

    // stage 3: derive all dimensions with canonical orientations
    let new_mesh = Mesh::from_elems_and_coords(mesh.comm().clone(), dim, new_ev2v, coords)?;

    // stage 4: recover same-entity and product maps
    let mut maps = RewriteMaps {
        old_verts2new_verts: Vec::new(),
        same_ents2old_ents: vec![Vec::new(); dim + 1],
        same_ents2new_ents: vec![Vec::new(); dim + 1],
        prods2new_ents: vec![Vec::new(); dim + 1],
        prod_parents: vec![Vec::new(); dim + 1],
    };
    // vertices
    for v in 0..nverts_old {
        if plan.dead_verts[v] == 0 {
            maps.same_ents2old_ents[0].push(v as Lo);
            maps.same_ents2new_ents[0].push(old2new[v]);
        }
    }
    maps.prods2new_ents[0] = (nsurv_verts as Lo..(nsurv_verts + nnew_verts) as Lo).collect();
    maps.prod_parents[0] = plan.new_vert_parents.clone();
    // cells keep their concatenation order
    maps.same_ents2new_ents[dim] = (0..nsame_cells as Lo).collect();
    maps.same_ents2old_ents[dim] = same_cells2old;
    maps.prods2new_ents[dim] =
        (nsame_cells as Lo..(nsame_cells + nprod_cells) as Lo).collect();
    maps.prod_parents[dim] = plan.prods[dim].parents.clone();
    // intermediate dimensions match by sorted vertex tuple
    for d in 1..dim {
        let nlv = simplex_nverts(d);
        let new_lv2v = new_mesh.ask_verts_of(d);
        let mut index: HashMap<Vec<Lo>, Lo> = HashMap::with_capacity(new_mesh.nents(d));
        for l in 0..new_mesh.nents(d) {
            index.insert(sorted_tuple(&new_lv2v[l * nlv..(l + 1) * nlv]), l as Lo);
        }
        let mut claimed = vec![false; new_mesh.nents(d)];
        let old_lv2v = mesh.ask_verts_of(d);
        for l in 0..mesh.nents(d) {
            let tuple = &old_lv2v[l * nlv..(l + 1) * nlv];
            if tuple.iter().any(|&v| old2new[v as usize] == NONE) {
                continue;
            }
            let mapped: Vec<Lo> = tuple.iter().map(|&v| old2new[v as usize]).collect();
            if let Some(&nl) = index.get(&sorted_tuple(&mapped)) {
                maps.same_ents2old_ents[d].push(l as Lo);
                maps.same_ents2new_ents[d].push(nl);
                claimed[nl as usize] = true;
            }
        }
        for (p, &parent) in plan.prods[d].parents.iter().enumerate() {
            let ext = &plan.prods[d].verts[p * nlv..(p + 1) * nlv];
            let mapped: Result<Vec<Lo>> = ext.iter().map(|&x| ext2new(&old2new, x)).collect();
            let mapped = mapped?;
            let nl = *index.get(&sorted_tuple(&mapped)).ok_or_else(|| {
                MeshAdaptError::InvariantViolation(format!(
                    "product entity {mapped:?} missing from rebuilt mesh"
                ))
            })?;
            // a rewired entity can coincide with a survivor or another
            // product; the first claim wins
            if !claimed[nl as usize] {
                claimed[nl as usize] = true;
                maps.prods2new_ents[d].push(nl);
                maps.prod_parents[d].push(parent);
            }
        }
        if claimed.iter().any(|&c| !c) {
            let missing = claimed.iter().position(|&c| !c).unwrap_or(0);
            return Err(MeshAdaptError::InvariantViolation(format!(
                "entity {missing} at dimension {d} is neither survivor nor product"
            )));
        }
    }
    maps.old_verts2new_verts = old2new;
    let new_mesh = crate::adapt::transfer::transfer_tags(mesh, new_mesh, &maps)?;
    Ok((new_mesh, maps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::XferPolicy;

    fn two_tris() -> Mesh {
        Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2, 2, 3, 0],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
        .unwrap()
    }

    /// Split the diagonal edge (0,2): each triangle bisects, one midpoint
    /// vertex appears, and field transfer follows the products.
    #[test]
    fn split_one_edge_of_two_triangles() {
        let mut mesh = two_tris();
        mesh.add_tag(0, "u", 1, XferPolicy::LinearInterp, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        // find the diagonal edge (0,2)
        let ev2v = mesh.ask_verts_of(1);
        let diag = (0..mesh.nedges())
            .find(|&e| sorted_tuple(&ev2v[e * 2..e * 2 + 2]) == vec![0, 2])
            .unwrap() as Lo;
        let mut plan = RewritePlan::new(&mesh);
        let m = plan.push_vert(&mesh, &[0.5, 0.5], (1, diag));
        plan.dead_cells = vec![1, 1];
        // halves of the diagonal plus midpoint-to-opposite edges
        plan.push_prod(1, &[0, m], (1, diag));
        plan.push_prod(1, &[m, 2], (1, diag));
        plan.push_prod(1, &[m, 1], (2, 0));
        plan.push_prod(1, &[m, 3], (2, 1));
        // each triangle splits along the midpoint
        plan.push_prod(2, &[0, 1, m], (2, 0));
        plan.push_prod(2, &[m, 1, 2], (2, 0));
        plan.push_prod(2, &[2, 3, m], (2, 1));
        plan.push_prod(2, &[m, 3, 0], (2, 1));
        let (new_mesh, maps) = rebuild(&mesh, &plan).unwrap();

        assert_eq!(new_mesh.nverts(), 5);
        assert_eq!(new_mesh.nelems(), 4);
        assert_eq!(new_mesh.nedges(), 8);
        assert_eq!(maps.same_ents2old_ents[0].len(), 4);
        assert_eq!(maps.prods2new_ents[0], vec![4]);
        // the four boundary edges survive, the diagonal does not
        assert_eq!(maps.same_ents2old_ents[1].len(), 4);
        assert!(!maps.same_ents2old_ents[1].contains(&diag));
        assert_eq!(maps.prods2new_ents[1].len(), 4);
        // midpoint value interpolates its parent edge
        let u = new_mesh.get_array::<f64>(0, "u").unwrap();
        assert_eq!(u[4], 2.0);
        assert_eq!(&u[..4], &[1.0, 2.0, 3.0, 4.0]);
        // all cells positively oriented
        for &q in crate::metric::field::element_sizes(&new_mesh).iter() {
            assert!(q > 0.0);
        }
    }

    /// Collapse vertex 1 onto vertex 0: the first triangle vanishes, the
    /// second survives intact.
    #[test]
    fn collapse_corner_vertex() {
        let mut mesh = two_tris();
        mesh.add_tag(0, "u", 1, XferPolicy::LinearInterp, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let mut plan = RewritePlan::new(&mesh);
        plan.dead_verts[1] = 1;
        plan.dead_cells[0] = 1;
        let (new_mesh, maps) = rebuild(&mesh, &plan).unwrap();
        assert_eq!(new_mesh.nverts(), 3);
        assert_eq!(new_mesh.nelems(), 1);
        assert_eq!(new_mesh.nedges(), 3);
        assert_eq!(maps.old_verts2new_verts[1], NONE);
        let u = new_mesh.get_array::<f64>(0, "u").unwrap();
        assert_eq!(*u, vec![1.0, 3.0, 4.0]);
    }

    #[test]
    fn surviving_cell_with_dead_vertex_is_a_plan_bug() {
        let mesh = two_tris();
        let mut plan = RewritePlan::new(&mesh);
        plan.dead_verts[1] = 1;
        // cell 0 still references vertex 1
        assert!(matches!(
            rebuild(&mesh, &plan),
            Err(MeshAdaptError::InvariantViolation(_))
        ));
    }
}
