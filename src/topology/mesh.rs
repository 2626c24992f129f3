//! The mesh container: entities, tags, adjacency caches, parting state.
//!
//! A `Mesh` is one immutable version of a distributed mesh. Entity buffers
//! are published once at construction; derived adjacencies are computed
//! lazily and cached behind `OnceCell`. Adaptation passes never mutate a
//! version in place: they build a new `Mesh` and swap it in, releasing the
//! old buffers when the last holder drops them.

use crate::algs::communicator::{CommPtr, NoComm};
use crate::algs::map::unmap;
use crate::mesh_error::{MeshAdaptError, Result};
use crate::topology::adj::{derive_dual, find_unique, invert_adj, reflect_down, Adj, Graph};
use crate::topology::remotes::{reduce_to_owners, sync_from_owners, OwnerReduce, Remotes};
use crate::topology::{simplex_degree, simplex_nverts, Go, Lo};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// How a tag is carried through a topology rewrite.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XferPolicy {
    /// Drop the tag on any rewrite (ephemeral per-pass data).
    DontTransfer,
    /// Products copy their parent entity's value (classification).
    Inherit,
    /// Products interpolate linearly (coordinates, generic vertex fields).
    LinearInterp,
    /// Products interpolate in the symmetric-log domain (metric tensors).
    Metric,
    /// Products take the geometric mean (isotropic size).
    Size,
}

/// Typed tag storage. Buffers are shared by reference count across mesh
/// versions until a rewrite replaces them.
#[derive(Clone, Debug, PartialEq)]
pub enum TagData {
    I8(Arc<Vec<i8>>),
    I32(Arc<Vec<i32>>),
    I64(Arc<Vec<i64>>),
    Real(Arc<Vec<f64>>),
}

impl TagData {
    fn len(&self) -> usize {
        match self {
            TagData::I8(v) => v.len(),
            TagData::I32(v) => v.len(),
            TagData::I64(v) => v.len(),
            TagData::Real(v) => v.len(),
        }
    }
}

/// Scalar types storable in tags.
pub trait TagValue: Sized + Clone {
    fn view(data: &TagData) -> Option<&Arc<Vec<Self>>>;
    fn wrap(data: Vec<Self>) -> TagData;
}

macro_rules! impl_tag_value {
    ($t:ty, $variant:ident) => {
        impl TagValue for $t {
            fn view(data: &TagData) -> Option<&Arc<Vec<Self>>> {
                match data {
                    TagData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn wrap(data: Vec<Self>) -> TagData {
                TagData::$variant(Arc::new(data))
            }
        }
    };
}

impl_tag_value!(i8, I8);
impl_tag_value!(i32, I32);
impl_tag_value!(i64, I64);
impl_tag_value!(f64, Real);

/// One named field attached to an entity dimension.
#[derive(Clone, Debug)]
pub struct Tag {
    pub name: String,
    pub width: usize,
    pub xfer: XferPolicy,
    pub data: TagData,
}

/// Partitioning state of a distributed mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parting {
    /// Elements uniquely owned, no ghost entities.
    ElemBased,
    /// Ghost layers replicated around rank boundaries.
    Ghosted { nlayers: usize },
}

#[derive(Clone, Debug, Default)]
struct EntData {
    n: usize,
    /// Vertex tuples, `n * (dim + 1)` entries; empty at dimension 0.
    verts: Arc<Vec<Lo>>,
    remotes: Remotes,
    tags: Vec<Tag>,
}

#[derive(Clone, Debug)]
struct AdjCaches {
    down: [[OnceCell<Arc<Adj>>; 4]; 4],
    up: [[OnceCell<Arc<Adj>>; 4]; 4],
    star0: OnceCell<Arc<Graph>>,
    dual: OnceCell<Arc<Graph>>,
}

impl Default for AdjCaches {
    fn default() -> Self {
        AdjCaches {
            down: Default::default(),
            up: Default::default(),
            star0: OnceCell::new(),
            dual: OnceCell::new(),
        }
    }
}

/// One version of a simplicial mesh (triangles in 2D, tetrahedra in 3D).
pub struct Mesh {
    dim: usize,
    comm: CommPtr,
    parting: Parting,
    coords: Arc<Vec<f64>>,
    ents: Vec<EntData>,
    caches: AdjCaches,
}

impl Mesh {
    /// Build a mesh from element-to-vertex connectivity and coordinates,
    /// deriving all intermediate entities.
    pub fn from_elems_and_coords(
        comm: CommPtr,
        dim: usize,
        ev2v: Vec<Lo>,
        coords: Vec<f64>,
    ) -> Result<Mesh> {
        if dim != 2 && dim != 3 {
            return Err(MeshAdaptError::UnsupportedDimension(dim));
        }
        let nev = simplex_nverts(dim);
        if ev2v.len() % nev != 0 {
            return Err(MeshAdaptError::ArraySizeMismatch {
                len: ev2v.len(),
                width: nev,
            });
        }
        if coords.len() % dim != 0 {
            return Err(MeshAdaptError::ArraySizeMismatch {
                len: coords.len(),
                width: dim,
            });
        }
        let nverts = coords.len() / dim;
        if let Some(&v) = ev2v.iter().max() {
            if v as usize >= nverts {
                return Err(MeshAdaptError::Precondition(format!(
                    "element vertex {v} out of range ({nverts} vertices)"
                )));
            }
        }
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        for c in 0..ev2v.len() / nev {
            let cell = &ev2v[c * nev..(c + 1) * nev];
            crate::check_invariant!(
                (0..nev).all(|i| (i + 1..nev).all(|j| cell[i] != cell[j])),
                "cell {c} repeats a vertex: {cell:?}"
            );
        }
        let rank = comm.rank() as i32;
        let mut ents = Vec::with_capacity(dim + 1);
        for d in 0..=dim {
            let verts = match d {
                0 => Vec::new(),
                d if d == dim => ev2v.clone(),
                _ => find_unique(&ev2v, dim, d),
            };
            let n = if d == 0 {
                nverts
            } else {
                verts.len() / simplex_nverts(d)
            };
            ents.push(EntData {
                n,
                verts: Arc::new(verts),
                remotes: Remotes::identity(n, rank),
                tags: Vec::new(),
            });
        }
        Ok(Mesh {
            dim,
            comm,
            parting: Parting::ElemBased,
            coords: Arc::new(coords),
            ents,
            caches: AdjCaches::default(),
        })
    }

    /// Serial convenience constructor.
    pub fn serial_from_elems_and_coords(
        dim: usize,
        ev2v: Vec<Lo>,
        coords: Vec<f64>,
    ) -> Result<Mesh> {
        Mesh::from_elems_and_coords(NoComm::world(), dim, ev2v, coords)
    }

    /// Spatial dimension, 2 or 3.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Communicator handle.
    pub fn comm(&self) -> &CommPtr {
        &self.comm
    }

    /// Current parting mode.
    pub fn parting(&self) -> Parting {
        self.parting
    }

    /// Request a parting mode. The serial implementation records the request;
    /// ghost construction belongs to the distribution collaborator.
    pub fn set_parting(&mut self, parting: Parting) {
        self.parting = parting;
    }

    /// Number of entities at dimension `d`.
    pub fn nents(&self, d: usize) -> usize {
        self.ents.get(d).map_or(0, |e| e.n)
    }

    /// Number of vertices.
    pub fn nverts(&self) -> usize {
        self.nents(0)
    }

    /// Number of edges.
    pub fn nedges(&self) -> usize {
        self.nents(1)
    }

    /// Number of elements (cells).
    pub fn nelems(&self) -> usize {
        self.nents(self.dim)
    }

    /// Vertex coordinates, `nverts * dim` row-major.
    pub fn coords(&self) -> &Arc<Vec<f64>> {
        &self.coords
    }

    /// Coordinates of one vertex.
    pub fn vert_coords(&self, v: usize) -> &[f64] {
        &self.coords[v * self.dim..(v + 1) * self.dim]
    }

    /// Vertex tuples of entities at dimension `d >= 1`.
    pub fn ask_verts_of(&self, d: usize) -> Arc<Vec<Lo>> {
        debug_assert!(d >= 1 && d <= self.dim);
        Arc::clone(&self.ents[d].verts)
    }

    /// Downward adjacency `high -> low`, fixed degree, with alignment codes.
    pub fn ask_down(&self, high: usize, low: usize) -> Arc<Adj> {
        debug_assert!(low < high && high <= self.dim);
        self.caches.down[high][low]
            .get_or_init(|| {
                if low == 0 {
                    return Arc::new(Adj::from_down(
                        self.ents[high].verts.as_ref().clone(),
                        Vec::new(),
                    ));
                }
                Arc::new(reflect_down(
                    &self.ents[high].verts,
                    &self.ents[low].verts,
                    high,
                    low,
                ))
            })
            .clone()
    }

    /// Upward CSR adjacency `low -> high`, parents ascending, with codes.
    pub fn ask_up(&self, low: usize, high: usize) -> Arc<Adj> {
        debug_assert!(low < high && high <= self.dim);
        self.caches.up[low][high]
            .get_or_init(|| {
                let down = self.ask_down(high, low);
                Arc::new(invert_adj(
                    &down,
                    simplex_degree(high, low),
                    self.nents(low),
                ))
            })
            .clone()
    }

    /// Vertex-to-vertex star through edges, neighbor lists ascending.
    pub fn ask_star(&self, d: usize) -> Arc<Graph> {
        debug_assert_eq!(d, 0, "only the vertex star is provided");
        self.caches
            .star0
            .get_or_init(|| {
                let v2e = self.ask_up(0, 1);
                let ev2v = self.ask_verts_of(1);
                let nverts = self.nverts();
                let mut a2ab = Vec::with_capacity(nverts + 1);
                a2ab.push(0 as Lo);
                let mut ab2b = Vec::with_capacity(v2e.ab2b.len());
                for v in 0..nverts {
                    let mut row: Vec<Lo> = v2e
                        .row(v)
                        .iter()
                        .map(|&e| {
                            let verts = &ev2v[e as usize * 2..e as usize * 2 + 2];
                            if verts[0] as usize == v {
                                verts[1]
                            } else {
                                verts[0]
                            }
                        })
                        .collect();
                    row.sort_unstable();
                    ab2b.extend_from_slice(&row);
                    a2ab.push(ab2b.len() as Lo);
                }
                Arc::new(Graph { a2ab, ab2b })
            })
            .clone()
    }

    /// Element dual graph across shared sides.
    pub fn ask_dual(&self) -> Arc<Graph> {
        self.caches
            .dual
            .get_or_init(|| {
                let sides2cells = self.ask_up(self.dim - 1, self.dim);
                Arc::new(derive_dual(&sides2cells, self.nelems()))
            })
            .clone()
    }

    /// Owner references at dimension `d`.
    pub fn ask_owners(&self, d: usize) -> &Remotes {
        &self.ents[d].remotes
    }

    /// Replace owner references at dimension `d`.
    pub fn set_owners(&mut self, d: usize, remotes: Remotes) {
        debug_assert_eq!(remotes.len(), self.nents(d));
        self.ents[d].remotes = remotes;
    }

    /// Global ids at dimension `d`: the `"global"` tag when present,
    /// otherwise the local numbering.
    pub fn globals(&self, d: usize) -> Vec<Go> {
        if let Ok(g) = self.get_array::<i64>(d, "global") {
            return g.iter().map(|&x| x as Go).collect();
        }
        (0..self.nents(d) as Go).collect()
    }

    /// True when every owned entity at dimension `d` can see all its upward
    /// adjacency. Trivially true in serial; ghosted partitions must arrange
    /// it before star-based kernels run.
    pub fn owners_have_all_upward(&self, _d: usize) -> bool {
        if self.comm.is_serial() {
            return true;
        }
        matches!(self.parting, Parting::Ghosted { .. })
    }

    /// A new mesh version over the same topology and tags with replaced
    /// vertex coordinates. Derived adjacency carries over unchanged.
    pub fn trial_with_coords(&self, coords: Vec<f64>) -> Result<Mesh> {
        if coords.len() != self.nverts() * self.dim {
            return Err(MeshAdaptError::ArraySizeMismatch {
                len: coords.len(),
                width: self.dim,
            });
        }
        Ok(Mesh {
            dim: self.dim,
            comm: self.comm.clone(),
            parting: self.parting,
            coords: Arc::new(coords),
            ents: self.ents.clone(),
            caches: self.caches.clone(),
        })
    }

    // --- tags ---------------------------------------------------------------

    /// True when a tag with `name` exists at dimension `d`.
    pub fn has_tag(&self, d: usize, name: &str) -> bool {
        self.ents[d].tags.iter().any(|t| t.name == name)
    }

    /// All tags at dimension `d`, in attach order.
    pub fn tags(&self, d: usize) -> &[Tag] {
        &self.ents[d].tags
    }

    /// Tag metadata by name.
    pub fn get_tag(&self, d: usize, name: &str) -> Result<&Tag> {
        self.ents[d]
            .tags
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim: d,
                name: name.into(),
            })
    }

    /// Typed view of a tag's data buffer.
    pub fn get_array<T: TagValue>(&self, d: usize, name: &str) -> Result<Arc<Vec<T>>> {
        let tag = self.get_tag(d, name)?;
        T::view(&tag.data)
            .cloned()
            .ok_or_else(|| MeshAdaptError::TagTypeMismatch {
                dim: d,
                name: name.into(),
            })
    }

    /// Attach a new tag. Fails on duplicates and on size mismatch.
    pub fn add_tag<T: TagValue>(
        &mut self,
        d: usize,
        name: &str,
        width: usize,
        xfer: XferPolicy,
        data: Vec<T>,
    ) -> Result<()> {
        if self.has_tag(d, name) {
            return Err(MeshAdaptError::DuplicateTag {
                dim: d,
                name: name.into(),
            });
        }
        let expected = self.nents(d) * width;
        if data.len() != expected {
            return Err(MeshAdaptError::TagSizeMismatch {
                name: name.into(),
                len: data.len(),
                expected,
            });
        }
        self.ents[d].tags.push(Tag {
            name: name.into(),
            width,
            xfer,
            data: T::wrap(data),
        });
        Ok(())
    }

    /// Replace the data of an existing tag (same width and policy).
    pub fn set_tag<T: TagValue>(&mut self, d: usize, name: &str, data: Vec<T>) -> Result<()> {
        let n = self.nents(d);
        let tag = self.ents[d]
            .tags
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim: d,
                name: name.into(),
            })?;
        let expected = n * tag.width;
        if data.len() != expected {
            return Err(MeshAdaptError::TagSizeMismatch {
                name: name.into(),
                len: data.len(),
                expected,
            });
        }
        tag.data = T::wrap(data);
        Ok(())
    }

    /// Detach a tag.
    pub fn remove_tag(&mut self, d: usize, name: &str) -> Result<()> {
        let tags = &mut self.ents[d].tags;
        let before = tags.len();
        tags.retain(|t| t.name != name);
        if tags.len() == before {
            return Err(MeshAdaptError::MissingTag {
                dim: d,
                name: name.into(),
            });
        }
        Ok(())
    }

    /// Attach a tag during rebuild, bypassing the duplicate check.
    pub(crate) fn push_tag(&mut self, d: usize, tag: Tag) {
        debug_assert_eq!(tag.data.len(), self.nents(d) * tag.width);
        self.ents[d].tags.push(tag);
    }

    // --- distributed array maintenance --------------------------------------

    /// Owner values broadcast to every copy at dimension `d`.
    pub fn sync_array<T: Copy>(&self, d: usize, data: &[T], width: usize) -> Result<Vec<T>> {
        sync_from_owners(self.ask_owners(d), data, width)
    }

    /// Sync a subset of entities: scatter onto the full dimension with
    /// `fill`, sync, gather the subset back.
    pub fn sync_subset_array<T: Copy + Send + Sync>(
        &self,
        d: usize,
        subset_data: &[T],
        subset2ents: &[Lo],
        fill: T,
        width: usize,
    ) -> Result<Vec<T>> {
        let full =
            crate::algs::map::map_onto(subset_data, subset2ents, self.nents(d), fill, width);
        let synced = self.sync_array(d, &full, width)?;
        Ok(unmap(subset2ents, &synced, width))
    }

    /// Copies contribute, owners reduce, all copies receive the result.
    pub fn reduce_array(
        &self,
        d: usize,
        data: &[f64],
        width: usize,
        op: OwnerReduce,
    ) -> Result<Vec<f64>> {
        reduce_to_owners(self.ask_owners(d), data, width, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::map::offset_scan;

    fn two_tris() -> Mesh {
        // unit square: (0,0) (1,0) (1,1) (0,1), split along (0,2)
        Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2, 2, 3, 0],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn derives_entity_counts() {
        let mesh = two_tris();
        assert_eq!(mesh.dim(), 2);
        assert_eq!(mesh.nverts(), 4);
        assert_eq!(mesh.nedges(), 5);
        assert_eq!(mesh.nelems(), 2);
    }

    #[test]
    fn single_triangle_adjacency() {
        let mesh = Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        assert_eq!(*mesh.ask_down(2, 0).ab2b, vec![0, 1, 2]);
        assert_eq!(*mesh.ask_down(1, 0).ab2b, vec![0, 1, 0, 2, 1, 2]);
        // the triangle's three edge uses, matched into the unique edge table
        let t2e = mesh.ask_down(2, 1);
        assert_eq!(t2e.ab2b.len(), 3);
        let star = mesh.ask_star(0);
        assert_eq!(star.a2ab, offset_scan(&[2 as Lo, 2, 2]));
        assert_eq!(star.ab2b, vec![1, 2, 0, 2, 0, 1]);
    }

    #[test]
    fn single_tet_adjacency() {
        let mesh = Mesh::serial_from_elems_and_coords(
            3,
            vec![0, 1, 2, 3],
            vec![
                0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
            ],
        )
        .unwrap();
        assert_eq!(mesh.nedges(), 6);
        assert_eq!(mesh.nents(2), 4);
        assert_eq!(*mesh.ask_down(3, 0).ab2b, vec![0, 1, 2, 3]);
        let star = mesh.ask_star(0);
        assert_eq!(star.a2ab, offset_scan(&[3 as Lo, 3, 3, 3]));
        assert_eq!(star.row(0), &[1, 2, 3]);
        // each face bounds exactly one tet
        let f2t = mesh.ask_up(2, 3);
        for f in 0..4 {
            assert_eq!(f2t.row(f).len(), 1);
        }
    }

    #[test]
    fn dual_of_two_triangles() {
        let mesh = two_tris();
        let dual = mesh.ask_dual();
        assert_eq!(dual.a2ab, vec![0, 1, 2]);
        assert_eq!(dual.ab2b, vec![1, 0]);
    }

    #[test]
    fn tags_roundtrip_and_validate() {
        let mut mesh = two_tris();
        assert!(!mesh.has_tag(0, "size"));
        mesh.add_tag(0, "size", 1, XferPolicy::Size, vec![1.0; 4]).unwrap();
        assert!(mesh.has_tag(0, "size"));
        assert_eq!(*mesh.get_array::<f64>(0, "size").unwrap(), vec![1.0; 4]);
        assert!(matches!(
            mesh.add_tag(0, "size", 1, XferPolicy::Size, vec![1.0; 4]),
            Err(MeshAdaptError::DuplicateTag { .. })
        ));
        assert!(matches!(
            mesh.add_tag(0, "short", 1, XferPolicy::DontTransfer, vec![1.0; 3]),
            Err(MeshAdaptError::TagSizeMismatch { .. })
        ));
        assert!(matches!(
            mesh.get_array::<i8>(0, "size"),
            Err(MeshAdaptError::TagTypeMismatch { .. })
        ));
        mesh.set_tag(0, "size", vec![2.0; 4]).unwrap();
        assert_eq!(*mesh.get_array::<f64>(0, "size").unwrap(), vec![2.0; 4]);
        mesh.remove_tag(0, "size").unwrap();
        assert!(matches!(
            mesh.remove_tag(0, "size"),
            Err(MeshAdaptError::MissingTag { .. })
        ));
    }

    #[test]
    fn serial_sync_and_reduce_are_identity() {
        let mesh = two_tris();
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(mesh.sync_array(1, &data, 1).unwrap(), data);
        assert_eq!(
            mesh.reduce_array(1, &data, 1, OwnerReduce::Max).unwrap(),
            data
        );
        let subset: Vec<Lo> = vec![3, 1];
        let sub = vec![9i8, 7];
        assert_eq!(
            mesh.sync_subset_array(1, &sub, &subset, 0i8, 1).unwrap(),
            sub
        );
    }

    #[test]
    fn globals_default_to_local_order() {
        let mesh = two_tris();
        assert_eq!(mesh.globals(0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn bad_inputs_rejected() {
        assert!(matches!(
            Mesh::serial_from_elems_and_coords(4, vec![], vec![]),
            Err(MeshAdaptError::UnsupportedDimension(4))
        ));
        assert!(matches!(
            Mesh::serial_from_elems_and_coords(2, vec![0, 1], vec![0.0, 0.0]),
            Err(MeshAdaptError::ArraySizeMismatch { .. })
        ));
        assert!(matches!(
            Mesh::serial_from_elems_and_coords(2, vec![0, 1, 5], vec![0.0; 6]),
            Err(MeshAdaptError::Precondition(_))
        ));
    }
}
