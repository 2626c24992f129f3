//! # mesh-adapt
//!
//! mesh-adapt is a parallel adaptation engine for simplicial meshes
//! (triangles in 2D, tetrahedra in 3D). It iteratively transforms a mesh to
//! satisfy a user-supplied size field (isotropic scalar sizes or anisotropic
//! symmetric positive-definite metric tensors per vertex) by applying local
//! cavity operators (edge collapse, edge split, edge swap)
//! and classification-pinned smoothing, with conflict-free operator
//! scheduling through deterministic independent sets.
//!
//! ## Subsystems
//! - `algs`: deterministic bulk primitives (scans, sorts, map inversion,
//!   Hilbert ordering, linear partitioning) and the communicator trait
//! - `topology`: flat-array mesh container, alignment codes, adjacency
//!   derivation, angle-based classification, box builders
//! - `geometry`: fixed-size vector/matrix kernels, symmetric
//!   eigendecomposition, mean-ratio element quality
//! - `metric`: metric algebra (log/exp, intersection, lengths, implied
//!   metrics), size-field services (gradation limiting, target element
//!   count), Hessian recovery
//! - `adapt`: candidate marking, cavity operators, independent-set
//!   scheduling, the shared topology rewrite with field transfer, and the
//!   adaptation driver
//!
//! ## Usage
//! Attach a `"metric"` (or `"size"`) tag and classification to a mesh, then
//! drive it:
//!
//! ```rust
//! use mesh_adapt::prelude::*;
//!
//! # fn main() -> Result<(), mesh_adapt::mesh_error::MeshAdaptError> {
//! let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 4)?;
//! classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0)?;
//! let nverts = mesh.nverts();
//! mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![0.2; nverts])?;
//! let mut opts = AdaptOpts::new(mesh.dim());
//! opts.verbosity = Verbosity::None;
//! adapt(&mut mesh, &opts)?;
//! # Ok(())
//! # }
//! ```

pub mod adapt;
pub mod algs;
pub mod geometry;
pub mod mesh_error;
pub mod metric;
pub mod topology;

/// A convenient prelude importing the most-used types and entry points.
pub mod prelude {
    pub use crate::adapt::{adapt, AdaptOpts, AdaptSummary, Verbosity};
    pub use crate::algs::communicator::{CommPtr, Communicator, NoComm, ReduceOp};
    pub use crate::mesh_error::{MeshAdaptError, Result};
    pub use crate::metric::field::{
        edge_lengths, element_qualities, find_implied_metric, find_implied_size,
        limit_metric_gradation, metric_scalar_for_nelems,
    };
    pub use crate::metric::hessian::recover_hessians;
    pub use crate::topology::build::{build_box_2d, build_box_3d};
    pub use crate::topology::classify::classify_by_angles;
    pub use crate::topology::{Mesh, XferPolicy, EDGE, TET, TRI, VERT};
}
