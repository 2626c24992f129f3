//! The adaptation driver: operator passes, acceptance, iteration bounds.

pub mod coarsen;
pub mod collapse;
pub mod indset;
pub mod mark;
pub mod modify;
pub mod overshoot;
pub mod refine;
pub mod smooth;
pub mod swap2d;
pub mod swap3d;
pub mod transfer;

use crate::algs::communicator::{allreduce_int, allreduce_real, ReduceOp};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::metric::field::{edge_lengths, element_qualities};
use crate::topology::{Mesh, VERT};

pub use coarsen::{coarsen_by_size, coarsen_slivers};
pub use refine::refine_by_size;
pub use smooth::smooth_positions_once;
pub use swap3d::swap_edges;

/// How chatty the driver is (through the `log` facade).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    None,
    EachAdapt,
    EachRebuild,
}

/// Adaptation options; construct with [`AdaptOpts::new`] for the dimension's
/// defaults and adjust fields as needed.
#[derive(Clone, Debug)]
pub struct AdaptOpts {
    /// Edges shorter than this are coarsening candidates.
    pub min_length_desired: f64,
    /// Edges longer than this are refinement candidates; collapses may not
    /// push any edge past it.
    pub max_length_desired: f64,
    /// Hard ceiling: a returned mesh with a longer edge is a failure.
    pub max_length_allowed: f64,
    /// No operator may produce a cell below this quality.
    pub min_quality_allowed: f64,
    /// Cells below this quality are slivers: swap targets and aggressive
    /// coarsening seeds.
    pub min_quality_desired: f64,
    /// Dual-graph layers dilated around each sliver before coarsening.
    pub nsliver_layers: usize,
    /// Largest edge link loop the 3D swap will retriangulate.
    pub swap3d_max_loop_size: usize,
    /// Vertex displacement cap for smoothing; zero disables the pass.
    pub max_motion_allowed: f64,
    /// Driver iteration bound.
    pub max_iterations: usize,
    /// Load imbalance (max/avg - 1) above which the driver asks for a
    /// repartition between passes.
    pub rebalance_imbalance: f64,
    /// Logging level for pass summaries.
    pub verbosity: Verbosity,
    /// Momentum-carrying velocity field recognized for transfer policy
    /// selection (the policy itself is an external collaborator).
    pub xfer_velocity_momentum_name: Option<String>,
}

impl AdaptOpts {
    /// Defaults tuned per dimension, matching the usual mean-ratio floors.
    pub fn new(dim: usize) -> AdaptOpts {
        let (min_quality_allowed, min_quality_desired) = match dim {
            2 => (0.30, 0.40),
            _ => (0.20, 0.30),
        };
        AdaptOpts {
            min_length_desired: 1.0 / 2.0f64.sqrt(),
            max_length_desired: 2.0f64.sqrt(),
            max_length_allowed: 3.0,
            min_quality_allowed,
            min_quality_desired,
            nsliver_layers: 4,
            swap3d_max_loop_size: 7,
            max_motion_allowed: 0.0,
            max_iterations: 30,
            rebalance_imbalance: 0.10,
            verbosity: Verbosity::EachAdapt,
            xfer_velocity_momentum_name: None,
        }
    }

    /// Check internal consistency against a mesh.
    pub fn validate(&self, mesh: &Mesh) -> Result<()> {
        if self.min_length_desired <= 0.0
            || self.min_length_desired >= self.max_length_desired
        {
            return Err(MeshAdaptError::InvalidOptions(format!(
                "length band [{}, {}] is empty",
                self.min_length_desired, self.max_length_desired
            )));
        }
        if self.max_length_desired > self.max_length_allowed {
            return Err(MeshAdaptError::InvalidOptions(
                "max_length_desired exceeds max_length_allowed".into(),
            ));
        }
        // a collapse must not overshoot: twice the coarsen threshold has to
        // fit under the refine threshold
        if self.max_length_desired < 2.0 * self.min_length_desired {
            return Err(MeshAdaptError::InvalidOptions(
                "max_length_desired below twice min_length_desired thrashes".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_quality_allowed)
            || self.min_quality_allowed > self.min_quality_desired
        {
            return Err(MeshAdaptError::InvalidOptions(
                "quality floors must satisfy 0 <= allowed <= desired <= 1".into(),
            ));
        }
        if self.min_quality_desired > 1.0 {
            return Err(MeshAdaptError::InvalidOptions(
                "min_quality_desired above 1 can never be met".into(),
            ));
        }
        if !mesh.has_tag(VERT, "metric") && !mesh.has_tag(VERT, "size") {
            return Err(MeshAdaptError::MissingTag {
                dim: VERT,
                name: "metric (or size)".into(),
            });
        }
        if !mesh.has_tag(VERT, "class_dim") {
            return Err(MeshAdaptError::MissingTag {
                dim: VERT,
                name: "class_dim".into(),
            });
        }
        Ok(())
    }
}

/// Global length and quality extremes of one mesh version.
#[derive(Copy, Clone, Debug)]
pub struct AdaptSummary {
    pub min_length: f64,
    pub max_length: f64,
    pub min_quality: f64,
}

impl AdaptSummary {
    pub fn gather(mesh: &Mesh) -> Result<AdaptSummary> {
        let lengths = edge_lengths(mesh)?;
        let quals = element_qualities(mesh)?;
        let comm = mesh.comm().as_ref();
        let local_min_l = lengths.iter().cloned().fold(f64::INFINITY, f64::min);
        let local_max_l = lengths.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let local_min_q = quals.iter().cloned().fold(f64::INFINITY, f64::min);
        Ok(AdaptSummary {
            min_length: allreduce_real(comm, local_min_l, ReduceOp::Min),
            max_length: allreduce_real(comm, local_max_l, ReduceOp::Max),
            min_quality: allreduce_real(comm, local_min_q, ReduceOp::Min),
        })
    }

    /// The mesh meets the size field and quality goals.
    pub fn is_satisfied(&self, opts: &AdaptOpts) -> bool {
        self.min_length >= opts.min_length_desired
            && self.max_length <= opts.max_length_desired
            && self.min_quality >= opts.min_quality_desired
    }
}

fn log_summary(mesh: &Mesh, opts: &AdaptOpts, label: &str, summary: &AdaptSummary) {
    if opts.verbosity >= Verbosity::EachAdapt && mesh.comm().rank() == 0 {
        log::info!(
            "{label}: {} elements, lengths [{:.3}, {:.3}], min quality {:.3}",
            mesh.nelems(),
            summary.min_length,
            summary.max_length,
            summary.min_quality
        );
    }
}

/// Element-count imbalance across ranks, `max/avg - 1`.
fn load_imbalance(mesh: &Mesh) -> f64 {
    let comm = mesh.comm().as_ref();
    let local = mesh.nelems() as i64;
    let max = allreduce_int(comm, local, ReduceOp::Max) as f64;
    let sum = allreduce_int(comm, local, ReduceOp::Sum) as f64;
    let avg = sum / comm.size() as f64;
    if avg <= 0.0 {
        return 0.0;
    }
    max / avg - 1.0
}

/// Run adaptation passes until the length and quality goals hold, no
/// operator fires, or the iteration bound is reached. Returns whether any
/// pass modified the mesh. The mesh is valid after every branch; an edge
/// above `max_length_allowed` in the final mesh is a hard failure.
pub fn adapt(mesh: &mut Mesh, opts: &AdaptOpts) -> Result<bool> {
    opts.validate(mesh)?;
    let pre = AdaptSummary::gather(mesh)?;
    if pre.min_quality < opts.min_quality_allowed {
        return Err(MeshAdaptError::QualityBelowAllowed {
            found: pre.min_quality,
            allowed: opts.min_quality_allowed,
        });
    }
    log_summary(mesh, opts, "before adapting", &pre);
    if pre.is_satisfied(opts) {
        return Ok(false);
    }
    let mut modified = false;
    for _iteration in 0..opts.max_iterations {
        let mut fired = false;
        fired |= refine_by_size(mesh, opts)?;
        fired |= coarsen_by_size(mesh, opts)?;
        fired |= swap_edges(mesh, opts)?;
        fired |= coarsen_slivers(mesh, opts)?;
        if opts.max_motion_allowed > 0.0 {
            fired |= smooth_positions_once(mesh, opts)?;
        }
        modified |= fired;
        let summary = AdaptSummary::gather(mesh)?;
        if opts.verbosity >= Verbosity::EachRebuild {
            log_summary(mesh, opts, "after pass", &summary);
        }
        let imbalance = load_imbalance(mesh);
        if imbalance > opts.rebalance_imbalance && mesh.comm().size() > 1 {
            log::info!("element imbalance {imbalance:.2} exceeds threshold; repartition advised");
        }
        if summary.is_satisfied(opts) || !fired {
            break;
        }
    }
    let post = AdaptSummary::gather(mesh)?;
    log_summary(mesh, opts, "after adapting", &post);
    if post.max_length > opts.max_length_allowed {
        return Err(MeshAdaptError::LengthAboveAllowed {
            found: post.max_length,
            allowed: opts.max_length_allowed,
        });
    }
    Ok(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::build_box_2d;
    use crate::topology::classify::classify_by_angles;
    use crate::topology::XferPolicy;

    #[test]
    fn options_validate_bounds() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        let nverts = mesh.nverts();
        mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![0.5; nverts])
            .unwrap();
        assert!(AdaptOpts::new(2).validate(&mesh).is_ok());

        let mut bad = AdaptOpts::new(2);
        bad.min_length_desired = 2.0;
        assert!(bad.validate(&mesh).is_err());

        let mut bad = AdaptOpts::new(2);
        bad.max_length_allowed = 1.0;
        assert!(bad.validate(&mesh).is_err());

        let mut bad = AdaptOpts::new(2);
        bad.min_quality_allowed = 0.9;
        bad.min_quality_desired = 0.5;
        assert!(bad.validate(&mesh).is_err());
    }

    #[test]
    fn missing_size_field_is_reported() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        assert!(matches!(
            AdaptOpts::new(2).validate(&mesh),
            Err(MeshAdaptError::MissingTag { .. })
        ));
    }

    #[test]
    fn satisfied_mesh_returns_false() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 4).unwrap();
        classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
        // size equal to the grid spacing: all lengths measure ~1
        let nverts = mesh.nverts();
        mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![0.25; nverts])
            .unwrap();
        let mut opts = AdaptOpts::new(2);
        // right triangles score 0.75, diagonals measure sqrt(2)
        opts.min_quality_allowed = 0.3;
        opts.min_quality_desired = 0.5;
        opts.max_length_desired = 1.5;
        assert!(!adapt(&mut mesh, &opts).unwrap());
    }
}
