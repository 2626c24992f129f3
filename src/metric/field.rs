//! Size-field services over a whole mesh: interpolation buffers, projection
//! between entity dimensions, gradation limiting, and scaling a metric field
//! to a target element count.

use crate::algs::arrays::{are_close_arrays, parallel_fill, parallel_map};
use crate::algs::communicator::{allreduce_real, ReduceOp};
use crate::geometry::quality::{all_metric_qualities, all_real_qualities};
use crate::geometry::{
    element_size, gather_vectors, get_symm, norm, set_symm, sub_v, sym_dofs, Matrix,
};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::metric::{
    average_metrics, delinearize_metric, element_implied_metric, intersect_metrics,
    iso_edge_length, linearize_metric, metric_edge_length, metric_from_hessian,
    metric_size_factor, unit_simplex_size,
};
use crate::topology::{Lo, Mesh, VERT};

/// Iteration cap for the fixed-point loops in this module; exceeding it logs
/// a warning and keeps the best iterate.
const MAX_FIXED_POINT_ITERS: usize = 100;

fn check_symm_buffer(dim: usize, buf: &[f64]) -> Result<usize> {
    let w = sym_dofs(dim);
    if buf.len() % w != 0 {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: buf.len(),
            width: w,
        });
    }
    Ok(buf.len() / w)
}

fn linearize_metrics_dim<const D: usize>(metrics: &[f64]) -> Result<Vec<f64>> {
    let w = sym_dofs(D);
    let n = metrics.len() / w;
    // validate up front so the parallel kernel stays infallible
    for i in 0..n {
        crate::metric::linearize_metric(&get_symm::<D>(metrics, i))?;
    }
    Ok(parallel_fill(n, w, 0.0, |i, out| {
        let m = get_symm::<D>(metrics, i);
        let lm = linearize_metric(&m).expect("validated above");
        set_symm::<D>(out, 0, &lm);
    }))
}

fn delinearize_metrics_dim<const D: usize>(lms: &[f64]) -> Vec<f64> {
    let w = sym_dofs(D);
    let n = lms.len() / w;
    parallel_fill(n, w, 0.0, |i, out| {
        let m = delinearize_metric(&get_symm::<D>(lms, i));
        set_symm::<D>(out, 0, &m);
    })
}

/// Elementwise symmetric log over a packed metric buffer.
pub fn linearize_metrics(dim: usize, metrics: &[f64]) -> Result<Vec<f64>> {
    check_symm_buffer(dim, metrics)?;
    match dim {
        2 => linearize_metrics_dim::<2>(metrics),
        3 => linearize_metrics_dim::<3>(metrics),
        d => Err(MeshAdaptError::UnsupportedDimension(d)),
    }
}

/// Elementwise symmetric exp over a packed log-metric buffer.
pub fn delinearize_metrics(dim: usize, lms: &[f64]) -> Result<Vec<f64>> {
    check_symm_buffer(dim, lms)?;
    match dim {
        2 => Ok(delinearize_metrics_dim::<2>(lms)),
        3 => Ok(delinearize_metrics_dim::<3>(lms)),
        d => Err(MeshAdaptError::UnsupportedDimension(d)),
    }
}

/// Pointwise log-domain interpolation of two metric buffers.
pub fn interpolate_between_metrics(
    dim: usize,
    a: &[f64],
    b: &[f64],
    t: f64,
) -> Result<Vec<f64>> {
    let log_a = linearize_metrics(dim, a)?;
    let log_b = linearize_metrics(dim, b)?;
    let log_c = crate::algs::arrays::interpolate_between(&log_a, &log_b, t);
    delinearize_metrics(dim, &log_c)
}

/// Uniformly scale a metric buffer (`s * M`, shrinking desired lengths by
/// `1/sqrt(s)`).
pub fn scale_metrics(metrics: &[f64], s: f64) -> Vec<f64> {
    parallel_map(metrics.len(), |i| metrics[i] * s)
}

fn mident_dim<const D: usize, const N: usize>(
    entv2v: &[Lo],
    entities: &[Lo],
    v2m: &[f64],
) -> Vec<f64> {
    let w = sym_dofs(D);
    parallel_fill(entities.len(), w, 0.0, |i, out| {
        let e = entities[i] as usize;
        let verts = &entv2v[e * N..(e + 1) * N];
        let ms = crate::metric::gather_metrics::<D, N>(v2m, verts);
        set_symm::<D>(out, 0, &average_metrics(&ms));
    })
}

/// Entity-center metrics: gather vertex metrics of each listed entity,
/// average in the log domain.
pub fn get_mident_metrics(
    mesh: &Mesh,
    ent_dim: usize,
    entities: &[Lo],
    v2m: &[f64],
) -> Result<Vec<f64>> {
    let entv2v = mesh.ask_verts_of(ent_dim);
    match (mesh.dim(), ent_dim) {
        (2, 1) => Ok(mident_dim::<2, 2>(&entv2v, entities, v2m)),
        (2, 2) => Ok(mident_dim::<2, 3>(&entv2v, entities, v2m)),
        (3, 1) => Ok(mident_dim::<3, 2>(&entv2v, entities, v2m)),
        (3, 3) => Ok(mident_dim::<3, 4>(&entv2v, entities, v2m)),
        (d, e) => Err(MeshAdaptError::Precondition(format!(
            "no center metrics for entity dimension {e} in a {d}d mesh"
        ))),
    }
}

fn element_sizes_dim<const D: usize, const N: usize>(ev2v: &[Lo], coords: &[f64]) -> Vec<f64> {
    parallel_map(ev2v.len() / N, |e| {
        let p = gather_vectors::<D, N>(coords, &ev2v[e * N..(e + 1) * N]);
        element_size::<D, N>(&p)
    })
}

/// Signed element measures.
pub fn element_sizes(mesh: &Mesh) -> Vec<f64> {
    let ev2v = mesh.ask_verts_of(mesh.dim());
    match mesh.dim() {
        2 => element_sizes_dim::<2, 3>(&ev2v, mesh.coords()),
        _ => element_sizes_dim::<3, 4>(&ev2v, mesh.coords()),
    }
}

/// Average per-element data onto vertices, weighted by element measure.
pub fn project_by_average(mesh: &Mesh, e_data: &[f64], width: usize) -> Result<Vec<f64>> {
    if e_data.len() != mesh.nelems() * width {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: e_data.len(),
            width,
        });
    }
    if !mesh.owners_have_all_upward(VERT) {
        return Err(MeshAdaptError::Precondition(
            "projection requires owners to see all upward adjacency".into(),
        ));
    }
    let v2e = mesh.ask_up(0, mesh.dim());
    let sizes = element_sizes(mesh);
    let out = parallel_fill(mesh.nverts(), width, 0.0, |v, chunk| {
        let mut total = 0.0;
        for &e in v2e.row(v) {
            let w = sizes[e as usize].abs();
            total += w;
            for k in 0..width {
                chunk[k] += w * e_data[e as usize * width + k];
            }
        }
        if total > 0.0 {
            for x in chunk {
                *x /= total;
            }
        }
    });
    mesh.sync_array(VERT, &out, width)
}

/// Project element metrics to vertices through the log domain.
pub fn project_metrics(mesh: &Mesh, e2m: &[f64]) -> Result<Vec<f64>> {
    let e_linear = linearize_metrics(mesh.dim(), e2m)?;
    let v_linear = project_by_average(mesh, &e_linear, sym_dofs(mesh.dim()))?;
    delinearize_metrics(mesh.dim(), &v_linear)
}

/// One smoothing sweep of a vertex metric field: element centers, then back
/// to vertices.
pub fn smooth_metric_once(mesh: &Mesh, v2m: &[f64]) -> Result<Vec<f64>> {
    let all_elems: Vec<Lo> = (0..mesh.nelems() as Lo).collect();
    let e2m = get_mident_metrics(mesh, mesh.dim(), &all_elems, v2m)?;
    project_metrics(mesh, &e2m)
}

/// Unweighted average of vertex data onto the listed entities.
pub fn average_field(
    mesh: &Mesh,
    ent_dim: usize,
    entities: &[Lo],
    width: usize,
    v2x: &[f64],
) -> Vec<f64> {
    let entv2v = mesh.ask_verts_of(ent_dim);
    let nev = ent_dim + 1;
    parallel_fill(entities.len(), width, 0.0, |i, chunk| {
        let e = entities[i] as usize;
        for &v in &entv2v[e * nev..(e + 1) * nev] {
            for k in 0..width {
                chunk[k] += v2x[v as usize * width + k];
            }
        }
        for x in chunk {
            *x /= nev as f64;
        }
    })
}

/// Weaken a neighbor's metric by the gradation bound at distance `dist`:
/// each eigenvalue becomes `l / (1 + l * dist * log_rate)^2`.
pub fn form_limiting_metric<const D: usize>(
    m: &Matrix<D>,
    dist: f64,
    log_rate: f64,
) -> Matrix<D> {
    let d = crate::geometry::eigen::decompose_eigen(m);
    let l: [f64; D] = std::array::from_fn(|i| {
        let f = 1.0 + d.l[i] * dist * log_rate;
        d.l[i] / (f * f)
    });
    crate::geometry::eigen::compose_ortho(&d.q, &l)
}

fn limit_once_dim<const D: usize>(mesh: &Mesh, metrics: &[f64], log_rate: f64) -> Result<Vec<f64>> {
    let star = mesh.ask_star(VERT);
    let coords = mesh.coords();
    let w = sym_dofs(D);
    // validate before the infallible kernel
    for v in 0..mesh.nverts() {
        linearize_metric(&get_symm::<D>(metrics, v))?;
    }
    let out = parallel_fill(mesh.nverts(), w, 0.0, |v, chunk| {
        let mut m = get_symm::<D>(metrics, v);
        let x: [f64; D] = std::array::from_fn(|i| coords[v * D + i]);
        for &av in star.row(v) {
            let am = get_symm::<D>(metrics, av as usize);
            let ax: [f64; D] = std::array::from_fn(|i| coords[av as usize * D + i]);
            let limit = form_limiting_metric(&am, norm(sub_v(ax, x)), log_rate);
            // an extreme-conditioning failure keeps the current metric
            if let Ok(tighter) = intersect_metrics(&m, &limit) {
                m = tighter;
            }
        }
        set_symm::<D>(chunk, 0, &m);
    });
    mesh.sync_array(VERT, &out, w)
}

/// Bound the spatial growth of a vertex metric field: every vertex metric is
/// intersected with its neighbors' limiting metrics until a full sweep is a
/// fixed point across all ranks. `max_rate >= 1` bounds growth per unit
/// distance.
pub fn limit_metric_gradation(mesh: &Mesh, metrics: Vec<f64>, max_rate: f64) -> Result<Vec<f64>> {
    if max_rate < 1.0 {
        return Err(MeshAdaptError::InvalidOptions(format!(
            "gradation rate {max_rate} must be >= 1"
        )));
    }
    if !mesh.owners_have_all_upward(VERT) {
        return Err(MeshAdaptError::Precondition(
            "gradation limiting requires owners to see all upward adjacency".into(),
        ));
    }
    if check_symm_buffer(mesh.dim(), &metrics)? != mesh.nverts() {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: metrics.len(),
            width: sym_dofs(mesh.dim()),
        });
    }
    let log_rate = max_rate.ln();
    let mut current = metrics;
    for _ in 0..MAX_FIXED_POINT_ITERS {
        let next = match mesh.dim() {
            2 => limit_once_dim::<2>(mesh, &current, log_rate)?,
            _ => limit_once_dim::<3>(mesh, &current, log_rate)?,
        };
        let done = mesh
            .comm()
            .reduce_and(are_close_arrays(&current, &next));
        current = next;
        if done {
            return Ok(current);
        }
    }
    log::warn!(
        "gradation limiting hit the {MAX_FIXED_POINT_ITERS}-sweep cap; keeping the last iterate"
    );
    Ok(current)
}

/// Expected element count of the mesh under a vertex metric field: metric
/// volume divided by the unit-edge simplex volume.
pub fn expected_nelems(mesh: &Mesh, v2m: &[f64]) -> Result<f64> {
    let dim = mesh.dim();
    let all_elems: Vec<Lo> = (0..mesh.nelems() as Lo).collect();
    let e2m = get_mident_metrics(mesh, dim, &all_elems, v2m)?;
    let sizes = element_sizes(mesh);
    debug_assert_eq!(e2m.len(), mesh.nelems() * sym_dofs(dim));
    let local: f64 = (0..mesh.nelems())
        .map(|e| {
            let factor = match dim {
                2 => metric_size_factor(&get_symm::<2>(&e2m, e)),
                _ => metric_size_factor(&get_symm::<3>(&e2m, e)),
            };
            sizes[e].abs() * factor
        })
        .sum();
    let total = allreduce_real(mesh.comm().as_ref(), local, ReduceOp::Sum);
    Ok(total / unit_simplex_size(dim))
}

/// Scalar `s` such that the metric field `s * M` is expected to produce
/// `target_nelems` elements.
pub fn metric_scalar_for_nelems(mesh: &Mesh, v2m: &[f64], target_nelems: f64) -> Result<f64> {
    if target_nelems <= 0.0 {
        return Err(MeshAdaptError::InvalidOptions(format!(
            "target element count {target_nelems} must be positive"
        )));
    }
    let estimate = expected_nelems(mesh, v2m)?;
    Ok((target_nelems / estimate).powf(2.0 / mesh.dim() as f64))
}

/// Scalar multiplier for an isotropic size field targeting `target_nelems`
/// elements (`h / sqrt(s)` per vertex).
pub fn size_scalar_for_nelems(mesh: &Mesh, v2h: &[f64], target_nelems: f64) -> Result<f64> {
    let metrics = metrics_from_sizes(mesh.dim(), v2h)?;
    metric_scalar_for_nelems(mesh, &metrics, target_nelems)
}

/// Isotropic sizes expanded to packed metric tensors `diag(1/h^2)`.
pub fn metrics_from_sizes(dim: usize, v2h: &[f64]) -> Result<Vec<f64>> {
    if let Some(&h) = v2h.iter().find(|&&h| h <= 0.0) {
        return Err(MeshAdaptError::NonPositiveSize(h));
    }
    let w = sym_dofs(dim);
    Ok(parallel_fill(v2h.len(), w, 0.0, |v, chunk| {
        let l = 1.0 / (v2h[v] * v2h[v]);
        for k in 0..dim {
            chunk[k] = l;
        }
    }))
}

/// Build a metric field from Hessians and rescale it until the expected
/// element count hits `target_nelems` within `tolerance`. The estimator is
/// close to linear in `s^{dim/2}`, so a handful of iterations suffice; the
/// loop is capped and keeps the best iterate on non-convergence.
pub fn metric_for_nelems_from_hessians(
    mesh: &Mesh,
    target_nelems: f64,
    tolerance: f64,
    hessians: &[f64],
    h_min: f64,
    h_max: f64,
) -> Result<Vec<f64>> {
    if tolerance <= 0.0 || target_nelems <= 0.0 || h_min <= 0.0 || h_min > h_max {
        return Err(MeshAdaptError::InvalidOptions(
            "target metric parameters must be positive with h_min <= h_max".into(),
        ));
    }
    let nverts = check_symm_buffer(mesh.dim(), hessians)?;
    if nverts != mesh.nverts() {
        return Err(MeshAdaptError::ArraySizeMismatch {
            len: hessians.len(),
            width: sym_dofs(mesh.dim()),
        });
    }
    let mut eps = 1.0;
    let mut metric = Vec::new();
    for niters in 1..=10 {
        metric = hessian_metrics(mesh.dim(), hessians, eps, h_min, h_max)?;
        let scalar = metric_scalar_for_nelems(mesh, &metric, target_nelems)?;
        if (scalar - 1.0).abs() <= tolerance {
            if mesh.comm().rank() == 0 {
                log::info!(
                    "metric targets {target_nelems}*{scalar:.4} elements after {niters} iterations"
                );
            }
            return Ok(metric);
        }
        eps /= scalar;
    }
    log::warn!("target element count solve did not converge; keeping the last iterate");
    Ok(metric)
}

/// Elementwise Hessian-to-metric map over a packed buffer.
pub fn hessian_metrics(
    dim: usize,
    hessians: &[f64],
    eps: f64,
    h_min: f64,
    h_max: f64,
) -> Result<Vec<f64>> {
    let n = check_symm_buffer(dim, hessians)?;
    let w = sym_dofs(dim);
    Ok(match dim {
        2 => parallel_fill(n, w, 0.0, |i, out| {
            let m = metric_from_hessian(&get_symm::<2>(hessians, i), eps, h_min, h_max);
            set_symm::<2>(out, 0, &m);
        }),
        _ => parallel_fill(n, w, 0.0, |i, out| {
            let m = metric_from_hessian(&get_symm::<3>(hessians, i), eps, h_min, h_max);
            set_symm::<3>(out, 0, &m);
        }),
    })
}

fn implied_metrics_dim<const D: usize, const N: usize>(
    ev2v: &[Lo],
    coords: &[f64],
) -> Result<Vec<f64>> {
    let n = ev2v.len() / N;
    let w = sym_dofs(D);
    let mut out = vec![0.0; n * w];
    for e in 0..n {
        let p = gather_vectors::<D, N>(coords, &ev2v[e * N..(e + 1) * N]);
        let m = element_implied_metric::<D, N>(&p)?;
        set_symm::<D>(&mut out[e * w..(e + 1) * w], 0, &m);
    }
    Ok(out)
}

/// The metric field implied by the current element shapes, projected to
/// vertices.
pub fn find_implied_metric(mesh: &Mesh) -> Result<Vec<f64>> {
    let ev2v = mesh.ask_verts_of(mesh.dim());
    let e2m = match mesh.dim() {
        2 => implied_metrics_dim::<2, 3>(&ev2v, mesh.coords())?,
        _ => implied_metrics_dim::<3, 4>(&ev2v, mesh.coords())?,
    };
    project_metrics(mesh, &e2m)
}

/// The isotropic size field implied by current element measures, projected
/// to vertices.
pub fn find_implied_size(mesh: &Mesh) -> Result<Vec<f64>> {
    let dim = mesh.dim();
    let sizes = element_sizes(mesh);
    let e2h: Vec<f64> = sizes
        .iter()
        .map(|s| (s.abs() / unit_simplex_size(dim)).powf(1.0 / dim as f64))
        .collect();
    project_by_average(mesh, &e2h, 1)
}

enum SizeField {
    Metric(std::sync::Arc<Vec<f64>>),
    Iso(std::sync::Arc<Vec<f64>>),
    Unit,
}

/// Measures the size-field length of any vertex pair, existing edge or not.
/// The `"metric"` tag wins, then `"size"`, then plain Euclidean length.
pub struct EdgeLengthMeasurer {
    dim: usize,
    coords: std::sync::Arc<Vec<f64>>,
    field: SizeField,
}

impl EdgeLengthMeasurer {
    pub fn open(mesh: &Mesh) -> Result<EdgeLengthMeasurer> {
        let field = if mesh.has_tag(VERT, "metric") {
            SizeField::Metric(mesh.get_array::<f64>(VERT, "metric")?)
        } else if mesh.has_tag(VERT, "size") {
            SizeField::Iso(mesh.get_array::<f64>(VERT, "size")?)
        } else {
            SizeField::Unit
        };
        Ok(EdgeLengthMeasurer {
            dim: mesh.dim(),
            coords: std::sync::Arc::clone(mesh.coords()),
            field,
        })
    }

    fn pos<const D: usize>(&self, v: Lo) -> [f64; D] {
        std::array::from_fn(|d| self.coords[v as usize * D + d])
    }

    fn measure_dim<const D: usize>(&self, a: Lo, b: Lo) -> f64 {
        let pa = self.pos::<D>(a);
        let pb = self.pos::<D>(b);
        match &self.field {
            SizeField::Metric(v2m) => metric_edge_length::<D>(
                pa,
                pb,
                &get_symm::<D>(v2m, a as usize),
                &get_symm::<D>(v2m, b as usize),
            ),
            SizeField::Iso(v2h) => {
                iso_edge_length::<D>(pa, pb, v2h[a as usize], v2h[b as usize])
            }
            SizeField::Unit => norm(sub_v(pb, pa)),
        }
    }

    /// Length of the segment between two vertices under the size field.
    pub fn measure(&self, a: Lo, b: Lo) -> f64 {
        match self.dim {
            2 => self.measure_dim::<2>(a, b),
            _ => self.measure_dim::<3>(a, b),
        }
    }
}

/// Edge lengths under the attached size field.
pub fn edge_lengths(mesh: &Mesh) -> Result<Vec<f64>> {
    let measurer = EdgeLengthMeasurer::open(mesh)?;
    let ev2v = mesh.ask_verts_of(1);
    Ok(parallel_map(mesh.nedges(), |e| {
        measurer.measure(ev2v[e * 2], ev2v[e * 2 + 1])
    }))
}

/// Element qualities under the attached size field: metric tensors win,
/// isotropic sizes expand to diagonal tensors, otherwise plain coordinates.
pub fn element_qualities(mesh: &Mesh) -> Result<Vec<f64>> {
    let ev2v = mesh.ask_verts_of(mesh.dim());
    let coords = mesh.coords();
    let v2m = if mesh.has_tag(VERT, "metric") {
        Some(mesh.get_array::<f64>(VERT, "metric")?.as_ref().clone())
    } else if mesh.has_tag(VERT, "size") {
        let sizes = mesh.get_array::<f64>(VERT, "size")?;
        Some(metrics_from_sizes(mesh.dim(), &sizes)?)
    } else {
        None
    };
    Ok(match (mesh.dim(), v2m) {
        (2, Some(m)) => all_metric_qualities::<2, 3>(&ev2v, coords, &m),
        (_, Some(m)) => all_metric_qualities::<3, 4>(&ev2v, coords, &m),
        (2, None) => all_real_qualities::<2, 3>(&ev2v, coords),
        (_, None) => all_real_qualities::<3, 4>(&ev2v, coords),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::arrays::repeat_pattern;
    use crate::algs::communicator::NoComm;
    use crate::geometry::identity_matrix;
    use crate::metric::compose_metric;
    use crate::topology::build::{build_box_2d, build_box_3d};
    use approx::assert_relative_eq;

    #[test]
    fn linearize_roundtrip_on_buffer() {
        let m = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.3, 3.0]);
        let buf = repeat_pattern(4, &crate::geometry::symm_to_vec(&m));
        let lin = linearize_metrics(2, &buf).unwrap();
        let back = delinearize_metrics(2, &lin).unwrap();
        for (a, b) in buf.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn interpolation_buffer_endpoints() {
        let a = repeat_pattern(
            4,
            &crate::geometry::symm_to_vec(&compose_metric(
                &[[1.0, 0.0], [0.0, 1.0]],
                [0.01, 1.0],
            )),
        );
        let b = repeat_pattern(
            4,
            &crate::geometry::symm_to_vec(&compose_metric(
                &[[1.0, 0.0], [0.0, 1.0]],
                [1.0, 1.0],
            )),
        );
        let c = interpolate_between_metrics(2, &a, &b, 0.0).unwrap();
        for (x, y) in a.iter().zip(c.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-10);
        }
        let c = interpolate_between_metrics(2, &a, &b, 1.0).unwrap();
        for (x, y) in b.iter().zip(c.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-10);
        }
    }

    #[test]
    fn identity_metric_lengths_are_euclidean() {
        let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 1, 1).unwrap();
        let real: Vec<f64> = edge_lengths(&mesh).unwrap();
        let ident = repeat_pattern(
            mesh.nverts(),
            &crate::geometry::symm_to_vec(&identity_matrix::<2>()),
        );
        mesh.add_tag(VERT, "metric", sym_dofs(2), crate::topology::XferPolicy::Metric, ident)
            .unwrap();
        let metric: Vec<f64> = edge_lengths(&mesh).unwrap();
        for (a, b) in real.iter().zip(metric.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn implied_metric_scales_to_current_nelems() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 4).unwrap();
        let metric = find_implied_metric(&mesh).unwrap();
        let scal = metric_scalar_for_nelems(&mesh, &metric, mesh.nelems() as f64).unwrap();
        assert_relative_eq!(scal, 1.0, max_relative = 0.05);

        let size = find_implied_size(&mesh).unwrap();
        let scal = size_scalar_for_nelems(&mesh, &size, mesh.nelems() as f64).unwrap();
        assert_relative_eq!(scal, 1.0, max_relative = 0.05);
    }

    #[test]
    fn implied_size_is_positive_3d() {
        let mesh = build_box_3d(NoComm::world(), 1.0, 1.0, 1.0, 2, 2, 2).unwrap();
        let size = find_implied_size(&mesh).unwrap();
        assert_eq!(size.len(), mesh.nverts());
        assert!(size.iter().all(|&h| h > 0.0));
    }

    #[test]
    fn scaling_halves_expected_lengths() {
        // doubling the metric multiplies expected element count by 2^{dim/2}
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        let metric = find_implied_metric(&mesh).unwrap();
        let base = expected_nelems(&mesh, &metric).unwrap();
        let doubled = expected_nelems(&mesh, &scale_metrics(&metric, 2.0)).unwrap();
        assert_relative_eq!(doubled, base * 2.0, max_relative = 1e-10);
    }

    #[test]
    fn gradation_tightens_coarse_neighbors() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        // fine metric at one corner, very coarse elsewhere
        let fine = crate::geometry::symm_to_vec(&compose_metric(
            &[[1.0, 0.0], [0.0, 1.0]],
            [0.01, 0.01],
        ));
        let coarse = crate::geometry::symm_to_vec(&compose_metric(
            &[[1.0, 0.0], [0.0, 1.0]],
            [100.0, 100.0],
        ));
        let mut metrics = repeat_pattern(mesh.nverts(), &coarse);
        metrics[0..3].copy_from_slice(&fine);
        let limited = limit_metric_gradation(&mesh, metrics, 2.0).unwrap();
        // the corner keeps its fine metric
        for (a, b) in fine.iter().zip(limited[0..3].iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-6);
        }
        // neighbors got strictly tighter than the coarse request
        let m1 = get_symm::<2>(&limited, 1);
        let l1 = crate::geometry::eigen::decompose_eigen(&m1).l;
        assert!(l1.iter().all(|&l| l > 1.0 / (100.0 * 100.0)));
        // and the result is a fixed point
        let again = limit_metric_gradation(&mesh, limited.clone(), 2.0).unwrap();
        assert!(are_close_arrays(&limited, &again));
    }

    #[test]
    fn rejects_bad_gradation_rate() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 1, 1).unwrap();
        let metrics = repeat_pattern(
            mesh.nverts(),
            &crate::geometry::symm_to_vec(&identity_matrix::<2>()),
        );
        assert!(limit_metric_gradation(&mesh, metrics, 0.5).is_err());
    }

    #[test]
    fn metric_smoothing_fixes_uniform_fields() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 2, 2).unwrap();
        let m = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.5, 2.0]);
        let buf = repeat_pattern(mesh.nverts(), &crate::geometry::symm_to_vec(&m));
        let smoothed = smooth_metric_once(&mesh, &buf).unwrap();
        for (a, b) in buf.iter().zip(smoothed.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9, max_relative = 1e-9);
        }
    }

    #[test]
    fn average_field_means_vertex_values() {
        let mesh = Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2, 2, 3, 0],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
        .unwrap();
        let v2x = [2.0, 1.0, 3.0, 2.0];
        let e2x = average_field(&mesh, 2, &[0, 1], 1, &v2x);
        assert_relative_eq!(e2x[0], 2.0);
        assert_relative_eq!(e2x[1], 7.0 / 3.0);
    }
}
