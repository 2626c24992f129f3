use mesh_adapt::metric::field::{
    edge_lengths, element_qualities, element_sizes, limit_metric_gradation,
    metric_scalar_for_nelems, scale_metrics,
};
use mesh_adapt::metric::{compose_metric, sym_dofs};
use mesh_adapt::prelude::*;

fn classified_sized_box(n: usize, size: f64) -> Mesh {
    let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, n, n).unwrap();
    classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
    let nverts = mesh.nverts();
    mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![size; nverts])
        .unwrap();
    mesh
}

fn assert_valid(mesh: &Mesh, opts: &AdaptOpts) {
    for s in element_sizes(mesh) {
        assert!(s > 0.0, "all cells must stay positively oriented");
    }
    let lengths = edge_lengths(mesh).unwrap();
    for &l in &lengths {
        assert!(
            l <= opts.max_length_allowed,
            "edge length {l} above the emergency ceiling"
        );
    }
    let total: f64 = element_sizes(mesh).iter().sum();
    assert!((total - 1.0).abs() < 1e-9, "domain area must be preserved");
}

#[test]
fn isotropic_refinement_to_size() {
    let mut mesh = classified_sized_box(2, 0.3);
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.2;
    let before = mesh.nelems();
    assert!(adapt(&mut mesh, &opts).unwrap());
    assert!(mesh.nelems() > before, "a finer size field must add elements");
    assert_valid(&mesh, &opts);
}

#[test]
fn isotropic_coarsening_to_size() {
    let mut mesh = classified_sized_box(8, 0.6);
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.15;
    let before = mesh.nelems();
    assert!(adapt(&mut mesh, &opts).unwrap());
    assert!(mesh.nelems() < before, "a coarser size field must drop elements");
    assert_valid(&mesh, &opts);
}

/// Linear solution fields ride through every operator exactly: splits
/// average edge endpoints, collapses keep survivors, swaps touch no vertex.
#[test]
fn linear_field_transfers_exactly() {
    let mut mesh = classified_sized_box(3, 0.15);
    let u: Vec<f64> = (0..mesh.nverts())
        .map(|v| {
            let x = mesh.vert_coords(v);
            3.0 * x[0] - x[1] + 0.25
        })
        .collect();
    mesh.add_tag(VERT, "u", 1, XferPolicy::LinearInterp, u).unwrap();
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.2;
    adapt(&mut mesh, &opts).unwrap();
    let u = mesh.get_array::<f64>(VERT, "u").unwrap();
    for v in 0..mesh.nverts() {
        let x = mesh.vert_coords(v);
        let want = 3.0 * x[0] - x[1] + 0.25;
        assert!(
            (u[v] - want).abs() < 1e-9,
            "vertex {v}: transferred {} want {want}",
            u[v]
        );
    }
}

#[test]
fn anisotropic_metric_drives_directional_refinement() {
    let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 4).unwrap();
    classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
    // ask for fine resolution across y, coarse along x
    let m = compose_metric(&[[1.0, 0.0], [0.0, 1.0]], [0.5, 0.125]);
    let one = mesh_adapt::geometry::symm_to_vec(&m);
    let nverts = mesh.nverts();
    let buf: Vec<f64> = (0..nverts).flat_map(|_| one.clone()).collect();
    mesh.add_tag(VERT, "metric", sym_dofs(2), XferPolicy::Metric, buf)
        .unwrap();
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.1;
    adapt(&mut mesh, &opts).unwrap();
    for s in element_sizes(&mesh) {
        assert!(s > 0.0);
    }
    // anisotropy shows up as more resolution in y than in x: count edges
    // mostly aligned with each axis
    let ev2v = mesh.ask_verts_of(EDGE);
    let mut x_aligned = 0usize;
    let mut y_aligned = 0usize;
    for e in 0..mesh.nedges() {
        let a = mesh.vert_coords(ev2v[e * 2] as usize);
        let b = mesh.vert_coords(ev2v[e * 2 + 1] as usize);
        let (dx, dy) = ((b[0] - a[0]).abs(), (b[1] - a[1]).abs());
        if dx > 2.0 * dy {
            x_aligned += 1;
        } else if dy > 2.0 * dx {
            y_aligned += 1;
        }
    }
    assert!(
        y_aligned > x_aligned,
        "y-fine metric should produce more y-aligned short edges ({y_aligned} vs {x_aligned})"
    );
}

/// The full size-field service pipeline: implied metric, gradation
/// limiting, scaling to a target count, then adaptation under the result.
#[test]
fn graded_scaled_metric_pipeline() {
    let mut mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 4).unwrap();
    classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0).unwrap();
    let implied = find_implied_metric(&mesh).unwrap();
    // request roughly four times the elements
    let target = 4.0 * mesh.nelems() as f64;
    let scal = metric_scalar_for_nelems(&mesh, &implied, target).unwrap();
    assert!(scal > 1.0);
    let scaled = scale_metrics(&implied, scal);
    let graded = limit_metric_gradation(&mesh, scaled, 1.5).unwrap();
    mesh.add_tag(VERT, "metric", sym_dofs(2), XferPolicy::Metric, graded)
        .unwrap();
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.2;
    let before = mesh.nelems();
    adapt(&mut mesh, &opts).unwrap();
    assert!(mesh.nelems() > 2 * before);
    for s in element_sizes(&mesh) {
        assert!(s > 0.0);
    }
}

#[test]
fn quality_floor_honored_by_all_passes() {
    let mut mesh = classified_sized_box(4, 0.2);
    let mut opts = AdaptOpts::new(2);
    opts.verbosity = Verbosity::None;
    opts.min_quality_allowed = 0.25;
    adapt(&mut mesh, &opts).unwrap();
    let quals = element_qualities(&mesh).unwrap();
    let worst = quals.iter().cloned().fold(f64::INFINITY, f64::min);
    assert!(
        worst >= opts.min_quality_allowed - 1e-12,
        "worst quality {worst} below the floor"
    );
}
