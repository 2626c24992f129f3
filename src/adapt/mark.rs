//! Mark propagation between entity dimensions.

use crate::algs::arrays::parallel_map;
use crate::topology::{simplex_degree, Mesh};

/// Mark every `low_dim` entity bounding a marked `high_dim` entity.
pub fn mark_down(mesh: &Mesh, high_dim: usize, low_dim: usize, high_marks: &[u8]) -> Vec<u8> {
    debug_assert!(low_dim < high_dim);
    let up = mesh.ask_up(low_dim, high_dim);
    parallel_map(mesh.nents(low_dim), |l| {
        u8::from(up.row(l).iter().any(|&h| high_marks[h as usize] != 0))
    })
}

/// Mark every `high_dim` entity bounded by a marked `low_dim` entity.
pub fn mark_up(mesh: &Mesh, low_dim: usize, high_dim: usize, low_marks: &[u8]) -> Vec<u8> {
    debug_assert!(low_dim < high_dim);
    let down = mesh.ask_down(high_dim, low_dim);
    let deg = simplex_degree(high_dim, low_dim);
    parallel_map(mesh.nents(high_dim), |h| {
        u8::from(
            down.ab2b[h * deg..(h + 1) * deg]
                .iter()
                .any(|&l| low_marks[l as usize] != 0),
        )
    })
}

/// Mark entities classified at the given model dimension.
pub fn mark_by_class_dim(mesh: &Mesh, ent_dim: usize, class_dim: i8) -> crate::mesh_error::Result<Vec<u8>> {
    let dims = mesh.get_array::<i8>(ent_dim, crate::topology::classify::CLASS_DIM)?;
    Ok(parallel_map(mesh.nents(ent_dim), |i| {
        u8::from(dims[i] == class_dim)
    }))
}

/// Mark cells below the quality floor, then dilate the marking `nlayers`
/// times across the element dual graph so a sliver's neighborhood coarsens
/// with it.
pub fn mark_sliver_layers(
    mesh: &Mesh,
    qual_floor: f64,
    nlayers: usize,
    quals: &[f64],
) -> Vec<u8> {
    let mut marks: Vec<u8> = quals.iter().map(|&q| u8::from(q < qual_floor)).collect();
    let dual = mesh.ask_dual();
    for _ in 0..nlayers {
        let prev = marks.clone();
        marks = parallel_map(mesh.nelems(), |e| {
            u8::from(prev[e] != 0 || dual.row(e).iter().any(|&o| prev[o as usize] != 0))
        });
    }
    marks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::build_box_2d;

    #[test]
    fn up_and_down_marks() {
        let mesh = crate::topology::Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2, 2, 3, 0],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
        .unwrap();
        // mark only the first triangle; all of its verts go down
        let vert_marks = mark_down(&mesh, 2, 0, &[1, 0]);
        assert_eq!(vert_marks, vec![1, 1, 1, 0]);
        // one marked vertex pulls up both adjacent triangles
        let cell_marks = mark_up(&mesh, 0, 2, &[1, 0, 0, 0]);
        assert_eq!(cell_marks, vec![1, 1]);
        let cell_marks = mark_up(&mesh, 0, 2, &[0, 1, 0, 0]);
        assert_eq!(cell_marks, vec![1, 0]);
    }

    #[test]
    fn sliver_layers_dilate() {
        let mesh = build_box_2d(NoComm::world(), 1.0, 1.0, 4, 1).unwrap();
        let mut quals = vec![1.0; mesh.nelems()];
        quals[0] = 0.01;
        let l0 = mark_sliver_layers(&mesh, 0.1, 0, &quals);
        assert_eq!(l0.iter().map(|&m| m as usize).sum::<usize>(), 1);
        let l1 = mark_sliver_layers(&mesh, 0.1, 1, &quals);
        let l2 = mark_sliver_layers(&mesh, 0.1, 2, &quals);
        let c1 = l1.iter().map(|&m| m as usize).sum::<usize>();
        let c2 = l2.iter().map(|&m| m as usize).sum::<usize>();
        assert!(c1 > 1);
        assert!(c2 > c1);
        // dilation never unmarks
        for e in 0..mesh.nelems() {
            assert!(l2[e] >= l1[e] && l1[e] >= l0[e]);
        }
    }
}
