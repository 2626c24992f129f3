//! Structured box meshes for tests and drivers.
//!
//! `build_box_2d` splits each grid quad into two triangles along the same
//! diagonal; `build_box_3d` splits each grid cube into six tetrahedra around
//! its main diagonal. All cells come out positively oriented.

use crate::algs::communicator::CommPtr;
use crate::mesh_error::Result;
use crate::topology::mesh::Mesh;
use crate::topology::Lo;

/// Triangle mesh of an `lx` by `ly` box with `nx` by `ny` quads.
pub fn build_box_2d(comm: CommPtr, lx: f64, ly: f64, nx: usize, ny: usize) -> Result<Mesh> {
    let nvx = nx + 1;
    let mut coords = Vec::with_capacity(nvx * (ny + 1) * 2);
    for j in 0..=ny {
        for i in 0..=nx {
            coords.push(lx * i as f64 / nx as f64);
            coords.push(ly * j as f64 / ny as f64);
        }
    }
    let vid = |i: usize, j: usize| (j * nvx + i) as Lo;
    let mut ev2v = Vec::with_capacity(nx * ny * 6);
    for j in 0..ny {
        for i in 0..nx {
            let a = vid(i, j);
            let b = vid(i + 1, j);
            let c = vid(i + 1, j + 1);
            let d = vid(i, j + 1);
            ev2v.extend_from_slice(&[a, b, c]);
            ev2v.extend_from_slice(&[c, d, a]);
        }
    }
    Mesh::from_elems_and_coords(comm, 2, ev2v, coords)
}

/// The six corner cycles around a cube's main diagonal, as (dx, dy, dz)
/// offsets of the two middle vertices of each tet (v000, x, y, v111).
const CUBE_RING: [(usize, usize, usize); 6] = [
    (1, 0, 0),
    (1, 1, 0),
    (0, 1, 0),
    (0, 1, 1),
    (0, 0, 1),
    (1, 0, 1),
];

/// Tetrahedral mesh of an `lx` by `ly` by `lz` box with `nx*ny*nz` cubes.
pub fn build_box_3d(
    comm: CommPtr,
    lx: f64,
    ly: f64,
    lz: f64,
    nx: usize,
    ny: usize,
    nz: usize,
) -> Result<Mesh> {
    let nvx = nx + 1;
    let nvy = ny + 1;
    let mut coords = Vec::with_capacity(nvx * nvy * (nz + 1) * 3);
    for k in 0..=nz {
        for j in 0..=ny {
            for i in 0..=nx {
                coords.push(lx * i as f64 / nx as f64);
                coords.push(ly * j as f64 / ny as f64);
                coords.push(lz * k as f64 / nz as f64);
            }
        }
    }
    let vid = |i: usize, j: usize, k: usize| ((k * nvy + j) * nvx + i) as Lo;
    let mut ev2v = Vec::with_capacity(nx * ny * nz * 24);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let origin = vid(i, j, k);
                let apex = vid(i + 1, j + 1, k + 1);
                for r in 0..6 {
                    let (ax, ay, az) = CUBE_RING[r];
                    let (bx, by, bz) = CUBE_RING[(r + 1) % 6];
                    ev2v.extend_from_slice(&[
                        origin,
                        vid(i + ax, j + ay, k + az),
                        vid(i + bx, j + by, k + bz),
                        apex,
                    ]);
                }
            }
        }
    }
    Mesh::from_elems_and_coords(comm, 3, ev2v, coords)
}
