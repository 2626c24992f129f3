//! Overshoot prevention for collapses.
//!
//! Collapsing one short edge stretches every other edge at the collapsing
//! endpoint. Before quality is even considered, each candidate direction
//! simulates all of its post-collapse edges under the size field and is
//! forbidden if any would reach `max_length_desired`: coarsening must not
//! create refinement work.

use crate::adapt::collapse::{collapses, dont_collapse, DONT_COLLAPSE};
use crate::adapt::AdaptOpts;
use crate::mesh_error::Result;
use crate::metric::field::EdgeLengthMeasurer;
use crate::topology::align::code_which_down;
use crate::topology::{Lo, Mesh, EDGE};

/// Clear collapse directions that would overshoot the desired edge length.
/// The result is synchronized over the candidate subset so every copy of a
/// shared edge agrees.
pub fn prevent_overshoot(
    mesh: &Mesh,
    opts: &AdaptOpts,
    cands2edges: &[Lo],
    cand_codes: &[i8],
) -> Result<Vec<i8>> {
    let max_length = opts.max_length_desired;
    let measurer = EdgeLengthMeasurer::open(mesh)?;
    let ev2v = mesh.ask_verts_of(1);
    let v2e = mesh.ask_up(0, EDGE);
    let out = crate::algs::arrays::parallel_map(cands2edges.len(), |cand| {
        let e = cands2edges[cand] as usize;
        let mut code = cand_codes[cand];
        for eev_col in 0..2 {
            if !collapses(code, eev_col) {
                continue;
            }
            let v_col = ev2v[e * 2 + eev_col];
            let v_onto = ev2v[e * 2 + (1 - eev_col)];
            let span = v2e.a2ab[v_col as usize] as usize..v2e.a2ab[v_col as usize + 1] as usize;
            for ve in span {
                let e2 = v2e.ab2b[ve] as usize;
                if e2 == e {
                    continue;
                }
                let eev_in = code_which_down(v2e.codes[ve]) as usize;
                let v_other = ev2v[e2 * 2 + (1 - eev_in)];
                if measurer.measure(v_onto, v_other) >= max_length {
                    code = dont_collapse(code, eev_col);
                    break;
                }
            }
        }
        code
    });
    mesh.sync_subset_array(EDGE, &out, cands2edges, DONT_COLLAPSE, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::collapse::COLLAPSE_BOTH;
    use crate::algs::communicator::NoComm;
    use crate::topology::build::build_box_2d;
    use crate::topology::{VERT, XferPolicy};

    /// On a strip with a tight size field, collapsing any edge doubles a
    /// neighbor beyond the desired maximum, so every direction is forbidden;
    /// with a loose field everything stays allowed.
    #[test]
    fn tight_field_forbids_all_directions() {
        let mut mesh = build_box_2d(NoComm::world(), 4.0, 1.0, 4, 1).unwrap();
        mesh.add_tag(VERT, "size", 1, XferPolicy::Size, vec![1.0; mesh.nverts()])
            .unwrap();
        let cands: Vec<Lo> = (0..mesh.nedges() as Lo).collect();
        let codes = vec![COLLAPSE_BOTH; mesh.nedges()];

        let mut opts = crate::adapt::AdaptOpts::new(2);
        opts.max_length_desired = 1.2;
        let out = prevent_overshoot(&mesh, &opts, &cands, &codes).unwrap();
        assert!(out.iter().all(|&c| c == DONT_COLLAPSE));

        opts.max_length_desired = 100.0;
        let out = prevent_overshoot(&mesh, &opts, &cands, &codes).unwrap();
        assert_eq!(out, codes);
    }
}
