//! Field transfer across a topology rewrite.
//!
//! Surviving entities copy their values through the same-entity map; product
//! entities receive values from their parent according to the tag's
//! transfer policy. Metric tensors combine in the symmetric-log domain,
//! isotropic sizes by geometric mean, classification by inheritance.

use crate::geometry::{get_symm, set_symm};
use crate::mesh_error::{MeshAdaptError, Result};
use crate::metric::average_metrics;
use crate::topology::mesh::{Tag, TagData, TagValue};
use crate::topology::{Lo, Mesh, XferPolicy};

use super::modify::RewriteMaps;

/// Carry every transferable tag from `old` onto the rebuilt mesh.
pub fn transfer_tags(old: &Mesh, mut new: Mesh, maps: &RewriteMaps) -> Result<Mesh> {
    for d in 0..=old.dim() {
        for tag in old.tags(d) {
            if tag.xfer == XferPolicy::DontTransfer {
                continue;
            }
            if tag.name == "global" {
                // serial rebuild renumbers densely
                let globals: Vec<i64> = (0..new.nents(d) as i64).collect();
                new.push_tag(
                    d,
                    Tag {
                        name: tag.name.clone(),
                        width: tag.width,
                        xfer: tag.xfer,
                        data: TagData::I64(std::sync::Arc::new(globals)),
                    },
                );
                continue;
            }
            let data = match &tag.data {
                TagData::I8(v) => TagData::I8(std::sync::Arc::new(transfer_discrete(
                    old, &new, maps, d, tag, v,
                )?)),
                TagData::I32(v) => TagData::I32(std::sync::Arc::new(transfer_discrete(
                    old, &new, maps, d, tag, v,
                )?)),
                TagData::I64(v) => TagData::I64(std::sync::Arc::new(transfer_discrete(
                    old, &new, maps, d, tag, v,
                )?)),
                TagData::Real(v) => TagData::Real(std::sync::Arc::new(transfer_real(
                    old, &new, maps, d, tag, v,
                )?)),
            };
            new.push_tag(
                d,
                Tag {
                    name: tag.name.clone(),
                    width: tag.width,
                    xfer: tag.xfer,
                    data,
                },
            );
        }
    }
    Ok(new)
}

fn copy_same<T: Copy>(maps: &RewriteMaps, d: usize, width: usize, old_data: &[T], out: &mut [T]) {
    for (i, &ol) in maps.same_ents2old_ents[d].iter().enumerate() {
        let nl = maps.same_ents2new_ents[d][i] as usize;
        let ol = ol as usize;
        out[nl * width..(nl + 1) * width]
            .copy_from_slice(&old_data[ol * width..(ol + 1) * width]);
    }
}

/// Parent lookup for an inherit-style transfer: the same-named tag at the
/// parent's own dimension supplies the value.
fn parent_value<'a, T: TagValue>(
    old: &'a Mesh,
    name: &str,
    width: usize,
    parent: (usize, Lo),
) -> Result<&'a [T]> {
    let (pd, pid) = parent;
    let tag = old.get_tag(pd, name)?;
    if tag.width != width {
        return Err(MeshAdaptError::TagSizeMismatch {
            name: name.into(),
            len: tag.width,
            expected: width,
        });
    }
    let data = T::view(&tag.data).ok_or_else(|| MeshAdaptError::TagTypeMismatch {
        dim: pd,
        name: name.into(),
    })?;
    Ok(&data[pid as usize * width..(pid as usize + 1) * width])
}

/// Integer-valued tags transfer by copy and inheritance only.
fn transfer_discrete<T: TagValue + Copy + Default>(
    old: &Mesh,
    new: &Mesh,
    maps: &RewriteMaps,
    d: usize,
    tag: &Tag,
    old_data: &[T],
) -> Result<Vec<T>> {
    let width = tag.width;
    let mut out = vec![T::default(); new.nents(d) * width];
    copy_same(maps, d, width, old_data, &mut out);
    for (p, &nl) in maps.prods2new_ents[d].iter().enumerate() {
        let parent = maps.prod_parents[d][p];
        let value: &[T] = parent_value(old, &tag.name, width, parent)?;
        let nl = nl as usize;
        out[nl * width..(nl + 1) * width].copy_from_slice(value);
    }
    Ok(out)
}

fn parent_verts(old: &Mesh, parent: (usize, Lo)) -> Vec<Lo> {
    let (pd, pid) = parent;
    if pd == 0 {
        return vec![pid];
    }
    let pv2v = old.ask_verts_of(pd);
    let n = pd + 1;
    pv2v[pid as usize * n..(pid as usize + 1) * n].to_vec()
}

fn transfer_real(
    old: &Mesh,
    new: &Mesh,
    maps: &RewriteMaps,
    d: usize,
    tag: &Tag,
    old_data: &[f64],
) -> Result<Vec<f64>> {
    let width = tag.width;
    let mut out = vec![0.0; new.nents(d) * width];
    copy_same(maps, d, width, old_data, &mut out);
    for (p, &nl) in maps.prods2new_ents[d].iter().enumerate() {
        let parent = maps.prod_parents[d][p];
        let nl = nl as usize;
        let slot = &mut out[nl * width..(nl + 1) * width];
        match (tag.xfer, d) {
            (XferPolicy::LinearInterp, 0) => {
                let verts = parent_verts(old, parent);
                for k in 0..width {
                    slot[k] = verts
                        .iter()
                        .map(|&v| old_data[v as usize * width + k])
                        .sum::<f64>()
                        / verts.len() as f64;
                }
            }
            (XferPolicy::Metric, 0) => {
                let verts = parent_verts(old, parent);
                match old.dim() {
                    2 => {
                        let ms: Vec<_> = verts
                            .iter()
                            .map(|&v| get_symm::<2>(old_data, v as usize))
                            .collect();
                        set_symm::<2>(slot, 0, &average_metrics(&ms));
                    }
                    _ => {
                        let ms: Vec<_> = verts
                            .iter()
                            .map(|&v| get_symm::<3>(old_data, v as usize))
                            .collect();
                        set_symm::<3>(slot, 0, &average_metrics(&ms));
                    }
                }
            }
            (XferPolicy::Size, 0) => {
                let verts = parent_verts(old, parent);
                for k in 0..width {
                    let log_mean = verts
                        .iter()
                        .map(|&v| old_data[v as usize * width + k].ln())
                        .sum::<f64>()
                        / verts.len() as f64;
                    slot[k] = log_mean.exp();
                }
            }
            _ => {
                // inherit from the parent's own dimension
                let value: &[f64] = parent_value(old, &tag.name, width, parent)?;
                slot.copy_from_slice(value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::modify::{rebuild, RewritePlan};
    use crate::metric::{compose_metric, metric_desired_length, sym_dofs as dofs};
    use approx::assert_relative_eq;

    fn split_plan(mesh: &Mesh) -> RewritePlan {
        let ev2v = mesh.ask_verts_of(1);
        let diag = (0..mesh.nedges())
            .find(|&e| {
                let mut t = ev2v[e * 2..e * 2 + 2].to_vec();
                t.sort_unstable();
                t == vec![0, 2]
            })
            .unwrap() as Lo;
        let mut plan = RewritePlan::new(mesh);
        let m = plan.push_vert(mesh, &[0.5, 0.5], (1, diag));
        plan.dead_cells = vec![1, 1];
        plan.push_prod(1, &[0, m], (1, diag));
        plan.push_prod(1, &[m, 2], (1, diag));
        plan.push_prod(1, &[m, 1], (2, 0));
        plan.push_prod(1, &[m, 3], (2, 1));
        plan.push_prod(2, &[0, 1, m], (2, 0));
        plan.push_prod(2, &[m, 1, 2], (2, 0));
        plan.push_prod(2, &[2, 3, m], (2, 1));
        plan.push_prod(2, &[m, 3, 0], (2, 1));
        plan
    }

    fn two_tris() -> Mesh {
        Mesh::serial_from_elems_and_coords(
            2,
            vec![0, 1, 2, 2, 3, 0],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn metric_tag_interpolates_in_log_domain() {
        let mut mesh = two_tris();
        let frame = [[1.0, 0.0], [0.0, 1.0]];
        let fine = crate::geometry::symm_to_vec(&compose_metric(&frame, [0.1, 0.1]));
        let coarse = crate::geometry::symm_to_vec(&compose_metric(&frame, [10.0, 10.0]));
        let mut buf = Vec::new();
        for v in 0..4 {
            buf.extend_from_slice(if v == 0 { &fine } else { &coarse });
        }
        mesh.add_tag(0, "metric", dofs(2), XferPolicy::Metric, buf).unwrap();
        let plan = split_plan(&mesh);
        let (new_mesh, maps) = rebuild(&mesh, &plan).unwrap();
        let v2m = new_mesh.get_array::<f64>(0, "metric").unwrap();
        let mid = maps.prods2new_ents[0][0] as usize;
        let m = get_symm::<2>(&v2m, mid);
        // geometric mean of desired lengths 0.1 and 10 is 1
        assert_relative_eq!(metric_desired_length(&m, [1.0, 0.0]), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn size_tag_takes_geometric_mean() {
        let mut mesh = two_tris();
        mesh.add_tag(0, "size", 1, XferPolicy::Size, vec![0.25, 1.0, 4.0, 1.0])
            .unwrap();
        let plan = split_plan(&mesh);
        let (new_mesh, maps) = rebuild(&mesh, &plan).unwrap();
        let h = new_mesh.get_array::<f64>(0, "size").unwrap();
        let mid = maps.prods2new_ents[0][0] as usize;
        assert_relative_eq!(h[mid], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn classification_inherits_from_parents() {
        let mut mesh = two_tris();
        crate::topology::classify::classify_by_angles(&mut mesh, std::f64::consts::PI / 4.0)
            .unwrap();
        let plan = split_plan(&mesh);
        let (new_mesh, maps) = rebuild(&mesh, &plan).unwrap();
        // midpoint of the interior diagonal classifies interior
        let class_dim = new_mesh.get_array::<i8>(0, "class_dim").unwrap();
        let mid = maps.prods2new_ents[0][0] as usize;
        assert_eq!(class_dim[mid], 2);
        // halves of the interior edge stay interior, the midpoint spokes
        // inherit their parent triangles' region
        let edge_class = new_mesh.get_array::<i8>(1, "class_dim").unwrap();
        for &ne in &maps.prods2new_ents[1] {
            assert_eq!(edge_class[ne as usize], 2);
        }
        // surviving boundary edges keep their curve classification
        for (i, &oe) in maps.same_ents2old_ents[1].iter().enumerate() {
            let old_class = mesh.get_array::<i8>(1, "class_dim").unwrap();
            assert_eq!(
                edge_class[maps.same_ents2new_ents[1][i] as usize],
                old_class[oe as usize]
            );
        }
    }

    #[test]
    fn ephemeral_tags_drop_on_rebuild() {
        let mut mesh = two_tris();
        mesh.add_tag(1, "collapse_code", 1, XferPolicy::DontTransfer, vec![0i8; 5])
            .unwrap();
        let plan = split_plan(&mesh);
        let (new_mesh, _) = rebuild(&mesh, &plan).unwrap();
        assert!(!new_mesh.has_tag(1, "collapse_code"));
    }
}
