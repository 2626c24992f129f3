//! Flat adjacency structures and their derivation.
//!
//! Downward adjacency of fixed degree stores only the target list (`ab2b`)
//! plus one alignment code per use; upward adjacency is CSR (`a2ab` offsets)
//! with codes that also record which down-use of the parent points back.

use crate::algs::map::offset_scan;
use crate::algs::sort::{find_jumps, sort_by_keys};
use crate::topology::align::{code_to_canonical, find_alignment, make_code};
use crate::topology::{down_template, simplex_degree, simplex_nverts, Lo};
use hashbrown::HashMap;

/// CSR graph without codes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    /// Offsets, length `n + 1`.
    pub a2ab: Vec<Lo>,
    /// Concatenated neighbor lists.
    pub ab2b: Vec<Lo>,
}

impl Graph {
    /// Number of source nodes.
    pub fn nnodes(&self) -> usize {
        self.a2ab.len().saturating_sub(1)
    }

    /// Neighbor list of node `a`.
    pub fn row(&self, a: usize) -> &[Lo] {
        &self.ab2b[self.a2ab[a] as usize..self.a2ab[a + 1] as usize]
    }
}

/// Adjacency with per-use alignment codes. Downward fixed-degree adjacency
/// leaves `a2ab` empty; upward adjacency fills it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Adj {
    /// CSR offsets (empty for fixed-degree downward adjacency).
    pub a2ab: Vec<Lo>,
    /// Target entity per use.
    pub ab2b: Vec<Lo>,
    /// Alignment code per use.
    pub codes: Vec<u8>,
}

impl Adj {
    /// Downward adjacency from a flat target list.
    pub fn from_down(ab2b: Vec<Lo>, codes: Vec<u8>) -> Self {
        Adj {
            a2ab: Vec::new(),
            ab2b,
            codes,
        }
    }

    /// Upward neighbor list of entity `a`.
    pub fn row(&self, a: usize) -> &[Lo] {
        &self.ab2b[self.a2ab[a] as usize..self.a2ab[a + 1] as usize]
    }

    /// Codes aligned with [`Adj::row`].
    pub fn row_codes(&self, a: usize) -> &[u8] {
        &self.codes[self.a2ab[a] as usize..self.a2ab[a + 1] as usize]
    }
}

/// Enumerate the down-uses of each high entity: for every high simplex, the
/// vertex tuples of its `low_dim` boundary entities in template order.
pub fn form_uses(hv2v: &[Lo], high_dim: usize, low_dim: usize) -> Vec<Lo> {
    let nhv = simplex_nverts(high_dim);
    let nlv = simplex_nverts(low_dim);
    let deg = simplex_degree(high_dim, low_dim);
    let nhigh = hv2v.len() / nhv;
    let mut out = Vec::with_capacity(nhigh * deg * nlv);
    for h in 0..nhigh {
        let verts = &hv2v[h * nhv..(h + 1) * nhv];
        for which in 0..deg {
            for idx in 0..nlv {
                out.push(verts[down_template(high_dim, low_dim, which, idx)]);
            }
        }
    }
    out
}

/// Deduplicate the uses of `hv2v` into unique `low_dim` entities, returned as
/// canonical vertex tuples ordered by ascending canonical key.
pub fn find_unique(hv2v: &[Lo], high_dim: usize, low_dim: usize) -> Vec<Lo> {
    let nlv = simplex_nverts(low_dim);
    let uses = form_uses(hv2v, high_dim, low_dim);
    let nuses = uses.len() / nlv;
    let mut canon = vec![0 as Lo; uses.len()];
    for u in 0..nuses {
        let (_, c) = code_to_canonical(&uses[u * nlv..(u + 1) * nlv]);
        canon[u * nlv..(u + 1) * nlv].copy_from_slice(&c);
    }
    let sorted2use = sort_by_keys(&canon, nlv);
    let sorted_canon: Vec<Lo> = sorted2use
        .iter()
        .flat_map(|&u| canon[u as usize * nlv..(u as usize + 1) * nlv].iter().copied())
        .collect();
    let jumps = find_jumps(&sorted_canon, nlv);
    let mut out = Vec::new();
    for (s, &j) in jumps.iter().enumerate() {
        if j != 0 {
            out.extend_from_slice(&sorted_canon[s * nlv..(s + 1) * nlv]);
        }
    }
    out
}

/// Match each down-use of the high entities onto the stored low entities,
/// producing target ids and the codes transforming each stored tuple into the
/// use's orientation.
pub fn reflect_down(hv2v: &[Lo], lv2v: &[Lo], high_dim: usize, low_dim: usize) -> Adj {
    let nlv = simplex_nverts(low_dim);
    let nlow = lv2v.len() / nlv;
    let mut index: HashMap<Vec<Lo>, Lo> = HashMap::with_capacity(nlow);
    for l in 0..nlow {
        let mut key: Vec<Lo> = lv2v[l * nlv..(l + 1) * nlv].to_vec();
        key.sort_unstable();
        index.insert(key, l as Lo);
    }
    let uses = form_uses(hv2v, high_dim, low_dim);
    let nuses = uses.len() / nlv;
    let mut ab2b = Vec::with_capacity(nuses);
    let mut codes = Vec::with_capacity(nuses);
    for u in 0..nuses {
        let use_tuple = &uses[u * nlv..(u + 1) * nlv];
        let mut key: Vec<Lo> = use_tuple.to_vec();
        key.sort_unstable();
        let l = *index
            .get(&key)
            .unwrap_or_else(|| panic!("use {use_tuple:?} has no matching entity"));
        let stored = &lv2v[l as usize * nlv..(l as usize + 1) * nlv];
        let code = find_alignment(stored, use_tuple)
            .unwrap_or_else(|| panic!("tuples {stored:?} and {use_tuple:?} not alignable"));
        ab2b.push(l);
        codes.push(code);
    }
    Adj::from_down(ab2b, codes)
}

/// Invert a downward adjacency into upward CSR form. Per-parent use codes
/// gain a which-down field; each child's parent list is ascending, making the
/// result independent of traversal order.
pub fn invert_adj(down: &Adj, deg: usize, nlow: usize) -> Adj {
    let nhigh = down.ab2b.len() / deg;
    let mut degrees = vec![0 as Lo; nlow];
    for &l in &down.ab2b {
        degrees[l as usize] += 1;
    }
    let a2ab = offset_scan(&degrees);
    let mut slots: Vec<Lo> = a2ab[..nlow].to_vec();
    let total = down.ab2b.len();
    let mut ab2b = vec![0 as Lo; total];
    let mut codes = vec![0u8; total];
    for h in 0..nhigh {
        for which in 0..deg {
            let use_idx = h * deg + which;
            let l = down.ab2b[use_idx] as usize;
            let down_code = down.codes.get(use_idx).copied().unwrap_or(0);
            let slot = slots[l] as usize;
            slots[l] += 1;
            ab2b[slot] = h as Lo;
            codes[slot] = down_code | make_code(false, 0, which as u8);
        }
    }
    Adj { a2ab, ab2b, codes }
}

/// Cell-to-cell adjacency across shared sides (dimension `dim - 1`).
pub fn derive_dual(sides2cells: &Adj, ncells: usize) -> Graph {
    let nsides = sides2cells.nnodes();
    let mut degrees = vec![0 as Lo; ncells];
    for s in 0..nsides {
        if sides2cells.row(s).len() == 2 {
            for &c in sides2cells.row(s) {
                degrees[c as usize] += 1;
            }
        }
    }
    let a2ab = offset_scan(&degrees);
    let mut slots: Vec<Lo> = a2ab[..ncells].to_vec();
    let mut ab2b = vec![0 as Lo; *a2ab.last().unwrap() as usize];
    for s in 0..nsides {
        let row = sides2cells.row(s);
        if row.len() == 2 {
            let (c0, c1) = (row[0] as usize, row[1] as usize);
            ab2b[slots[c0] as usize] = c1 as Lo;
            slots[c0] += 1;
            ab2b[slots[c1] as usize] = c0 as Lo;
            slots[c1] += 1;
        }
    }
    let mut dual = Graph { a2ab, ab2b };
    for c in 0..ncells {
        let span = dual.a2ab[c] as usize..dual.a2ab[c + 1] as usize;
        dual.ab2b[span].sort_unstable();
    }
    dual
}

impl Adj {
    /// Number of CSR source nodes.
    pub fn nnodes(&self) -> usize {
        self.a2ab.len().saturating_sub(1)
    }
}
