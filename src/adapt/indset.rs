//! Independent-set selection of cavity keys.
//!
//! Two cavity operators conflict when their cavities share a cell. Selection
//! follows the Luby/Jones-Plassmann rule: a candidate enters the set iff its
//! `(priority, global id)` pair strictly dominates every conflicting
//! candidate. Dominators are removed together with their neighbors and the
//! rule repeats, so the final set is maximal; every round is a pure function
//! of priorities and ids, making the result deterministic across runs and
//! rank counts.

use crate::mesh_error::Result;
use crate::topology::{Graph, Lo, Mesh};
use hashbrown::HashSet;

#[derive(Copy, Clone, PartialEq, Eq)]
enum State {
    Out,
    Candidate,
    In,
}

fn dominates(a: (f64, u64), b: (f64, u64)) -> bool {
    a.0 > b.0 || (a.0 == b.0 && a.1 > b.1)
}

/// Select a maximal conflict-free subset of the marked candidates, where
/// conflicts are edges of `conflicts`. Priorities break ties by global id.
pub fn find_indset_with_graph(
    mesh: &Mesh,
    ent_dim: usize,
    conflicts: &Graph,
    quals: &[f64],
    cands: &[u8],
) -> Result<Vec<u8>> {
    let n = mesh.nents(ent_dim);
    debug_assert_eq!(quals.len(), n);
    debug_assert_eq!(cands.len(), n);
    let globals = mesh.globals(ent_dim);
    let mut state: Vec<State> = (0..n)
        .map(|i| {
            if cands[i] != 0 {
                State::Candidate
            } else {
                State::Out
            }
        })
        .collect();
    loop {
        // candidates dominating all candidate neighbors enter the set
        let winners: Vec<Lo> = (0..n)
            .filter(|&i| {
                state[i] == State::Candidate
                    && conflicts.row(i).iter().all(|&j| {
                        state[j as usize] != State::Candidate
                            || dominates(
                                (quals[i], globals[i]),
                                (quals[j as usize], globals[j as usize]),
                            )
                    })
            })
            .map(|i| i as Lo)
            .collect();
        if winners.is_empty() {
            break;
        }
        for &w in &winners {
            state[w as usize] = State::In;
        }
        for &w in &winners {
            for &j in conflicts.row(w as usize) {
                if state[j as usize] == State::Candidate {
                    state[j as usize] = State::Out;
                }
            }
        }
    }
    Ok(state
        .into_iter()
        .map(|s| u8::from(s == State::In))
        .collect())
}

/// Conflict graph for entities of `ent_dim`: two entities conflict when some
/// cell contains both (their single-cavity operators would overlap).
pub fn star_conflict_graph(mesh: &Mesh, ent_dim: usize) -> Graph {
    let dim = mesh.dim();
    let n = mesh.nents(ent_dim);
    let up = mesh.ask_up(ent_dim, dim);
    let down = mesh.ask_down(dim, ent_dim);
    let deg = crate::topology::simplex_degree(dim, ent_dim);
    let mut a2ab = Vec::with_capacity(n + 1);
    a2ab.push(0 as Lo);
    let mut ab2b = Vec::new();
    for i in 0..n {
        let mut row: Vec<Lo> = Vec::new();
        for &c in up.row(i) {
            for k in 0..deg {
                let j = down.ab2b[c as usize * deg + k];
                if j as usize != i && !row.contains(&j) {
                    row.push(j);
                }
            }
        }
        row.sort_unstable();
        ab2b.extend_from_slice(&row);
        a2ab.push(ab2b.len() as Lo);
    }
    Graph { a2ab, ab2b }
}

/// Select an independent set among marked entities using the star conflict
/// graph.
pub fn find_indset(
    mesh: &Mesh,
    ent_dim: usize,
    quals: &[f64],
    cands: &[u8],
) -> Result<Vec<u8>> {
    let graph = star_conflict_graph(mesh, ent_dim);
    find_indset_with_graph(mesh, ent_dim, &graph, quals, cands)
}

/// Cells reachable from each marked vertex within `nlayers` hops of the
/// element dual graph, starting from the vertex's star.
pub fn get_buffered_elems(mesh: &Mesh, key_marks: &[u8], nlayers: usize) -> Graph {
    let dim = mesh.dim();
    let v2e = mesh.ask_up(0, dim);
    let dual = mesh.ask_dual();
    let mut a2ab = Vec::with_capacity(mesh.nverts() + 1);
    a2ab.push(0 as Lo);
    let mut ab2b = Vec::new();
    for v in 0..mesh.nverts() {
        if key_marks[v] == 0 {
            a2ab.push(ab2b.len() as Lo);
            continue;
        }
        let mut seen: HashSet<Lo> = v2e.row(v).iter().copied().collect();
        let mut frontier: Vec<Lo> = seen.iter().copied().collect();
        for _ in 1..nlayers {
            let mut next = Vec::new();
            for &e in &frontier {
                for &ne in dual.row(e as usize) {
                    if seen.insert(ne) {
                        next.push(ne);
                    }
                }
            }
            frontier = next;
        }
        let mut row: Vec<Lo> = seen.into_iter().collect();
        row.sort_unstable();
        ab2b.extend_from_slice(&row);
        a2ab.push(ab2b.len() as Lo);
    }
    Graph { a2ab, ab2b }
}

/// Conflict graph between marked vertices whose buffered element sets
/// intersect. This widens the plain star conflicts so a cavity choice near a
/// rank boundary is visible to every involved rank before selection.
pub fn get_buffered_conflicts(mesh: &Mesh, keys2buf_elems: &Graph, key_marks: &[u8]) -> Graph {
    let nverts = mesh.nverts();
    // invert: element -> marked verts buffering it
    let mut elem2verts: hashbrown::HashMap<Lo, Vec<Lo>> = hashbrown::HashMap::new();
    for v in 0..nverts {
        for &e in keys2buf_elems.row(v) {
            elem2verts.entry(e).or_default().push(v as Lo);
        }
    }
    let mut a2ab = Vec::with_capacity(nverts + 1);
    a2ab.push(0 as Lo);
    let mut ab2b = Vec::new();
    for v in 0..nverts {
        if key_marks[v] == 0 {
            a2ab.push(ab2b.len() as Lo);
            continue;
        }
        let mut row: Vec<Lo> = Vec::new();
        for &e in keys2buf_elems.row(v) {
            for &u in &elem2verts[&e] {
                if u as usize != v && !row.contains(&u) {
                    row.push(u);
                }
            }
        }
        row.sort_unstable();
        ab2b.extend_from_slice(&row);
        a2ab.push(ab2b.len() as Lo);
    }
    Graph { a2ab, ab2b }
}
