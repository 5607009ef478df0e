use crate::error::Result;
use crate::hypergraph::Hypergraph;
use crate::{HyperedgeId, HypernodeId, PartitionId};

/// Dense-position sparse set over hyperedge ids: O(1) insert, remove and
/// membership, iteration over the dense prefix.
struct SparseSet {
    dense: Vec<HyperedgeId>,
    position: Vec<isize>,
}

impl SparseSet {
    fn new(universe: usize) -> Self {
        SparseSet {
            dense: vec![],
            position: vec![-1; universe],
        }
    }

    fn contains(&self, e: HyperedgeId) -> bool {
        self.position[e as usize] >= 0
    }

    fn insert(&mut self, e: HyperedgeId) {
        if !self.contains(e) {
            self.position[e as usize] = self.dense.len() as isize;
            self.dense.push(e);
        }
    }

    fn remove(&mut self, e: HyperedgeId) {
        if self.contains(e) {
            let pos = self.position[e as usize] as usize;
            let last = *self.dense.last().expect("non-empty dense array");
            self.dense[pos] = last;
            self.position[last as usize] = pos as isize;
            self.dense.pop();
            self.position[e as usize] = -1;
        }
    }

    fn clear(&mut self) {
        for &e in &self.dense {
            self.position[e as usize] = -1;
        }
        self.dense.clear();
    }
}

/// The multigraph on blocks induced by cut hyperedges: for every unordered
/// block pair the set of hyperedges spanning both, maintained incrementally
/// through `change_node_part` notifications.
pub(crate) struct QuotientGraph {
    k: u32,
    sets: Vec<SparseSet>,
}

impl QuotientGraph {
    pub(crate) fn new(hg: &Hypergraph) -> Self {
        let k = hg.k();
        let sets = (0..(k * k))
            .map(|_| SparseSet::new(hg.initial_num_edges()))
            .collect();
        let mut qg = QuotientGraph { k, sets };
        qg.build(hg);
        qg
    }

    fn pair_index(&self, a: PartitionId, b: PartitionId) -> usize {
        debug_assert_ne!(a, b);
        let (i, j) = if a < b { (a, b) } else { (b, a) };
        (i * self.k + j) as usize
    }

    pub(crate) fn build(&mut self, hg: &Hypergraph) {
        for set in &mut self.sets {
            set.clear();
        }
        for e in hg.edges() {
            if hg.connectivity(e) < 2 {
                continue;
            }
            let blocks: Vec<PartitionId> = hg.connectivity_set(e).collect();
            for (x, &i) in blocks.iter().enumerate() {
                for &j in &blocks[x + 1..] {
                    let idx = self.pair_index(i, j);
                    self.sets[idx].insert(e);
                }
            }
        }
    }

    pub(crate) fn block_pair_cut_hyperedges(&self, a: PartitionId, b: PartitionId) -> &[HyperedgeId] {
        &self.sets[self.pair_index(a, b)].dense
    }

    /// Unordered block pairs with at least one cut hyperedge.
    pub(crate) fn active_pairs(&self) -> Vec<(PartitionId, PartitionId)> {
        let mut pairs = vec![];
        for i in 0..self.k {
            for j in i + 1..self.k {
                if !self.sets[(i * self.k + j) as usize].dense.is_empty() {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Moves the vertex through the hypergraph and keeps every affected
    /// pair set consistent. Only pairs involving `from` or `to` can change.
    pub(crate) fn change_node_part(
        &mut self,
        hg: &mut Hypergraph,
        v: HypernodeId,
        from: PartitionId,
        to: PartitionId,
    ) -> Result<()> {
        hg.change_node_part(v, from, to)?;
        for e in hg.incident_edges(v).collect::<Vec<_>>() {
            for p in 0..self.k {
                if p != from {
                    let idx = self.pair_index(from, p);
                    let spanning =
                        hg.pin_count_in_part(e, from) > 0 && hg.pin_count_in_part(e, p) > 0;
                    if spanning {
                        self.sets[idx].insert(e);
                    } else {
                        self.sets[idx].remove(e);
                    }
                }
                if p != to {
                    let idx = self.pair_index(to, p);
                    let spanning =
                        hg.pin_count_in_part(e, to) > 0 && hg.pin_count_in_part(e, p) > 0;
                    if spanning {
                        self.sets[idx].insert(e);
                    } else {
                        self.sets[idx].remove(e);
                    }
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn assert_consistent(&self, hg: &Hypergraph) {
        for i in 0..self.k {
            for j in i + 1..self.k {
                let mut expected: Vec<HyperedgeId> = hg
                    .edges()
                    .filter(|&e| {
                        hg.pin_count_in_part(e, i) > 0 && hg.pin_count_in_part(e, j) > 0
                    })
                    .collect();
                expected.sort_unstable();
                let mut actual = self.block_pair_cut_hyperedges(i, j).to_vec();
                actual.sort_unstable();
                assert_eq!(actual, expected, "pair ({i}, {j})");
            }
        }
    }
}
