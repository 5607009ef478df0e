use bitvec::prelude::*;

use crate::error::{Error, Result};
use crate::{HyperedgeId, HyperedgeWeight, HypernodeId, NodeWeight, PartitionId, INVALID_PART};

/// The incidence structure is a bipartite graph between hypernodes and
/// hyperedges: the V, E, and A arrays of Schlag '2015, section 4.5. On top of
/// it the store keeps the k-way partition state (block ids, per-block pin
/// counts, connectivity, block weights) incrementally consistent through
/// every mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypergraph {
    // (offset into A, length) per hypernode and hyperedge.
    v: Vec<(u32, u32)>,
    e: Vec<(u32, u32)>,
    a: Vec<u32>,

    v_enabled: BitVec,
    e_enabled: BitVec,
    num_disabled_nodes: usize,
    num_disabled_edges: usize,

    node_weight: Vec<NodeWeight>,
    edge_weight: Vec<HyperedgeWeight>,
    total_weight: NodeWeight,

    k: u32,
    part: Vec<PartitionId>,
    // |E| * k, row-major by hyperedge.
    pins_in_part: Vec<u32>,
    connectivity: Vec<u32>,
    part_weight: Vec<NodeWeight>,

    // INVALID_PART marks a free vertex.
    fixed: Vec<PartitionId>,
    community: Vec<u32>,
}

/// Contractions produce mementos that can be applied in reverse to perform
/// uncontractions. Stores the contracted pair and the slice of u's incidence
/// list prior to contraction; `uncontract` reads nothing else.
#[derive(Clone, Copy, Debug)]
pub struct Memento {
    pub u: HypernodeId,
    pub v: HypernodeId,
    u_idx: u32,
    u_len: u32,
}

impl Hypergraph {
    pub fn new(
        k: u32,
        node_weights: &[NodeWeight],
        edge_weights: &[HyperedgeWeight],
        nets: &[Vec<HypernodeId>],
    ) -> Self {
        let num_v = node_weights.len();
        let num_e = edge_weights.len();
        assert_eq!(num_e, nets.len());

        let mut hg = Hypergraph {
            v: Vec::with_capacity(num_v),
            e: Vec::with_capacity(num_e),
            a: vec![],
            v_enabled: bitvec![usize, Lsb0; 1; num_v],
            e_enabled: bitvec![usize, Lsb0; 1; num_e],
            num_disabled_nodes: 0,
            num_disabled_edges: 0,
            node_weight: Vec::from(node_weights),
            edge_weight: Vec::from(edge_weights),
            total_weight: node_weights.iter().sum(),
            k,
            part: vec![INVALID_PART; num_v],
            pins_in_part: vec![0; num_e * k as usize],
            connectivity: vec![0; num_e],
            part_weight: vec![0; k as usize],
            fixed: vec![INVALID_PART; num_v],
            community: vec![0; num_v],
        };

        for net in nets {
            hg.e.push((hg.a.len() as u32, net.len() as u32));
            hg.a.extend(net.iter().copied());
        }
        // Vertex incidence lists by counting sort over the pin lists.
        let mut degree = vec![0u32; num_v];
        for net in nets {
            for &p in net {
                degree[p as usize] += 1;
            }
        }
        let mut offset = hg.a.len() as u32;
        for v_idx in 0..num_v {
            hg.v.push((offset, degree[v_idx]));
            offset += degree[v_idx];
        }
        hg.a.resize(offset as usize, 0);
        let mut cursor: Vec<u32> = hg.v.iter().map(|&(idx, _)| idx).collect();
        for (e_idx, net) in nets.iter().enumerate() {
            for &p in net {
                hg.a[cursor[p as usize] as usize] = e_idx as u32;
                cursor[p as usize] += 1;
            }
        }

        // Hyperedges that cannot be cut carry no information.
        for e_idx in 0..num_e {
            if hg.e[e_idx].1 < 2 {
                hg.e_enabled.set(e_idx, false);
                hg.num_disabled_edges += 1;
            }
        }

        hg
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn num_nodes(&self) -> usize {
        self.v.len() - self.num_disabled_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.e.len() - self.num_disabled_edges
    }

    /// Size of the hypernode index space, including disabled ids.
    pub fn initial_num_nodes(&self) -> usize {
        self.v.len()
    }

    pub fn initial_num_edges(&self) -> usize {
        self.e.len()
    }

    pub fn total_weight(&self) -> NodeWeight {
        self.total_weight
    }

    pub fn node_weight(&self, v: HypernodeId) -> NodeWeight {
        debug_assert!(self.v_enabled[v as usize]);
        self.node_weight[v as usize]
    }

    pub fn edge_weight(&self, e: HyperedgeId) -> HyperedgeWeight {
        self.edge_weight[e as usize]
    }

    pub fn edge_size(&self, e: HyperedgeId) -> usize {
        self.e[e as usize].1 as usize
    }

    pub fn is_node_enabled(&self, v: HypernodeId) -> bool {
        self.v_enabled[v as usize]
    }

    pub fn is_edge_enabled(&self, e: HyperedgeId) -> bool {
        self.e_enabled[e as usize]
    }

    pub fn nodes(&self) -> impl Iterator<Item = HypernodeId> + Clone + '_ {
        (0..self.v.len() as u32).filter(|&v| self.v_enabled[v as usize])
    }

    pub fn edges(&self) -> impl Iterator<Item = HyperedgeId> + Clone + '_ {
        (0..self.e.len() as u32).filter(|&e| self.e_enabled[e as usize])
    }

    pub fn pins(&self, e: HyperedgeId) -> impl ExactSizeIterator<Item = HypernodeId> + Clone + '_ {
        let (idx, len) = self.e[e as usize];
        self.a[idx as usize..(idx + len) as usize].iter().copied()
    }

    /// Enabled hyperedges incident to v.
    pub fn incident_edges(&self, v: HypernodeId) -> impl Iterator<Item = HyperedgeId> + Clone + '_ {
        self.incident_slots(v).filter(|&e| self.e_enabled[e as usize])
    }

    pub fn node_degree(&self, v: HypernodeId) -> usize {
        self.incident_edges(v).count()
    }

    /// All incidence-list entries of v, including disabled hyperedges. The
    /// contraction machinery needs the raw list.
    fn incident_slots(&self, v: HypernodeId) -> impl ExactSizeIterator<Item = HyperedgeId> + Clone + '_ {
        let (idx, len) = self.v[v as usize];
        self.a[idx as usize..(idx + len) as usize].iter().copied()
    }

    /// Pins of e other than v that share a block with v, etc. are derived by
    /// callers; this yields neighbouring hypernodes across all incident
    /// enabled hyperedges, with repetitions.
    pub fn adjacent_nodes<'a>(&'a self, v: HypernodeId) -> impl Iterator<Item = HypernodeId> + 'a {
        self.incident_edges(v)
            .flat_map(move |e| self.pins(e))
            .filter(move |&u| u != v && self.v_enabled[u as usize])
    }

    // ------------------------------------------------------------------
    // Partition state
    // ------------------------------------------------------------------

    pub fn part(&self, v: HypernodeId) -> PartitionId {
        self.part[v as usize]
    }

    pub fn has_part(&self, v: HypernodeId) -> bool {
        self.part[v as usize] != INVALID_PART
    }

    pub fn part_weight(&self, p: PartitionId) -> NodeWeight {
        self.part_weight[p as usize]
    }

    pub fn pin_count_in_part(&self, e: HyperedgeId, p: PartitionId) -> u32 {
        self.pins_in_part[e as usize * self.k as usize + p as usize]
    }

    pub fn connectivity(&self, e: HyperedgeId) -> u32 {
        self.connectivity[e as usize]
    }

    /// Blocks with at least one pin of e.
    pub fn connectivity_set(&self, e: HyperedgeId) -> impl Iterator<Item = PartitionId> + '_ {
        let row = e as usize * self.k as usize;
        (0..self.k).filter(move |&p| self.pins_in_part[row + p as usize] > 0)
    }

    pub fn is_border_node(&self, v: HypernodeId) -> bool {
        self.incident_edges(v).any(|e| self.connectivity[e as usize] >= 2)
    }

    pub fn is_cut_edge(&self, e: HyperedgeId) -> bool {
        self.connectivity[e as usize] >= 2
    }

    /// First-time block assignment, used by the initial partitioner.
    pub fn set_node_part(&mut self, v: HypernodeId, p: PartitionId) {
        debug_assert!(self.v_enabled[v as usize]);
        debug_assert_eq!(self.part[v as usize], INVALID_PART);
        debug_assert!(p < self.k);
        self.part[v as usize] = p;
        self.part_weight[p as usize] += self.node_weight[v as usize];
        let incident: Vec<_> = self.incident_slots(v).collect();
        for e in incident {
            self.incr_pins_in_part(e, p);
        }
    }

    /// Moves v from block `from` to block `to`, keeping pin counts,
    /// connectivity and block weights consistent. O(|incident_edges(v)|).
    pub fn change_node_part(&mut self, v: HypernodeId, from: PartitionId, to: PartitionId) -> Result<()> {
        debug_assert!(self.v_enabled[v as usize]);
        if self.part[v as usize] != from {
            return Err(Error::InconsistentMove {
                node: v,
                expected: self.part[v as usize],
                actual: from,
            });
        }
        debug_assert_ne!(from, to);
        debug_assert!(to < self.k);
        self.part[v as usize] = to;
        self.part_weight[from as usize] -= self.node_weight[v as usize];
        self.part_weight[to as usize] += self.node_weight[v as usize];
        let incident: Vec<_> = self.incident_slots(v).collect();
        for e in incident {
            self.decr_pins_in_part(e, from);
            self.incr_pins_in_part(e, to);
        }
        Ok(())
    }

    /// Clears all block assignments.
    pub fn reset_partition(&mut self) {
        self.part.fill(INVALID_PART);
        self.pins_in_part.fill(0);
        self.connectivity.fill(0);
        self.part_weight.fill(0);
    }

    /// Bulk-assigns a partition vector, e.g. an evolutionary individual.
    pub fn set_partition(&mut self, partition: &[PartitionId]) {
        self.reset_partition();
        for v in 0..self.v.len() as u32 {
            if self.v_enabled[v as usize] {
                self.set_node_part(v, partition[v as usize]);
            }
        }
    }

    /// Snapshot of the current block assignment in vertex order.
    pub fn partition(&self) -> Vec<PartitionId> {
        self.part.clone()
    }

    fn incr_pins_in_part(&mut self, e: HyperedgeId, p: PartitionId) {
        let slot = e as usize * self.k as usize + p as usize;
        self.pins_in_part[slot] += 1;
        if self.pins_in_part[slot] == 1 {
            self.connectivity[e as usize] += 1;
        }
    }

    fn decr_pins_in_part(&mut self, e: HyperedgeId, p: PartitionId) {
        let slot = e as usize * self.k as usize + p as usize;
        debug_assert!(self.pins_in_part[slot] > 0);
        self.pins_in_part[slot] -= 1;
        if self.pins_in_part[slot] == 0 {
            self.connectivity[e as usize] -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Fixed vertices and communities
    // ------------------------------------------------------------------

    pub fn set_fixed_vertex(&mut self, v: HypernodeId, block: PartitionId) {
        self.fixed[v as usize] = block;
    }

    pub fn is_fixed(&self, v: HypernodeId) -> bool {
        self.fixed[v as usize] != INVALID_PART
    }

    pub fn fixed_block(&self, v: HypernodeId) -> Option<PartitionId> {
        match self.fixed[v as usize] {
            INVALID_PART => None,
            block => Some(block),
        }
    }

    pub fn num_fixed_vertices(&self) -> usize {
        self.nodes().filter(|&v| self.is_fixed(v)).count()
    }

    pub fn community(&self, v: HypernodeId) -> u32 {
        self.community[v as usize]
    }

    pub fn set_communities(&mut self, communities: Vec<u32>) {
        assert_eq!(communities.len(), self.v.len());
        self.community = communities;
    }

    // ------------------------------------------------------------------
    // Contraction
    // ------------------------------------------------------------------

    /// Merges v into u. Implements Algorithm 2: Contract from Schlag '2015,
    /// extended with partition bookkeeping and single-pin hyperedge
    /// disabling. Parallel pins are deduplicated within each hyperedge.
    pub fn contract(&mut self, u: HypernodeId, v: HypernodeId) -> Result<Memento> {
        assert_ne!(u, v);
        debug_assert!(self.v_enabled[u as usize] && self.v_enabled[v as usize]);
        if self.has_part(u) || self.has_part(v) {
            if self.part[u as usize] != self.part[v as usize] {
                return Err(Error::InvalidContraction {
                    u,
                    v,
                    reason: "pair is assigned to different blocks",
                });
            }
        }
        if self.is_fixed(v) && !self.is_fixed(u) {
            return Err(Error::InvalidContraction {
                u,
                v,
                reason: "a fixed vertex cannot be absorbed by a free one",
            });
        }
        if self.is_fixed(u) && self.is_fixed(v) && self.fixed[u as usize] != self.fixed[v as usize] {
            return Err(Error::InvalidContraction {
                u,
                v,
                reason: "fixed vertices with different target blocks",
            });
        }

        let (u_idx, u_len) = self.v[u as usize];
        let memento = Memento { u, v, u_idx, u_len };

        self.node_weight[u as usize] += self.node_weight[v as usize];
        let part = self.part[v as usize];

        let mut copy = true;
        let incident: Vec<_> = self.incident_slots(v).collect();
        for e in incident {
            let (e_idx, e_len) = self.e[e as usize];
            let l = e_idx + e_len - 1;
            // Swap v to the last pin slot; remember whether u is a pin.
            let mut tau = l;
            for i in e_idx..=l {
                if self.a[i as usize] == v {
                    self.a.swap(i as usize, l as usize);
                }
                if self.a[i as usize] == u {
                    tau = i;
                }
            }

            if tau == l {
                // u was not a pin of e: u takes over v's slot.
                self.a[l as usize] = u;
                if copy {
                    let incident_u: Vec<_> = self.incident_slots(u).collect();
                    self.a.extend(incident_u);
                    self.v[u as usize].0 = self.a.len() as u32 - self.v[u as usize].1;
                    copy = false;
                }
                self.a.push(e);
                self.v[u as usize].1 += 1;
            } else {
                // Parallel pin: e shrinks by one.
                self.e[e as usize].1 -= 1;
                if part != INVALID_PART {
                    self.decr_pins_in_part(e, part);
                }
                if self.e[e as usize].1 == 1 && self.e_enabled[e as usize] {
                    self.e_enabled.set(e as usize, false);
                    self.num_disabled_edges += 1;
                }
            }
        }

        self.v_enabled.set(v as usize, false);
        self.num_disabled_nodes += 1;
        Ok(memento)
    }

    /// Inverse of `contract`; Algorithm 3: Uncontract from Schlag '2015.
    /// Restores the exact pre-contraction pin lists, weights and disabled
    /// flags. v rejoins in u's current block.
    pub fn uncontract(&mut self, m: Memento) {
        self.v_enabled.set(m.v as usize, true);
        self.num_disabled_nodes -= 1;

        // b marks hyperedges u acquired from v during the contraction.
        let mut b = bitvec![usize, Lsb0; 0; self.e.len()];
        for e in self.incident_slots(m.v) {
            b.set(e as usize, true);
        }
        for i in m.u_idx..m.u_idx + m.u_len {
            b.set(self.a[i as usize] as usize, false);
        }

        if self.v[m.u as usize].1 > m.u_len {
            let incident_u: Vec<_> = self.incident_slots(m.u).collect();
            for e in incident_u {
                if b[e as usize] {
                    let (e_idx, e_len) = self.e[e as usize];
                    for p_idx in e_idx..e_idx + e_len {
                        if self.a[p_idx as usize] == m.u {
                            self.a[p_idx as usize] = m.v;
                            break;
                        }
                    }
                }
            }
        }

        self.v[m.u as usize].0 = m.u_idx;
        self.v[m.u as usize].1 = m.u_len;
        self.node_weight[m.u as usize] -= self.node_weight[m.v as usize];

        let part = self.part[m.u as usize];
        self.part[m.v as usize] = part;

        let incident_v: Vec<_> = self.incident_slots(m.v).collect();
        for e in incident_v {
            if !b[e as usize] {
                // v was deduplicated out of e; the slot past the end still
                // holds v, so growing the size restores the pin.
                self.e[e as usize].1 += 1;
                if part != INVALID_PART {
                    self.incr_pins_in_part(e, part);
                }
                if self.e[e as usize].1 == 2 && !self.e_enabled[e as usize] {
                    self.e_enabled.set(e as usize, true);
                    self.num_disabled_edges -= 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Sub-hypergraph extraction (recursive bisection)
    // ------------------------------------------------------------------

    /// Extracts the vertices of `block` as a fresh unpartitioned hypergraph
    /// with `new_k` blocks. With `split_nets`, cut hyperedges keep their
    /// inside pins (connectivity objective); without, only hyperedges fully
    /// inside the block survive (cut objective). Returns the new hypergraph
    /// and the new-id to old-id mapping.
    pub fn extract_block(
        &self,
        block: PartitionId,
        new_k: u32,
        split_nets: bool,
    ) -> (Hypergraph, Vec<HypernodeId>) {
        let mut old_to_new = vec![u32::MAX; self.v.len()];
        let mut node_map = vec![];
        let mut node_weights = vec![];
        for v in self.nodes() {
            if self.part[v as usize] == block {
                old_to_new[v as usize] = node_map.len() as u32;
                node_map.push(v);
                node_weights.push(self.node_weight[v as usize]);
            }
        }

        let mut edge_weights = vec![];
        let mut nets: Vec<Vec<HypernodeId>> = vec![];
        for e in self.edges() {
            let all_inside = self.pin_count_in_part(e, block) as usize == self.edge_size(e);
            if !all_inside && !split_nets {
                continue;
            }
            let pins: Vec<_> = self
                .pins(e)
                .filter(|&p| self.part[p as usize] == block)
                .map(|p| old_to_new[p as usize])
                .collect();
            if pins.len() < 2 {
                continue;
            }
            edge_weights.push(self.edge_weight[e as usize]);
            nets.push(pins);
        }

        let mut extracted = Hypergraph::new(new_k, &node_weights, &edge_weights, &nets);
        for (new_id, &old_id) in node_map.iter().enumerate() {
            extracted.fixed[new_id] = self.fixed[old_id as usize];
            extracted.community[new_id] = self.community[old_id as usize];
        }
        (extracted, node_map)
    }

    /// Re-materialises the enabled part of the hypergraph with a different
    /// block count (the entry into recursive bisection). Returns the copy and
    /// the new-id to old-id mapping.
    pub fn copy_with_k(&self, new_k: u32) -> (Hypergraph, Vec<HypernodeId>) {
        let mut old_to_new = vec![u32::MAX; self.v.len()];
        let mut node_map = vec![];
        let mut node_weights = vec![];
        for v in self.nodes() {
            old_to_new[v as usize] = node_map.len() as u32;
            node_map.push(v);
            node_weights.push(self.node_weight[v as usize]);
        }
        let mut edge_weights = vec![];
        let mut nets: Vec<Vec<HypernodeId>> = vec![];
        for e in self.edges() {
            edge_weights.push(self.edge_weight[e as usize]);
            nets.push(self.pins(e).map(|p| old_to_new[p as usize]).collect());
        }
        let mut copy = Hypergraph::new(new_k, &node_weights, &edge_weights, &nets);
        for (new_id, &old_id) in node_map.iter().enumerate() {
            copy.fixed[new_id] = self.fixed[old_id as usize];
            copy.community[new_id] = self.community[old_id as usize];
        }
        (copy, node_map)
    }

    /// Debug-only consistency sweep over the derived aggregates.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut part_weight = vec![0; self.k as usize];
        for v in self.nodes() {
            if self.has_part(v) {
                part_weight[self.part[v as usize] as usize] += self.node_weight[v as usize];
            }
        }
        assert_eq!(part_weight, self.part_weight);
        let total: NodeWeight = self.nodes().map(|v| self.node_weight[v as usize]).sum();
        assert_eq!(total, self.total_weight);
        for e in self.edges() {
            let mut counts = vec![0u32; self.k as usize];
            let mut pins = 0;
            for p in self.pins(e) {
                pins += 1;
                if self.has_part(p) {
                    counts[self.part[p as usize] as usize] += 1;
                }
            }
            if self.pins(e).all(|p| self.has_part(p)) {
                assert_eq!(counts.iter().sum::<u32>(), pins);
            }
            for p in 0..self.k {
                assert_eq!(counts[p as usize], self.pin_count_in_part(e, p), "edge {e} part {p}");
            }
            assert_eq!(
                counts.iter().filter(|&&c| c > 0).count() as u32,
                self.connectivity[e as usize]
            );
        }
    }
}
