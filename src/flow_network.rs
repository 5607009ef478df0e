use std::collections::HashSet;
use std::collections::VecDeque;

use crate::context::{Context, FlowNetworkPolicy};
use crate::hypergraph::Hypergraph;
use crate::services::Random;
use crate::{Flow, HyperedgeId, HyperedgeWeight, HypernodeId, NodeWeight, PartitionId};

/// Network node id. Hypernodes keep their ids; hyperedge e is modelled by
/// the bridge pair in(e) = n + e and out(e) = n + |E| + e.
pub(crate) type NodeId = u32;

/// Practical infinity for capacities; large enough never to saturate, small
/// enough not to overflow when flows are summed.
pub(crate) const INFINITE_CAPACITY: Flow = Flow::MAX / 4;

/// One directed arc of the residual graph. The reverse arc is allocated
/// alongside with capacity zero; arcs reference their hyperedge by id.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlowEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub capacity: Flow,
    pub flow: Flow,
    pub reverse: u32,
    pub hyperedge: HyperedgeId,
}

/// Versioned flag array: `reset` is O(1), membership is a stamp compare.
pub(crate) struct StampedFlags {
    stamp: Vec<u32>,
    current: u32,
}

impl StampedFlags {
    pub(crate) fn new(size: usize) -> Self {
        StampedFlags {
            stamp: vec![0; size],
            current: 1,
        }
    }

    pub(crate) fn set(&mut self, i: usize) {
        self.stamp[i] = self.current;
    }

    pub(crate) fn get(&self, i: usize) -> bool {
        self.stamp[i] == self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current += 1;
    }
}

/// Outcome of extracting the flow region around a block-pair boundary.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BuildOutcome {
    Built { cut_before: HyperedgeWeight },
    EntireBlockExtracted,
    EmptyCut,
}

/// Directed flow network over a bounded region around the cut between two
/// blocks. Nodes and arcs live in contiguous arenas that are reset between
/// refinement invocations.
pub(crate) struct FlowNetwork {
    num_hypernodes: usize,
    num_hyperedges: usize,

    node_flags: StampedFlags,
    nodes: Vec<NodeId>,
    source_flags: StampedFlags,
    sources: Vec<NodeId>,
    sink_flags: StampedFlags,
    sinks: Vec<NodeId>,

    region_flags: StampedFlags,
    region: Vec<HypernodeId>,

    edges: Vec<FlowEdge>,
    adjacency: Vec<Vec<u32>>,

    he_flags: StampedFlags,
    modelled_hyperedges: Vec<HyperedgeId>,

    total_hyperedge_weight: HyperedgeWeight,
}

impl FlowNetwork {
    pub(crate) fn new(hg: &Hypergraph) -> Self {
        let n = hg.initial_num_nodes();
        let m = hg.initial_num_edges();
        let id_space = n + 2 * m;
        FlowNetwork {
            num_hypernodes: n,
            num_hyperedges: m,
            node_flags: StampedFlags::new(id_space),
            nodes: vec![],
            source_flags: StampedFlags::new(id_space),
            sources: vec![],
            sink_flags: StampedFlags::new(id_space),
            sinks: vec![],
            region_flags: StampedFlags::new(n),
            region: vec![],
            edges: vec![],
            adjacency: vec![vec![]; id_space],
            he_flags: StampedFlags::new(m),
            modelled_hyperedges: vec![],
            total_hyperedge_weight: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        for &u in &self.nodes {
            self.adjacency[u as usize].clear();
        }
        self.nodes.clear();
        self.sources.clear();
        self.sinks.clear();
        self.region.clear();
        self.edges.clear();
        self.modelled_hyperedges.clear();
        self.node_flags.reset();
        self.source_flags.reset();
        self.sink_flags.reset();
        self.region_flags.reset();
        self.he_flags.reset();
        self.total_hyperedge_weight = 0;
    }

    pub(crate) fn in_node(&self, e: HyperedgeId) -> NodeId {
        self.num_hypernodes as NodeId + e
    }

    pub(crate) fn out_node(&self, e: HyperedgeId) -> NodeId {
        (self.num_hypernodes + self.num_hyperedges) as NodeId + e
    }

    pub(crate) fn is_hypernode(&self, u: NodeId) -> bool {
        (u as usize) < self.num_hypernodes
    }

    pub(crate) fn bridge_hyperedge(&self, u: NodeId) -> HyperedgeId {
        debug_assert!(!self.is_hypernode(u));
        ((u as usize - self.num_hypernodes) % self.num_hyperedges) as HyperedgeId
    }

    pub(crate) fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub(crate) fn sinks(&self) -> &[NodeId] {
        &self.sinks
    }

    pub(crate) fn is_source(&self, u: NodeId) -> bool {
        self.source_flags.get(u as usize)
    }

    pub(crate) fn is_sink(&self, u: NodeId) -> bool {
        self.sink_flags.get(u as usize)
    }

    /// All hypernodes of the extracted region, including those a policy left
    /// out of the node set.
    pub(crate) fn region_hypernodes(&self) -> &[HypernodeId] {
        &self.region
    }

    pub(crate) fn contains_hypernode(&self, v: HypernodeId) -> bool {
        self.region_flags.get(v as usize)
    }

    pub(crate) fn is_network_node(&self, u: NodeId) -> bool {
        self.node_flags.get(u as usize)
    }

    pub(crate) fn degree(&self, u: NodeId) -> usize {
        self.adjacency[u as usize].len()
    }

    pub(crate) fn incident_edge(&self, u: NodeId, i: usize) -> u32 {
        self.adjacency[u as usize][i]
    }

    pub(crate) fn edge(&self, id: u32) -> FlowEdge {
        self.edges[id as usize]
    }

    pub(crate) fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn residual_capacity(&self, id: u32) -> Flow {
        let e = &self.edges[id as usize];
        e.capacity - e.flow
    }

    pub(crate) fn increase_flow(&mut self, id: u32, delta: Flow) {
        let reverse = self.edges[id as usize].reverse;
        self.edges[id as usize].flow += delta;
        self.edges[reverse as usize].flow -= delta;
        debug_assert!(self.edges[id as usize].flow <= self.edges[id as usize].capacity);
    }

    /// Sum of modelled hyperedge weights, the engines' practical infinity.
    pub(crate) fn total_hyperedge_weight(&self) -> HyperedgeWeight {
        self.total_hyperedge_weight
    }

    /// A flow problem without sources or without sinks has only the trivial
    /// cut; the caller abandons the block pair.
    pub(crate) fn is_trivial(&self) -> bool {
        self.sources.is_empty() || self.sinks.is_empty()
    }

    fn add_node(&mut self, u: NodeId) {
        if !self.node_flags.get(u as usize) {
            self.node_flags.set(u as usize);
            self.nodes.push(u);
        }
    }

    fn mark_source(&mut self, u: NodeId) {
        if !self.source_flags.get(u as usize) {
            self.source_flags.set(u as usize);
            self.sources.push(u);
        }
    }

    fn mark_sink(&mut self, u: NodeId) {
        if !self.sink_flags.get(u as usize) {
            self.sink_flags.set(u as usize);
            self.sinks.push(u);
        }
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, capacity: Flow, hyperedge: HyperedgeId) {
        debug_assert_ne!(from, to);
        self.add_node(from);
        self.add_node(to);
        let forward = self.edges.len() as u32;
        self.edges.push(FlowEdge {
            source: from,
            target: to,
            capacity,
            flow: 0,
            reverse: forward + 1,
            hyperedge,
        });
        self.edges.push(FlowEdge {
            source: to,
            target: from,
            capacity: 0,
            flow: 0,
            reverse: forward,
            hyperedge,
        });
        self.adjacency[from as usize].push(forward);
        self.adjacency[to as usize].push(forward + 1);
    }

    pub(crate) fn add_hypernode(&mut self, v: HypernodeId) {
        if !self.region_flags.get(v as usize) {
            self.region_flags.set(v as usize);
            self.region.push(v);
        }
    }

    /// Weight-bounded BFS from the cut hyperedges into both blocks. The
    /// advance on each side is bounded by the slack the opposite block could
    /// absorb, scaled by α.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_region(
        &mut self,
        hg: &Hypergraph,
        context: &Context,
        cut_hyperedges: &[HyperedgeId],
        alpha: f64,
        block_0: PartitionId,
        block_1: PartitionId,
        random: &mut Random,
    ) -> Option<BuildOutcome> {
        if cut_hyperedges.is_empty() {
            return Some(BuildOutcome::EmptyCut);
        }
        let average = (hg.total_weight() as f64 / hg.k() as f64).ceil();
        let bound = |other: PartitionId| -> NodeWeight {
            let cap = (1.0 + alpha * context.partition.epsilon) * average;
            (cap as NodeWeight - hg.part_weight(other)).max(0)
        };
        let mut shuffled: Vec<HyperedgeId> = cut_hyperedges.to_vec();
        random.shuffle(&mut shuffled);

        for &(block, other) in &[(block_0, block_1), (block_1, block_0)] {
            let bound = bound(other);
            let mut weight: NodeWeight = 0;
            let mut queue: VecDeque<HypernodeId> = VecDeque::new();
            for &e in &shuffled {
                for p in hg.pins(e) {
                    if hg.part(p) == block && !hg.is_fixed(p) && !self.contains_hypernode(p) {
                        if weight + hg.node_weight(p) > bound {
                            continue;
                        }
                        weight += hg.node_weight(p);
                        self.add_hypernode(p);
                        queue.push_back(p);
                    }
                }
            }
            while let Some(v) = queue.pop_front() {
                for w in hg.adjacent_nodes(v) {
                    if hg.part(w) == block && !hg.is_fixed(w) && !self.contains_hypernode(w) {
                        if weight + hg.node_weight(w) > bound {
                            continue;
                        }
                        weight += hg.node_weight(w);
                        self.add_hypernode(w);
                        queue.push_back(w);
                    }
                }
            }
            if weight >= hg.part_weight(block) && hg.part_weight(block) > 0 {
                return Some(BuildOutcome::EntireBlockExtracted);
            }
        }
        None
    }

    /// Region extraction and arc assembly in one step; the refiner switches
    /// on the outcome.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_flow_problem(
        &mut self,
        hg: &Hypergraph,
        context: &Context,
        cut_hyperedges: &[HyperedgeId],
        alpha: f64,
        block_0: PartitionId,
        block_1: PartitionId,
        random: &mut Random,
    ) -> BuildOutcome {
        self.reset();
        if let Some(outcome) =
            self.build_region(hg, context, cut_hyperedges, alpha, block_0, block_1, random)
        {
            return outcome;
        }
        let cut_before = self.build(hg, context, block_0, block_1);
        BuildOutcome::Built { cut_before }
    }

    /// Assembles the arcs for the current region under the configured
    /// modelling policy and returns the weight of the currently cut
    /// hyperedges among those modelled.
    pub(crate) fn build(
        &mut self,
        hg: &Hypergraph,
        context: &Context,
        block_0: PartitionId,
        block_1: PartitionId,
    ) -> HyperedgeWeight {
        let policy = context.local_search.flow.network;

        for i in 0..self.region.len() {
            let v = self.region[i];
            for e in hg.incident_edges(v) {
                if !self.he_flags.get(e as usize) {
                    self.he_flags.set(e as usize);
                    self.modelled_hyperedges.push(e);
                }
            }
        }

        let mut cut_before = 0;
        let mut bridge_arcs: HashSet<(NodeId, NodeId)> = HashSet::new();
        let hyperedges = std::mem::take(&mut self.modelled_hyperedges);
        for &e in &hyperedges {
            self.total_hyperedge_weight += hg.edge_weight(e);
            if hg.pin_count_in_part(e, block_0) > 0 && hg.pin_count_in_part(e, block_1) > 0 {
                cut_before += hg.edge_weight(e);
            }
            if use_direct_arcs(policy) && hg.edge_size(e) == 2 {
                self.build_direct(hg, e, block_0, block_1);
            } else {
                self.build_bridged(hg, policy, e, block_0, block_1, &mut bridge_arcs);
            }
        }
        self.modelled_hyperedges = hyperedges;
        cut_before
    }

    /// A 2-pin hyperedge collapses into plain graph arcs of capacity ω(e).
    fn build_direct(
        &mut self,
        hg: &Hypergraph,
        e: HyperedgeId,
        block_0: PartitionId,
        block_1: PartitionId,
    ) {
        let weight = hg.edge_weight(e);
        let pins: Vec<HypernodeId> = hg.pins(e).collect();
        let inside: Vec<HypernodeId> = pins
            .iter()
            .copied()
            .filter(|&p| self.contains_hypernode(p))
            .collect();
        match inside.len() {
            2 => {
                self.add_edge(inside[0], inside[1], weight, e);
                self.add_edge(inside[1], inside[0], weight, e);
            }
            1 => {
                let u = inside[0];
                let outside = pins.iter().copied().find(|&p| !self.contains_hypernode(p));
                let Some(p) = outside else {
                    return;
                };
                let part = hg.part(p);
                if part == block_0 || (part != block_1 && part != block_0) {
                    // Source side, or a third block which keeps e cut in
                    // both directions.
                    let in_e = self.in_node(e);
                    self.add_edge(in_e, u, weight, e);
                    self.mark_source(in_e);
                }
                if part == block_1 || (part != block_0 && part != block_1) {
                    let out_e = self.out_node(e);
                    self.add_edge(u, out_e, weight, e);
                    self.mark_sink(out_e);
                }
            }
            _ => {}
        }
    }

    /// Lawler bridge model, with the Heuer refinement that elides low-degree
    /// hypernodes from the node set and wires their hyperedges directly.
    fn build_bridged(
        &mut self,
        hg: &Hypergraph,
        policy: FlowNetworkPolicy,
        e: HyperedgeId,
        block_0: PartitionId,
        block_1: PartitionId,
        bridge_arcs: &mut HashSet<(NodeId, NodeId)>,
    ) {
        let weight = hg.edge_weight(e);
        let in_e = self.in_node(e);
        let out_e = self.out_node(e);
        self.add_edge(in_e, out_e, weight, e);

        for p in hg.pins(e).collect::<Vec<_>>() {
            if !self.contains_hypernode(p) {
                let part = hg.part(p);
                if part == block_0 || (part != block_0 && part != block_1) {
                    self.mark_source(in_e);
                }
                if part == block_1 || (part != block_0 && part != block_1) {
                    self.mark_sink(out_e);
                }
                continue;
            }
            if self.keeps_hypernode(hg, policy, p) {
                self.add_edge(p, in_e, INFINITE_CAPACITY, e);
                self.add_edge(out_e, p, INFINITE_CAPACITY, e);
            } else {
                // The elided pin is represented by arcs between the bridges
                // of its hyperedges.
                for f in hg.incident_edges(p).collect::<Vec<_>>() {
                    if f == e {
                        continue;
                    }
                    let arc = (out_e, self.in_node(f));
                    if bridge_arcs.insert(arc) {
                        self.add_edge(arc.0, arc.1, INFINITE_CAPACITY, e);
                    }
                }
            }
        }
    }

    fn keeps_hypernode(&self, hg: &Hypergraph, policy: FlowNetworkPolicy, v: HypernodeId) -> bool {
        match policy {
            FlowNetworkPolicy::Lawler | FlowNetworkPolicy::Wong => true,
            FlowNetworkPolicy::Heuer => hg.node_degree(v) > 3,
            FlowNetworkPolicy::Hybrid => {
                hg.node_degree(v) > 3 || hg.incident_edges(v).any(|f| hg.edge_size(f) == 2)
            }
        }
    }
}

fn use_direct_arcs(policy: FlowNetworkPolicy) -> bool {
    matches!(policy, FlowNetworkPolicy::Wong | FlowNetworkPolicy::Hybrid)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The ten-vertex, seven-hyperedge fixture exercised by all four
    /// modelling policies.
    fn fixture() -> Hypergraph {
        let nets = vec![
            vec![0, 1, 2, 3, 4],
            vec![4, 5],
            vec![5, 6],
            vec![5, 7],
            vec![5, 6, 7],
            vec![6, 8],
            vec![7, 9],
        ];
        let mut hg = Hypergraph::new(2, &[1; 10], &[1; 7], &nets);
        for v in [0, 2, 4, 9] {
            hg.set_node_part(v, 0);
        }
        for v in [1, 3, 5, 6, 7, 8] {
            hg.set_node_part(v, 1);
        }
        hg
    }

    fn build(policy: FlowNetworkPolicy) -> (Hypergraph, FlowNetwork) {
        let hg = fixture();
        let mut context = Context::default();
        context.partition.k = 2;
        context.local_search.flow.network = policy;
        let mut network = FlowNetwork::new(&hg);
        network.reset();
        for v in 2..=7 {
            network.add_hypernode(v);
        }
        network.build(&hg, &context, 0, 1);
        (hg, network)
    }

    fn node_set(network: &FlowNetwork) -> Vec<NodeId> {
        let mut nodes = network.nodes().to_vec();
        nodes.sort_unstable();
        nodes
    }

    /// Outgoing arcs with remaining residual capacity, as (target, capacity).
    fn arcs_of(network: &FlowNetwork, u: NodeId) -> Vec<(NodeId, Flow)> {
        let mut arcs: Vec<(NodeId, Flow)> = (0..network.degree(u))
            .map(|i| network.edge(network.incident_edge(u, i)))
            .filter(|e| e.capacity - e.flow > 0)
            .map(|e| (e.target, e.capacity))
            .collect();
        arcs.sort_unstable();
        arcs
    }

    fn assert_sources_and_sinks(network: &FlowNetwork, sources: &[NodeId], sinks: &[NodeId]) {
        for &u in network.nodes() {
            assert_eq!(network.is_source(u), sources.contains(&u), "source flag of {u}");
            assert_eq!(network.is_sink(u), sinks.contains(&u), "sink flag of {u}");
        }
        assert_eq!(network.sources().len(), sources.len());
        assert_eq!(network.sinks().len(), sinks.len());
    }

    const INF: Flow = INFINITE_CAPACITY;

    #[test]
    fn lawler_network_structure() {
        let (_, network) = build(FlowNetworkPolicy::Lawler);
        // in(e) = 10 + e, out(e) = 17 + e.
        assert_eq!(
            node_set(&network),
            vec![2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23]
        );
        assert_eq!(arcs_of(&network, 2), vec![(10, INF)]);
        assert_eq!(arcs_of(&network, 4), vec![(10, INF), (11, INF)]);
        assert_eq!(
            arcs_of(&network, 5),
            vec![(11, INF), (12, INF), (13, INF), (14, INF)]
        );
        assert_eq!(arcs_of(&network, 10), vec![(17, 1)]);
        assert_eq!(arcs_of(&network, 17), vec![(2, INF), (3, INF), (4, INF)]);
        assert_eq!(arcs_of(&network, 14), vec![(21, 1)]);
        assert_eq!(arcs_of(&network, 21), vec![(5, INF), (6, INF), (7, INF)]);
        assert_sources_and_sinks(&network, &[10, 16], &[17, 22]);
    }

    #[test]
    fn heuer_network_elides_low_degree_hypernodes() {
        let (_, network) = build(FlowNetworkPolicy::Heuer);
        assert_eq!(
            node_set(&network),
            vec![5, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23]
        );
        assert_eq!(arcs_of(&network, 10), vec![(17, 1)]);
        assert_eq!(arcs_of(&network, 17), vec![(11, INF)]);
        assert_eq!(arcs_of(&network, 11), vec![(18, 1)]);
        assert_eq!(
            arcs_of(&network, 5),
            vec![(11, INF), (12, INF), (13, INF), (14, INF)]
        );
        assert_eq!(
            arcs_of(&network, 21),
            vec![(5, INF), (12, INF), (13, INF), (15, INF), (16, INF)]
        );
        assert_eq!(arcs_of(&network, 22), vec![(12, INF), (14, INF)]);
        assert_sources_and_sinks(&network, &[10, 16], &[17, 22]);
    }

    #[test]
    fn wong_network_collapses_two_pin_hyperedges() {
        let (_, network) = build(FlowNetworkPolicy::Wong);
        assert_eq!(
            node_set(&network),
            vec![2, 3, 4, 5, 6, 7, 10, 14, 16, 17, 21, 22]
        );
        assert_eq!(arcs_of(&network, 4), vec![(5, 1), (10, INF)]);
        assert_eq!(arcs_of(&network, 5), vec![(4, 1), (6, 1), (7, 1), (14, INF)]);
        assert_eq!(arcs_of(&network, 16), vec![(7, 1)]);
        assert_eq!(arcs_of(&network, 17), vec![(2, INF), (3, INF), (4, INF)]);
        assert_eq!(arcs_of(&network, 21), vec![(5, INF), (6, INF), (7, INF)]);
        assert_sources_and_sinks(&network, &[10, 16], &[17, 22]);
    }

    #[test]
    fn hybrid_network_combines_both_reductions() {
        let (_, network) = build(FlowNetworkPolicy::Hybrid);
        assert_eq!(
            node_set(&network),
            vec![4, 5, 6, 7, 10, 14, 16, 17, 21, 22]
        );
        assert_eq!(arcs_of(&network, 4), vec![(5, 1), (10, INF)]);
        assert_eq!(arcs_of(&network, 5), vec![(4, 1), (6, 1), (7, 1), (14, INF)]);
        assert_eq!(arcs_of(&network, 16), vec![(7, 1)]);
        assert_eq!(arcs_of(&network, 17), vec![(4, INF)]);
        assert_eq!(arcs_of(&network, 21), vec![(5, INF), (6, INF), (7, INF)]);
        assert_sources_and_sinks(&network, &[10, 16], &[17, 22]);
    }

    #[test]
    fn cut_before_counts_modelled_cut_hyperedges() {
        let hg = fixture();
        let mut context = Context::default();
        context.partition.k = 2;
        context.local_search.flow.network = FlowNetworkPolicy::Lawler;
        let mut network = FlowNetwork::new(&hg);
        network.reset();
        for v in 2..=7 {
            network.add_hypernode(v);
        }
        let cut_before = network.build(&hg, &context, 0, 1);
        // Cut hyperedges: {0,1,2,3,4}, {4,5}, {7,9}.
        assert_eq!(cut_before, 3);
    }

    #[test]
    fn empty_cut_and_entire_block_outcomes() {
        let hg = fixture();
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.03;
        let mut random = Random::with_seed(1);
        let mut network = FlowNetwork::new(&hg);
        network.reset();
        assert_eq!(
            network.build_region(&hg, &context, &[], 1.0, 0, 1, &mut random),
            Some(BuildOutcome::EmptyCut)
        );
        // A huge α lets the region swallow a whole block.
        network.reset();
        let cut: Vec<HyperedgeId> = vec![0, 1, 5, 6];
        let outcome = network.build_region(&hg, &context, &cut, 1000.0, 0, 1, &mut random);
        assert_eq!(outcome, Some(BuildOutcome::EntireBlockExtracted));
    }

    #[test]
    fn region_growth_respects_the_weight_bound() {
        let hg = fixture();
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.1;
        let mut random = Random::with_seed(2);
        let mut network = FlowNetwork::new(&hg);
        network.reset();
        let cut: Vec<HyperedgeId> = vec![0, 1, 6];
        let outcome = network.build_region(&hg, &context, &cut, 1.0, 0, 1, &mut random);
        assert_eq!(outcome, None);
        // Block-0 side bound: (1 + 0.1) * 5 - 6 < 0, so nothing joins from
        // block 0; block-1 side bound is 1, admitting a single unit vertex.
        assert_eq!(network.region_hypernodes().len(), 1);
        assert_eq!(hg.part(network.region_hypernodes()[0]), 1);
    }
}
