use std::collections::VecDeque;

use crate::context::{Context, FlowAlgorithm};
use crate::error::Result;
use crate::flow_network::{FlowNetwork, NodeId, StampedFlags};
use crate::hypergraph::Hypergraph;
use crate::most_balanced;
use crate::services::Random;
use crate::{Flow, HypernodeId, PartitionId};

/// Sparse array with O(1) bulk reset through version stamps.
pub(crate) struct StampedArray<T: Copy> {
    values: Vec<T>,
    stamp: Vec<u32>,
    current: u32,
    default: T,
}

impl<T: Copy> StampedArray<T> {
    pub(crate) fn new(size: usize, default: T) -> Self {
        StampedArray {
            values: vec![default; size],
            stamp: vec![0; size],
            current: 1,
            default,
        }
    }

    pub(crate) fn get(&self, i: usize) -> T {
        if self.stamp[i] == self.current {
            self.values[i]
        } else {
            self.default
        }
    }

    pub(crate) fn set(&mut self, i: usize, value: T) {
        self.values[i] = value;
        self.stamp[i] = self.current;
    }

    pub(crate) fn reset(&mut self) {
        self.current += 1;
    }
}

impl StampedArray<i64> {
    fn update(&mut self, i: usize, delta: i64) {
        let value = self.get(i) + delta;
        self.set(i, value);
    }
}

/// Solves the minimum s-t cut on a built flow network and carries the moves
/// back into the hypergraph. `minimum_st_cut` returns `None` for the trivial
/// cut, which aborts only the current block-pair refinement.
pub(crate) struct MinCutSolver {
    parent: StampedArray<i64>,
    visited: StampedFlags,
    queue: VecDeque<NodeId>,
    original_part: Vec<PartitionId>,
}

const NO_PARENT: i64 = -1;

impl MinCutSolver {
    pub(crate) fn new(hg: &Hypergraph) -> Self {
        let id_space = hg.initial_num_nodes() + 2 * hg.initial_num_edges();
        MinCutSolver {
            parent: StampedArray::new(id_space, NO_PARENT),
            visited: StampedFlags::new(id_space),
            queue: VecDeque::new(),
            original_part: vec![0; hg.initial_num_nodes()],
        }
    }

    pub(crate) fn original_partition(&self, v: HypernodeId) -> PartitionId {
        self.original_part[v as usize]
    }

    /// Computes the maximum flow and updates the hypernode partition along
    /// the minimum cut. All bookkeeping goes through `change_node_part` so
    /// pin counts and block weights stay consistent.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn minimum_st_cut(
        &mut self,
        hg: &mut Hypergraph,
        network: &mut FlowNetwork,
        context: &Context,
        random: &mut Random,
        block_0: PartitionId,
        block_1: PartitionId,
    ) -> Result<Option<Flow>> {
        if network.is_trivial() {
            return Ok(None);
        }

        let use_mbmc = context.local_search.flow.use_most_balanced_minimum_cut;
        let default_part = if use_mbmc { block_0 } else { block_1 };
        for &hn in network.region_hypernodes() {
            self.original_part[hn as usize] = hg.part(hn);
            move_hypernode(hg, hn, default_part)?;
        }

        let cut = match context.local_search.flow.algorithm {
            FlowAlgorithm::EdmondsKarp => self.edmonds_karp(network),
            FlowAlgorithm::GoldbergTarjan => {
                let mut engine = GoldbergTarjan::new(network);
                engine.maximum_flow(self, network)
            }
        };

        if use_mbmc {
            most_balanced::most_balanced_minimum_cut(
                hg, network, context, random, block_0, block_1,
            )?;
        } else {
            self.assign_source_side(hg, network, block_0)?;
        }

        Ok(Some(cut))
    }

    /// Restores (or swaps in) the remembered block of every region node.
    pub(crate) fn rollback(&mut self, hg: &mut Hypergraph, network: &FlowNetwork, store_current: bool) -> Result<()> {
        for &hn in network.region_hypernodes() {
            let current = hg.part(hn);
            move_hypernode(hg, hn, self.original_part[hn as usize])?;
            if store_current {
                self.original_part[hn as usize] = current;
            }
        }
        Ok(())
    }

    /// Breadth-first search over the residual graph from all sources.
    /// Returns whether a sink is still reachable.
    fn bfs(&mut self, network: &FlowNetwork) -> bool {
        self.parent.reset();
        self.visited.reset();
        self.queue.clear();
        let mut augmenting_path_exists = false;

        for &s in network.sources() {
            self.visited.set(s as usize);
            self.queue.push_back(s);
        }

        while let Some(u) = self.queue.pop_front() {
            if network.is_sink(u) {
                augmenting_path_exists = true;
                continue;
            }
            for i in 0..network.degree(u) {
                let id = network.incident_edge(u, i);
                let edge = network.edge(id);
                if !self.visited.get(edge.target as usize) && network.residual_capacity(id) > 0 {
                    self.parent.set(edge.target as usize, id as i64);
                    self.visited.set(edge.target as usize);
                    self.queue.push_back(edge.target);
                }
            }
        }
        augmenting_path_exists
    }

    /// Walks the parent chain of a reached sink, pushing the bottleneck
    /// residual along the path.
    fn augment(&mut self, network: &mut FlowNetwork, sink: NodeId) -> Flow {
        let mut bottleneck = Flow::MAX;
        let mut u = sink;
        while self.parent.get(u as usize) != NO_PARENT {
            let id = self.parent.get(u as usize) as u32;
            bottleneck = bottleneck.min(network.residual_capacity(id));
            u = network.edge(id).source;
        }
        if !network.is_source(u) || bottleneck == 0 || bottleneck == Flow::MAX {
            return 0;
        }
        let mut u = sink;
        while self.parent.get(u as usize) != NO_PARENT {
            let id = self.parent.get(u as usize) as u32;
            network.increase_flow(id, bottleneck);
            u = network.edge(id).source;
        }
        bottleneck
    }

    fn edmonds_karp(&mut self, network: &mut FlowNetwork) -> Flow {
        let mut max_flow = 0;
        while self.bfs(network) {
            for i in 0..network.sinks().len() {
                let t = network.sinks()[i];
                if self.parent.get(t as usize) != NO_PARENT {
                    max_flow += self.augment(network, t);
                }
            }
        }
        max_flow
    }

    /// Forward residual BFS from the sources; every reached node (and every
    /// region pin of a reached bridge) joins `block`, the rest stays put.
    fn assign_source_side(
        &mut self,
        hg: &mut Hypergraph,
        network: &FlowNetwork,
        block: PartitionId,
    ) -> Result<()> {
        self.visited.reset();
        self.queue.clear();
        for &s in network.sources() {
            self.visited.set(s as usize);
            self.queue.push_back(s);
        }
        while let Some(u) = self.queue.pop_front() {
            if network.is_hypernode(u) {
                move_hypernode(hg, u, block)?;
            } else {
                let he = network.bridge_hyperedge(u);
                for pin in hg.pins(he).collect::<Vec<_>>() {
                    if network.contains_hypernode(pin) {
                        move_hypernode(hg, pin, block)?;
                    }
                }
            }
            if network.is_sink(u) {
                continue;
            }
            for i in 0..network.degree(u) {
                let id = network.incident_edge(u, i);
                let edge = network.edge(id);
                if !self.visited.get(edge.target as usize) && network.residual_capacity(id) > 0 {
                    self.visited.set(edge.target as usize);
                    self.queue.push_back(edge.target);
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn has_augmenting_path(&mut self, network: &FlowNetwork) -> bool {
        self.bfs(network)
    }
}

fn move_hypernode(hg: &mut Hypergraph, hn: HypernodeId, to: PartitionId) -> Result<()> {
    let from = hg.part(hn);
    if from != to {
        hg.change_node_part(hn, from, to)?;
    }
    Ok(())
}

/// FIFO push-relabel with the gap heuristic and periodic global relabeling.
struct GoldbergTarjan {
    num_nodes: usize,
    excess: StampedArray<Flow>,
    distance: StampedArray<i64>,
    count: StampedArray<i64>,
    active: StampedArray<bool>,
    edge_iter: Vec<usize>,
    queue: VecDeque<NodeId>,
    work: usize,
}

impl GoldbergTarjan {
    fn new(network: &FlowNetwork) -> Self {
        let id_space = network.nodes().iter().map(|&u| u as usize + 1).max().unwrap_or(0);
        let num_nodes = network.num_nodes() + 2;
        GoldbergTarjan {
            num_nodes,
            excess: StampedArray::new(id_space, 0),
            distance: StampedArray::new(id_space, 0),
            count: StampedArray::new(num_nodes + 2, 0),
            active: StampedArray::new(id_space, false),
            edge_iter: vec![0; id_space],
            queue: VecDeque::new(),
            work: 0,
        }
    }

    fn maximum_flow(&mut self, solver: &mut MinCutSolver, network: &mut FlowNetwork) -> Flow {
        self.init(network);
        self.global_relabeling(solver, network);

        let mut max_flow = 0;
        while let Some(cur) = self.queue.pop_front() {
            self.active.set(cur as usize, false);
            if network.is_source(cur) && self.distance.get(cur as usize) == self.num_nodes as i64 + 1
            {
                self.excess.set(cur as usize, 0);
            } else if network.is_sink(cur) && self.distance.get(cur as usize) == 1 {
                max_flow += self.excess.get(cur as usize);
                self.excess.set(cur as usize, 0);
            } else {
                self.discharge(network, cur);
            }

            self.work += 1;
            if self.work > self.num_nodes {
                self.global_relabeling(solver, network);
                self.work = 0;
            }
        }
        max_flow
    }

    fn init(&mut self, network: &mut FlowNetwork) {
        self.excess.reset();
        self.distance.reset();
        self.count.reset();
        self.active.reset();
        self.queue.clear();

        for &node in network.nodes() {
            self.edge_iter[node as usize] = 0;
        }

        self.count.set(0, self.num_nodes as i64 - 1);
        let initial_infinity = network.total_hyperedge_weight();
        let sources: Vec<NodeId> = network.sources().to_vec();
        for s in sources {
            self.excess.set(s as usize, initial_infinity);
            if network.is_hypernode(s) {
                // A hypernode source pushes its surplus once and retires.
                self.excess.set(s as usize, 0);
                self.update_distance(s, self.num_nodes as i64 + 1);
                for i in 0..network.degree(s) {
                    let id = network.incident_edge(s, i);
                    let residual = network.residual_capacity(id);
                    if residual > 0 {
                        let target = network.edge(id).target;
                        let push = initial_infinity.min(residual);
                        self.excess.update(target as usize, push);
                        network.increase_flow(id, push);
                        self.enqueue(target);
                    }
                }
            }
            self.enqueue(s);
        }
    }

    fn push(&mut self, network: &mut FlowNetwork, id: u32) {
        let edge = network.edge(id);
        let (u, v) = (edge.source, edge.target);
        let delta = self
            .excess
            .get(u as usize)
            .min(network.residual_capacity(id));
        if self.distance.get(u as usize) != self.distance.get(v as usize) + 1 || delta == 0 {
            return;
        }
        self.excess.update(u as usize, -delta);
        self.excess.update(v as usize, delta);
        network.increase_flow(id, delta);
        self.enqueue(v);
    }

    fn gap_heuristic(&mut self, network: &FlowNetwork, gap: i64) {
        for i in 0..network.nodes().len() {
            let node = network.nodes()[i];
            let node_dist = self.distance.get(node as usize);
            if node_dist < gap || node_dist >= self.num_nodes as i64 {
                continue;
            }
            self.update_distance(node, self.num_nodes as i64);
            self.enqueue(node);
        }
    }

    fn global_relabeling(&mut self, solver: &mut MinCutSolver, network: &FlowNetwork) {
        solver.visited.reset();
        solver.queue.clear();
        for &t in network.sinks() {
            self.update_distance(t, 1);
            solver.visited.set(t as usize);
            solver.queue.push_back(t);
        }
        while let Some(node) = solver.queue.pop_front() {
            self.edge_iter[node as usize] = 0;
            for i in 0..network.degree(node) {
                let id = network.incident_edge(node, i);
                let edge = network.edge(id);
                let target = edge.target;
                if !solver.visited.get(target as usize)
                    && network.residual_capacity(edge.reverse) > 0
                    && !network.is_source(target)
                {
                    self.update_distance(target, self.distance.get(node as usize) + 1);
                    solver.visited.set(target as usize);
                    solver.queue.push_back(target);
                }
            }
        }
    }

    fn update_distance(&mut self, u: NodeId, value: i64) {
        let old = self.distance.get(u as usize);
        if old < self.num_nodes as i64 {
            self.count.update(old as usize, -1);
        }
        if value < self.num_nodes as i64 {
            self.count.update(value as usize, 1);
        }
        self.distance.set(u as usize, value);
    }

    fn relabel(&mut self, network: &FlowNetwork, u: NodeId) {
        if network.is_sink(u) {
            self.update_distance(u, 1);
            return;
        }
        let mut label = if network.is_source(u) {
            self.num_nodes as i64
        } else {
            i64::MAX / 2
        };
        for i in 0..network.degree(u) {
            let id = network.incident_edge(u, i);
            if network.residual_capacity(id) > 0 {
                label = label.min(self.distance.get(network.edge(id).target as usize));
            }
        }
        self.update_distance(u, label + 1);
    }

    fn enqueue(&mut self, u: NodeId) {
        if self.active.get(u as usize) {
            return;
        }
        if self.excess.get(u as usize) > 0 {
            self.active.set(u as usize, true);
            self.queue.push_back(u);
        }
    }

    fn discharge(&mut self, network: &mut FlowNetwork, u: NodeId) {
        while self.excess.get(u as usize) > 0 {
            while self.edge_iter[u as usize] < network.degree(u) {
                let id = network.incident_edge(u, self.edge_iter[u as usize]);
                if network.residual_capacity(id) > 0 {
                    self.push(network, id);
                }
                if self.excess.get(u as usize) == 0 {
                    break;
                }
                self.edge_iter[u as usize] += 1;
            }

            if self.edge_iter[u as usize] >= network.degree(u) {
                let cur_dist = self.distance.get(u as usize);
                if cur_dist < self.num_nodes as i64 && self.count.get(cur_dist as usize) == 1 {
                    self.gap_heuristic(network, cur_dist);
                } else {
                    self.relabel(network, u);
                }
                self.edge_iter[u as usize] = 0;
            }

            if network.is_source(u) && self.distance.get(u as usize) == self.num_nodes as i64 + 1 {
                self.excess.set(u as usize, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FlowNetworkPolicy, Objective};
    use crate::flow_network::BuildOutcome;
    use crate::metrics;

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

    fn flow_context(algorithm: FlowAlgorithm, mbmc: bool) -> Context {
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.5;
        context.partition.objective = Objective::Cut;
        context.local_search.flow.algorithm = algorithm;
        context.local_search.flow.network = FlowNetworkPolicy::Lawler;
        context.local_search.flow.use_most_balanced_minimum_cut = mbmc;
        context.setup_part_weights(10);
        context
    }

    fn solve(algorithm: FlowAlgorithm, mbmc: bool) -> (Hypergraph, Flow) {
        let mut hg = fixture();
        let context = flow_context(algorithm, mbmc);
        let mut random = Random::with_seed(42);
        let mut network = FlowNetwork::new(&hg);
        let cut_hes: Vec<_> = hg
            .edges()
            .filter(|&e| hg.pin_count_in_part(e, 0) > 0 && hg.pin_count_in_part(e, 1) > 0)
            .collect();
        let outcome =
            network.build_flow_problem(&hg, &context, &cut_hes, 4.0, 0, 1, &mut random);
        let BuildOutcome::Built { cut_before } = outcome else {
            panic!("expected a built flow problem, got {outcome:?}");
        };
        let mut solver = MinCutSolver::new(&hg);
        let cut_after = solver
            .minimum_st_cut(&mut hg, &mut network, &context, &mut random, 0, 1)
            .unwrap()
            .expect("non-trivial cut");
        assert!(cut_after <= cut_before, "{cut_after} > {cut_before}");
        assert!(!solver.has_augmenting_path(&network));
        (hg, cut_after)
    }

    #[test]
    fn edmonds_karp_never_increases_the_cut() {
        let before = metrics::cut(&fixture());
        let (hg, cut_after) = solve(FlowAlgorithm::EdmondsKarp, false);
        assert!(cut_after <= before);
        assert!(metrics::cut(&hg) <= before);
        hg.check_invariants();
    }

    #[test]
    fn goldberg_tarjan_agrees_with_edmonds_karp() {
        let (_, ek) = solve(FlowAlgorithm::EdmondsKarp, false);
        let (_, gt) = solve(FlowAlgorithm::GoldbergTarjan, false);
        assert_eq!(ek, gt);
    }

    #[test]
    fn most_balanced_cut_keeps_the_flow_value() {
        let (_, plain) = solve(FlowAlgorithm::EdmondsKarp, false);
        let (hg, balanced) = solve(FlowAlgorithm::EdmondsKarp, true);
        assert_eq!(plain, balanced);
        assert!(metrics::cut(&hg) <= metrics::cut(&fixture()));
        hg.check_invariants();
    }

    #[test]
    fn rollback_restores_the_original_assignment() {
        let mut hg = fixture();
        let snapshot = hg.partition();
        let context = flow_context(FlowAlgorithm::EdmondsKarp, false);
        let mut random = Random::with_seed(7);
        let mut network = FlowNetwork::new(&hg);
        let cut_hes: Vec<_> = hg
            .edges()
            .filter(|&e| hg.pin_count_in_part(e, 0) > 0 && hg.pin_count_in_part(e, 1) > 0)
            .collect();
        let outcome =
            network.build_flow_problem(&hg, &context, &cut_hes, 4.0, 0, 1, &mut random);
        assert!(matches!(outcome, BuildOutcome::Built { .. }));
        let mut solver = MinCutSolver::new(&hg);
        solver
            .minimum_st_cut(&mut hg, &mut network, &context, &mut random, 0, 1)
            .unwrap();
        solver.rollback(&mut hg, &network, false).unwrap();
        assert_eq!(hg.partition(), snapshot);
        hg.check_invariants();
    }
}
