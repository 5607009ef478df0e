use std::collections::HashSet;

use log::debug;

use crate::context::Context;
use crate::error::Result;
use crate::flow_network::{FlowNetwork, NodeId};
use crate::hypergraph::Hypergraph;
use crate::services::Random;
use crate::{NodeWeight, PartitionId};

const TOPOLOGICAL_TRIALS: usize = 10;

/// Among all minimum s-t cuts of the solved flow network, picks the one whose
/// induced block weights are most balanced. Source-reachable nodes are pinned
/// to the source side and sink-reaching nodes to the sink side; the free
/// remainder is condensed into strongly connected components whose DAG is
/// swept along several random topological orders.
///
/// Precondition: every region hypernode currently sits in `block_0` and the
/// network holds a maximum flow.
pub(crate) fn most_balanced_minimum_cut(
    hg: &mut Hypergraph,
    network: &FlowNetwork,
    context: &Context,
    random: &mut Random,
    block_0: PartitionId,
    block_1: PartitionId,
) -> Result<()> {
    let nodes = network.nodes();
    let mut side_known: Vec<Option<bool>> = Vec::new(); // true = sink side
    let mut index_of: std::collections::HashMap<NodeId, usize> = std::collections::HashMap::new();
    for (i, &u) in nodes.iter().enumerate() {
        index_of.insert(u, i);
        side_known.push(None);
    }

    // Forward residual reachability from the sources.
    let mut stack: Vec<NodeId> = network.sources().to_vec();
    for &s in network.sources() {
        side_known[index_of[&s]] = Some(false);
    }
    while let Some(u) = stack.pop() {
        for i in 0..network.degree(u) {
            let id = network.incident_edge(u, i);
            let edge = network.edge(id);
            let t = index_of[&edge.target];
            if side_known[t].is_none() && network.residual_capacity(id) > 0 {
                side_known[t] = Some(false);
                stack.push(edge.target);
            }
        }
    }
    // Reverse residual reachability towards the sinks.
    let mut stack: Vec<NodeId> = vec![];
    for &t in network.sinks() {
        let i = index_of[&t];
        if side_known[i].is_none() {
            side_known[i] = Some(true);
            stack.push(t);
        }
    }
    while let Some(u) = stack.pop() {
        for i in 0..network.degree(u) {
            let id = network.incident_edge(u, i);
            let edge = network.edge(id);
            let t = index_of[&edge.target];
            // The arc target -> u has residual capacity, so target reaches a
            // sink through u.
            if side_known[t].is_none() && network.residual_capacity(edge.reverse) > 0 {
                side_known[t] = Some(true);
                stack.push(edge.target);
            }
        }
    }

    // Condense the free remainder into SCCs.
    let free: Vec<usize> = (0..nodes.len()).filter(|&i| side_known[i].is_none()).collect();
    let scc_of = tarjan_sccs(network, nodes, &index_of, &side_known);
    let num_sccs = free
        .iter()
        .map(|&i| scc_of[i] + 1)
        .max()
        .unwrap_or(0);

    let mut scc_weight: Vec<NodeWeight> = vec![0; num_sccs];
    for &i in &free {
        let u = nodes[i];
        if network.is_hypernode(u) {
            scc_weight[scc_of[i]] += hg.node_weight(u);
        }
    }

    let mut dag: Vec<Vec<usize>> = vec![vec![]; num_sccs];
    let mut indegree: Vec<usize> = vec![0; num_sccs];
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    for &i in &free {
        let u = nodes[i];
        for a in 0..network.degree(u) {
            let id = network.incident_edge(u, a);
            let edge = network.edge(id);
            if network.residual_capacity(id) == 0 {
                continue;
            }
            let t = index_of[&edge.target];
            if side_known[t].is_some() || scc_of[t] == scc_of[i] {
                continue;
            }
            if seen.insert((scc_of[i], scc_of[t])) {
                dag[scc_of[i]].push(scc_of[t]);
                indegree[scc_of[t]] += 1;
            }
        }
    }

    // Weight pinned to the sink side no matter the sweep.
    let pinned_sink_weight: NodeWeight = (0..nodes.len())
        .filter(|&i| side_known[i] == Some(true) && network.is_hypernode(nodes[i]))
        .map(|i| hg.node_weight(nodes[i]))
        .sum();

    let w0 = hg.part_weight(block_0);
    let w1 = hg.part_weight(block_1);
    let other_max: NodeWeight = (0..hg.k())
        .filter(|&p| p != block_0 && p != block_1)
        .map(|p| hg.part_weight(p))
        .max()
        .unwrap_or(0);
    let average = (hg.total_weight() as f64 / hg.k() as f64).ceil();
    let imbalance_for = |moved: NodeWeight| -> f64 {
        let heaviest = (w0 - moved).max(w1 + moved).max(other_max);
        heaviest as f64 / average - 1.0
    };

    let mut best_imbalance = f64::MAX;
    let mut best_sink_sccs: Vec<bool> = vec![true; num_sccs];
    for _ in 0..TOPOLOGICAL_TRIALS.max(1) {
        let order = random_topological_order(&dag, &indegree, random);
        // Suffixes of a topological order are exactly the successor-closed
        // source sides; sweep the split point.
        let mut prefix_weight: Vec<NodeWeight> = vec![0; order.len() + 1];
        for (pos, &scc) in order.iter().enumerate() {
            prefix_weight[pos + 1] = prefix_weight[pos] + scc_weight[scc];
        }
        for split in 0..=order.len() {
            let moved = pinned_sink_weight + prefix_weight[split];
            let imbalance = imbalance_for(moved);
            if imbalance < best_imbalance {
                best_imbalance = imbalance;
                for (pos, &scc) in order.iter().enumerate() {
                    best_sink_sccs[scc] = pos < split;
                }
            }
        }
        if num_sccs == 0 {
            break;
        }
    }
    debug!("most balanced minimum cut: imbalance {best_imbalance:.4}");

    // Final side of every network node.
    let sink_side = |i: usize| -> bool {
        match side_known[i] {
            Some(side) => side,
            None => best_sink_sccs[scc_of[i]],
        }
    };

    for (i, &u) in nodes.iter().enumerate() {
        if network.is_hypernode(u) && sink_side(i) {
            let from = hg.part(u);
            if from != block_1 {
                hg.change_node_part(u, from, block_1)?;
            }
        }
    }
    // Hypernodes a policy elided follow their hyperedges: only when every
    // incident modelled bridge sits on the sink side does the pin move.
    for &p in network.region_hypernodes() {
        if network.is_network_node(p) {
            continue;
        }
        let mut all_sink = true;
        let mut any_bridge = false;
        for e in hg.incident_edges(p) {
            for bridge in [network.in_node(e), network.out_node(e)] {
                if let Some(&i) = index_of.get(&bridge) {
                    any_bridge = true;
                    if !sink_side(i) {
                        all_sink = false;
                    }
                }
            }
        }
        if any_bridge && all_sink && hg.part(p) != block_1 {
            let from = hg.part(p);
            hg.change_node_part(p, from, block_1)?;
        }
    }
    Ok(())
}

/// Iterative Tarjan over the free nodes of the residual graph. Returns the
/// SCC id per node index (ids are meaningful only for free nodes).
fn tarjan_sccs(
    network: &FlowNetwork,
    nodes: &[NodeId],
    index_of: &std::collections::HashMap<NodeId, usize>,
    side_known: &[Option<bool>],
) -> Vec<usize> {
    const UNVISITED: i64 = -1;
    let n = nodes.len();
    let mut index: Vec<i64> = vec![UNVISITED; n];
    let mut lowlink: Vec<i64> = vec![0; n];
    let mut on_stack: Vec<bool> = vec![false; n];
    let mut stack: Vec<usize> = vec![];
    let mut scc_of: Vec<usize> = vec![usize::MAX; n];
    let mut next_index: i64 = 0;
    let mut next_scc = 0;

    let successors = |i: usize| -> Vec<usize> {
        let u = nodes[i];
        (0..network.degree(u))
            .filter_map(|a| {
                let id = network.incident_edge(u, a);
                if network.residual_capacity(id) == 0 {
                    return None;
                }
                let t = index_of[&network.edge(id).target];
                (side_known[t].is_none()).then_some(t)
            })
            .collect()
    };

    for start in 0..n {
        if side_known[start].is_some() || index[start] != UNVISITED {
            continue;
        }
        // (node, successor list, cursor)
        let mut dfs: Vec<(usize, Vec<usize>, usize)> = vec![(start, successors(start), 0)];
        index[start] = next_index;
        lowlink[start] = next_index;
        next_index += 1;
        stack.push(start);
        on_stack[start] = true;

        loop {
            let Some(frame) = dfs.last_mut() else {
                break;
            };
            let v = frame.0;
            if frame.2 < frame.1.len() {
                let w = frame.1[frame.2];
                frame.2 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    dfs.push((w, successors(w), 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            } else {
                dfs.pop();
                if let Some(parent) = dfs.last_mut() {
                    lowlink[parent.0] = lowlink[parent.0].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    loop {
                        let w = stack.pop().expect("scc stack underflow");
                        on_stack[w] = false;
                        scc_of[w] = next_scc;
                        if w == v {
                            break;
                        }
                    }
                    next_scc += 1;
                }
            }
        }
    }
    scc_of
}

/// Kahn's algorithm with uniformly random choice among the ready components.
fn random_topological_order(
    dag: &[Vec<usize>],
    indegree: &[usize],
    random: &mut Random,
) -> Vec<usize> {
    let mut indegree = indegree.to_vec();
    let mut ready: Vec<usize> = (0..dag.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = vec![];
    while !ready.is_empty() {
        let pick = random.index(ready.len());
        let scc = ready.swap_remove(pick);
        order.push(scc);
        for &next in &dag[scc] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }
    debug_assert_eq!(order.len(), dag.len());
    order
}
