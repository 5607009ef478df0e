use std::collections::{BinaryHeap, VecDeque};

use bitvec::prelude::*;
use log::debug;
use ordered_float::OrderedFloat;

use crate::coarsen;
use crate::context::{Context, InitialPartitioningTechnique};
use crate::error::Result;
use crate::fm::KWayFmRefiner;
use crate::hypergraph::Hypergraph;
use crate::metrics;
use crate::services::Random;
use crate::{HyperedgeWeight, HypernodeId, NodeWeight, PartitionId};

const TAU: usize = 5;

#[derive(Clone, Copy, Debug)]
enum FlatAlgorithm {
    Random,
    Bfs,
    Greedy,
    LabelPropagation,
}

const POOL: [FlatAlgorithm; 4] = [
    FlatAlgorithm::Random,
    FlatAlgorithm::Bfs,
    FlatAlgorithm::Greedy,
    FlatAlgorithm::LabelPropagation,
];

/// Partitions the coarsest hypergraph: every pool heuristic runs `nruns`
/// times with distinct seeds, each trial is polished by one FM pass, and the
/// best candidate under (feasibility, objective, imbalance) wins.
pub(crate) fn initial_partition(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
) -> Result<()> {
    debug_assert!(hg.nodes().all(|v| !hg.has_part(v)));

    if context.initial_partitioning.technique == InitialPartitioningTechnique::Multilevel
        && hg.num_nodes() > 2 * context.coarsening.contraction_limit(hg.k())
    {
        // A second coarsening pass with a tighter limit, then the flat pool
        // on its coarsest level and FM on the way back up.
        let mut nested = context.clone();
        nested.coarsening.contraction_limit_multiplier =
            (context.coarsening.contraction_limit_multiplier / 2).max(2);
        nested.initial_partitioning.technique = InitialPartitioningTechnique::Flat;
        let mementos = coarsen::coarsen(hg, &nested, random, None, None);
        flat_pool(hg, context, random)?;
        let mut refiner = KWayFmRefiner::new(hg, context);
        for m in mementos.into_iter().rev() {
            hg.uncontract(m);
            refiner.refine(hg, context, random, &[m.u, m.v])?;
        }
        return Ok(());
    }

    flat_pool(hg, context, random)
}

fn flat_pool(hg: &mut Hypergraph, context: &Context, random: &mut Random) -> Result<()> {
    let mut best: Option<(bool, HyperedgeWeight, f64, Vec<PartitionId>)> = None;
    let mut refiner = KWayFmRefiner::new(hg, context);

    for trial in 0..context.initial_partitioning.nruns.max(1) {
        for algorithm in POOL {
            generate(hg, context, random, algorithm);
            let seeds: Vec<_> = hg.nodes().collect();
            refiner.refine(hg, context, random, &seeds)?;

            let feasible = metrics::is_balanced(hg, context);
            let objective = metrics::objective(hg, context.partition.objective);
            let imbalance = metrics::imbalance(hg, context);
            // Feasible trials dominate; objective and imbalance break ties.
            let better = match &best {
                None => true,
                Some((best_feasible, best_objective, best_imbalance, _)) => {
                    (!feasible, objective, OrderedFloat(imbalance))
                        < (!*best_feasible, *best_objective, OrderedFloat(*best_imbalance))
                }
            };
            if better {
                debug!(
                    "initial partitioning trial {trial} ({algorithm:?}): objective {objective}, \
                     imbalance {imbalance:.4}{}",
                    if feasible { "" } else { " (infeasible)" }
                );
                best = Some((feasible, objective, imbalance, hg.partition()));
            }
            hg.reset_partition();
        }
    }

    let (_, _, _, partition) = best.expect("at least one initial partitioning trial");
    hg.set_partition(&partition);
    Ok(())
}

fn generate(hg: &mut Hypergraph, context: &Context, random: &mut Random, algorithm: FlatAlgorithm) {
    match algorithm {
        FlatAlgorithm::Random => random_assignment(hg, context, random),
        FlatAlgorithm::Bfs => bfs_growing(hg, context, random),
        FlatAlgorithm::Greedy => greedy_growing(hg, context, random),
        FlatAlgorithm::LabelPropagation => label_propagation(hg, context, random),
    }
}

fn assign_fixed(hg: &mut Hypergraph) {
    for v in hg.nodes().collect::<Vec<_>>() {
        if let Some(block) = hg.fixed_block(v) {
            hg.set_node_part(v, block);
        }
    }
}

/// The lightest block with room for `weight`; if no block has room, the
/// lightest block overall.
fn lightest_feasible_block(
    hg: &Hypergraph,
    context: &Context,
    weight: NodeWeight,
) -> PartitionId {
    let mut best_feasible: Option<(NodeWeight, PartitionId)> = None;
    let mut fallback = 0;
    let mut fallback_weight = NodeWeight::MAX;
    for p in 0..hg.k() {
        let w = hg.part_weight(p);
        if w + weight <= context.partition.max_part_weights[p as usize]
            && best_feasible.map_or(true, |(best, _)| w < best)
        {
            best_feasible = Some((w, p));
        }
        if w < fallback_weight {
            fallback_weight = w;
            fallback = p;
        }
    }
    match best_feasible {
        Some((_, p)) => p,
        None => fallback,
    }
}

fn random_assignment(hg: &mut Hypergraph, context: &Context, random: &mut Random) {
    assign_fixed(hg);
    let mut nodes: Vec<_> = hg.nodes().filter(|&v| !hg.has_part(v)).collect();
    random.shuffle(&mut nodes);
    for v in nodes {
        let p = random.index(hg.k() as usize) as PartitionId;
        let weight = hg.node_weight(v);
        let p = if hg.part_weight(p) + weight <= context.partition.max_part_weights[p as usize] {
            p
        } else {
            lightest_feasible_block(hg, context, weight)
        };
        hg.set_node_part(v, p);
    }
}

/// k seeds spread by repeated farthest-point BFS sweeps, then round-robin
/// breadth-first growth per block.
fn bfs_growing(hg: &mut Hypergraph, context: &Context, random: &mut Random) {
    assign_fixed(hg);
    let n = hg.initial_num_nodes();
    let seeds = spread_seeds(hg, random);
    let mut queues: Vec<VecDeque<HypernodeId>> = vec![VecDeque::new(); hg.k() as usize];
    let mut visited = bitvec![usize, Lsb0; 0; n];
    for (p, &s) in seeds.iter().enumerate() {
        queues[p].push_back(s);
        visited.set(s as usize, true);
    }

    let mut remaining: usize = hg.nodes().filter(|&v| !hg.has_part(v)).count();
    while remaining > 0 {
        let mut stuck = true;
        for p in 0..hg.k() {
            let Some(v) = queues[p as usize].pop_front() else {
                continue;
            };
            stuck = false;
            for w in hg.adjacent_nodes(v).collect::<Vec<_>>() {
                if !visited[w as usize] {
                    visited.set(w as usize, true);
                    queues[p as usize].push_back(w);
                }
            }
            if hg.has_part(v) {
                continue;
            }
            let weight = hg.node_weight(v);
            let target =
                if hg.part_weight(p) + weight <= context.partition.max_part_weights[p as usize] {
                    p
                } else {
                    lightest_feasible_block(hg, context, weight)
                };
            hg.set_node_part(v, target);
            remaining -= 1;
        }
        if stuck {
            // Disconnected remainder: sweep it up block by block.
            for v in hg.nodes().collect::<Vec<_>>() {
                if !hg.has_part(v) {
                    let p = lightest_feasible_block(hg, context, hg.node_weight(v));
                    hg.set_node_part(v, p);
                    remaining -= 1;
                }
            }
        }
    }
}

/// Greedy hypergraph growing: each block grows from a random seed by
/// repeatedly claiming the frontier vertex with the strongest connection to
/// the block, until the block reaches its share of the total weight.
fn greedy_growing(hg: &mut Hypergraph, context: &Context, random: &mut Random) {
    assign_fixed(hg);
    let n = hg.initial_num_nodes();
    let average = (hg.total_weight() as f64 / hg.k() as f64).ceil() as NodeWeight;
    let mut claimed = bitvec![usize, Lsb0; 0; n];
    for v in hg.nodes().collect::<Vec<_>>() {
        if hg.has_part(v) {
            claimed.set(v as usize, true);
        }
    }

    for p in 0..hg.k() - 1 {
        let unclaimed: Vec<_> = hg.nodes().filter(|&v| !claimed[v as usize]).collect();
        if unclaimed.is_empty() {
            break;
        }
        let seed = unclaimed[random.index(unclaimed.len())];
        let mut frontier: BinaryHeap<(OrderedFloat<f64>, HypernodeId)> = BinaryHeap::new();
        frontier.push((OrderedFloat(0.0), seed));

        while hg.part_weight(p) < average {
            let Some((_, v)) = frontier.pop() else {
                break;
            };
            if claimed[v as usize] {
                continue;
            }
            claimed.set(v as usize, true);
            hg.set_node_part(v, p);
            for w in hg.adjacent_nodes(v).collect::<Vec<_>>() {
                if !claimed[w as usize] {
                    let score: f64 = hg
                        .incident_edges(w)
                        .filter(|&e| hg.pin_count_in_part(e, p) > 0)
                        .map(|e| hg.edge_weight(e) as f64 / (hg.edge_size(e) - 1) as f64)
                        .sum();
                    frontier.push((OrderedFloat(score), w));
                }
            }
        }
    }
    // Whatever is left belongs to the last block, spilling into the
    // lightest one when the capacity is exhausted.
    for v in hg.nodes().collect::<Vec<_>>() {
        if !hg.has_part(v) {
            let weight = hg.node_weight(v);
            let last = hg.k() - 1;
            let p = if hg.part_weight(last) + weight
                <= context.partition.max_part_weights[last as usize]
            {
                last
            } else {
                lightest_feasible_block(hg, context, weight)
            };
            hg.set_node_part(v, p);
        }
    }
}

/// Size-constrained label propagation seeded with k spread vertices and TAU
/// of their neighbours each; every remaining vertex joins the block its
/// hyperedges pull it towards hardest, within the size constraint.
fn label_propagation(hg: &mut Hypergraph, context: &Context, random: &mut Random) {
    assign_fixed(hg);
    let seeds = spread_seeds(hg, random);
    for (p, &s) in seeds.iter().enumerate() {
        if !hg.has_part(s) {
            hg.set_node_part(s, p as PartitionId);
        }
        let mut neighbours: Vec<_> = hg.adjacent_nodes(s).collect();
        random.shuffle(&mut neighbours);
        neighbours.truncate(TAU);
        for w in neighbours {
            if !hg.has_part(w) {
                hg.set_node_part(w, p as PartitionId);
            }
        }
    }

    loop {
        let mut assigned_any = false;
        for v in hg.nodes().collect::<Vec<_>>() {
            if hg.has_part(v) {
                continue;
            }
            let mut pull = vec![0.0f64; hg.k() as usize];
            for e in hg.incident_edges(v) {
                let weight = hg.edge_weight(e) as f64;
                for p in hg.connectivity_set(e) {
                    pull[p as usize] += weight;
                }
            }
            let weight = hg.node_weight(v);
            let mut target: Option<PartitionId> = None;
            for p in 0..hg.k() {
                let fits =
                    hg.part_weight(p) + weight <= context.partition.max_part_weights[p as usize];
                if fits && target.map_or(true, |t| pull[p as usize] > pull[t as usize]) {
                    target = Some(p);
                }
            }
            let target = target.unwrap_or_else(|| lightest_feasible_block(hg, context, weight));
            hg.set_node_part(v, target);
            assigned_any = true;
        }
        if !assigned_any {
            break;
        }
    }
}

/// One random vertex plus repeated last-BFS-visit sweeps yield k seeds that
/// sit far apart, in the spirit of pseudo-peripheral vertex pairs.
fn spread_seeds(hg: &Hypergraph, random: &mut Random) -> Vec<HypernodeId> {
    let nodes: Vec<_> = hg.nodes().collect();
    debug_assert!(!nodes.is_empty());
    let n = hg.initial_num_nodes();
    let last_bfs = |start: HypernodeId| {
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut visited = bitvec![usize, Lsb0; 0; n];
        visited.set(start as usize, true);
        let mut last = start;
        while let Some(pop) = queue.pop_front() {
            for neighbour in hg.adjacent_nodes(pop) {
                if !visited[neighbour as usize] {
                    visited.set(neighbour as usize, true);
                    queue.push_back(neighbour);
                }
            }
            last = pop;
        }
        last
    };

    let mut seeds = vec![];
    let first = nodes[random.index(nodes.len())];
    let mut cursor = last_bfs(first);
    for _ in 0..hg.k() {
        if seeds.contains(&cursor) {
            // Fall back to a fresh random vertex in tiny or disconnected
            // hypergraphs.
            cursor = nodes[random.index(nodes.len())];
        }
        seeds.push(cursor);
        cursor = last_bfs(cursor);
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Objective;

    fn context_for(k: u32, total_weight: NodeWeight) -> Context {
        let mut context = Context::default();
        context.partition.k = k;
        context.partition.epsilon = 0.10;
        context.partition.objective = Objective::Km1;
        context.initial_partitioning.nruns = 4;
        context.setup_part_weights(total_weight);
        context
    }

    fn grid_hypergraph() -> Hypergraph {
        let nets: Vec<Vec<HypernodeId>> = (0..14)
            .map(|i| vec![i as u32, i as u32 + 1, i as u32 + 2])
            .collect();
        Hypergraph::new(2, &[1i64; 16], &vec![1i64; nets.len()], &nets)
    }

    #[test]
    fn block_spill_prefers_a_feasible_block_over_a_lighter_full_one() {
        // Individual block weights 5 and 20: block 0 is lighter but has no
        // room for a weight-4 vertex, block 1 does.
        let mut hg = Hypergraph::new(2, &[3, 10, 4], &[], &[]);
        hg.set_node_part(0, 0);
        hg.set_node_part(1, 1);
        let mut context = context_for(2, 17);
        context.partition.use_individual_block_weights = true;
        context.partition.individual_block_weights = vec![5, 20];
        context.setup_part_weights(17);
        assert_eq!(hg.part_weight(0), 3);
        assert_eq!(hg.part_weight(1), 10);
        let p = lightest_feasible_block(&hg, &context, 4);
        assert_eq!(p, 1);
        assert!(hg.part_weight(p) + 4 <= context.partition.max_part_weights[p as usize]);
    }

    #[test]
    fn block_spill_picks_the_lightest_feasible_block_not_the_first() {
        let mut hg = Hypergraph::new(3, &[3, 1, 2, 1], &[], &[]);
        hg.set_node_part(0, 0);
        hg.set_node_part(1, 1);
        hg.set_node_part(2, 2);
        let mut context = context_for(3, 7);
        context.partition.max_part_weights = vec![4, 4, 4];
        // All three blocks have room; block 1 is the lightest.
        assert_eq!(lightest_feasible_block(&hg, &context, 1), 1);
        // With no block able to take the vertex, fall back to the lightest
        // overall.
        assert_eq!(lightest_feasible_block(&hg, &context, 10), 1);
    }

    #[test]
    fn produces_a_complete_feasible_bipartition() {
        let mut hg = grid_hypergraph();
        let context = context_for(2, 16);
        let mut random = Random::with_seed(3);
        initial_partition(&mut hg, &context, &mut random).unwrap();
        assert!(hg.nodes().all(|v| hg.has_part(v)));
        assert!(metrics::is_balanced(&hg, &context));
        hg.check_invariants();
    }

    #[test]
    fn four_way_partition_fills_every_block() {
        let mut hg = Hypergraph::new(
            4,
            &[1i64; 16],
            &vec![1i64; 14],
            &(0..14)
                .map(|i| vec![i as u32, i as u32 + 1, i as u32 + 2])
                .collect::<Vec<_>>(),
        );
        let context = context_for(4, 16);
        let mut random = Random::with_seed(9);
        initial_partition(&mut hg, &context, &mut random).unwrap();
        for p in 0..4 {
            assert!(hg.part_weight(p) > 0, "block {p} left empty");
        }
        assert!(metrics::is_balanced(&hg, &context));
    }

    #[test]
    fn respects_fixed_vertices() {
        let mut hg = grid_hypergraph();
        hg.set_fixed_vertex(0, 1);
        hg.set_fixed_vertex(15, 0);
        let context = context_for(2, 16);
        let mut random = Random::with_seed(4);
        initial_partition(&mut hg, &context, &mut random).unwrap();
        assert_eq!(hg.part(0), 1);
        assert_eq!(hg.part(15), 0);
    }

    #[test]
    fn single_net_gets_a_balanced_cut_of_one() {
        // Any bisection of one hyperedge costs exactly 1.
        let mut hg = Hypergraph::new(2, &[1i64; 6], &[1], &[vec![0, 1, 2, 3, 4, 5]]);
        let mut context = context_for(2, 6);
        context.partition.epsilon = 0.03;
        context.partition.objective = Objective::Cut;
        context.setup_part_weights(6);
        let mut random = Random::with_seed(6);
        initial_partition(&mut hg, &context, &mut random).unwrap();
        assert_eq!(metrics::cut(&hg), 1);
        assert_eq!(hg.part_weight(0), 3);
        assert_eq!(hg.part_weight(1), 3);
    }
}
