//! Multilevel k-way hypergraph partitioning with FM and flow-based local
//! search and an evolutionary outer loop.
//!
//! A hypergraph is coarsened by rating-driven contractions, the coarsest
//! level is partitioned by a portfolio of flat heuristics, and the
//! contraction hierarchy is unwound while a priority-queue FM engine and a
//! flow engine on block-pair regions improve the partition.

mod coarsen;
mod context;
mod error;
mod evolutionary;
mod flow_network;
mod flow_refine;
mod fm;
mod hypergraph;
mod initial;
mod io;
mod kway_pq;
mod maxflow;
mod metrics;
mod most_balanced;
mod multilevel;
mod quotient;
mod services;

pub use context::{
    AcceptancePolicy, CoarseningAlgorithm, Context, EvoCombineStrategy, EvoMutateStrategy,
    EvoReplaceStrategy, FixedVertexAcceptance, FlowAlgorithm, FlowExecutionPolicy,
    FlowNetworkPolicy, FmStoppingRule, HeavyNodePenalty, InitialPartitioningTechnique,
    LocalSearchAlgorithm, Mode, Objective, RatingScore,
};
pub use error::{Error, Result};
pub use evolutionary::evo_partition;
pub use hypergraph::Hypergraph;
pub use io::{
    apply_fixed_vertices, partition_file_name, read_hypergraph, read_partition, write_partition,
};
pub use metrics::{cut, imbalance, is_balanced, km1, objective};
pub use services::{Random, Timer};

pub type HypernodeId = u32;
pub type HyperedgeId = u32;
pub type PartitionId = u32;
pub type NodeWeight = i64;
pub type HyperedgeWeight = i64;
pub type Gain = i64;
pub type Flow = i64;

pub(crate) const INVALID_PART: PartitionId = PartitionId::MAX;

/// Partitions the hypergraph into `context.partition.k` blocks. The context
/// must have been validated and its block capacities derived via
/// `setup_part_weights`.
pub fn partition(hg: &mut Hypergraph, context: &Context, random: &mut Random) -> Result<()> {
    check_feasibility(hg, context)?;
    multilevel::partition(hg, context, random)
}

fn check_feasibility(hg: &Hypergraph, context: &Context) -> Result<()> {
    let k = context.partition.k;
    if hg.num_nodes() < k as usize {
        return Err(Error::Infeasible(format!(
            "{} vertices cannot fill {} blocks",
            hg.num_nodes(),
            k
        )));
    }
    let capacity: NodeWeight = context.partition.max_part_weights.iter().sum();
    if capacity < hg.total_weight() {
        return Err(Error::Infeasible(format!(
            "block capacities sum to {capacity}, total vertex weight is {}",
            hg.total_weight()
        )));
    }
    for v in hg.nodes() {
        if let Some(b) = hg.fixed_block(v) {
            if b >= k {
                return Err(Error::Infeasible(format!(
                    "vertex {v} is fixed to block {b}, but k = {k}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ordered_float::OrderedFloat;
    use rand::prelude::*;
    use rayon::prelude::*;

    use super::*;

    fn context_for(k: u32, epsilon: f64, objective: Objective, total: NodeWeight) -> Context {
        let mut context = Context::default();
        context.partition.k = k;
        context.partition.epsilon = epsilon;
        context.partition.objective = objective;
        context.coarsening.rating.use_communities = false;
        context.setup_part_weights(total);
        context.validate().unwrap();
        context
    }

    /// Seven vertices, four hyperedges; the two weight-1000 hyperedges force
    /// the blocks {0,1,3,4} and {2,5,6}.
    fn weighted_fixture() -> Hypergraph {
        Hypergraph::new(
            2,
            &[1; 7],
            &[1, 1000, 1, 1000],
            &[vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
        )
    }

    #[test]
    fn cut_partitioning_uncuts_the_heavy_hyperedges() {
        let mut hg = weighted_fixture();
        let context = context_for(2, 0.03, Objective::Cut, 7);
        let mut random = Random::with_seed(42);
        partition(&mut hg, &context, &mut random).unwrap();

        assert_eq!(cut(&hg), 2);
        // The optimum groups {0,1,3,4} against {2,5,6} (block labels may
        // swap).
        for v in [1, 3, 4] {
            assert_eq!(hg.part(v), hg.part(0));
        }
        for v in [5, 6] {
            assert_eq!(hg.part(v), hg.part(2));
        }
        assert_ne!(hg.part(0), hg.part(2));
        assert!(is_balanced(&hg, &context));
    }

    #[test]
    fn km1_partitioning_stays_within_two() {
        let mut hg = weighted_fixture();
        let context = context_for(2, 0.15, Objective::Km1, 7);
        let mut random = Random::with_seed(123);
        partition(&mut hg, &context, &mut random).unwrap();
        assert!(km1(&hg) <= 2);
        assert!(is_balanced(&hg, &context));
    }

    #[test]
    fn single_hyperedge_yields_a_balanced_cut_of_one() {
        let mut hg = Hypergraph::new(2, &[1; 6], &[1], &[vec![0, 1, 2, 3, 4, 5]]);
        let context = context_for(2, 0.03, Objective::Cut, 6);
        let mut random = Random::with_seed(7);
        partition(&mut hg, &context, &mut random).unwrap();
        assert_eq!(cut(&hg), 1);
        assert_eq!(hg.part_weight(0), 3);
        assert_eq!(hg.part_weight(1), 3);
    }

    #[test]
    fn too_few_vertices_are_infeasible() {
        let mut hg = Hypergraph::new(4, &[1; 3], &[1], &[vec![0, 1, 2]]);
        let context = context_for(4, 0.03, Objective::Cut, 3);
        let mut random = Random::with_seed(1);
        assert!(matches!(
            partition(&mut hg, &context, &mut random),
            Err(Error::Infeasible(_))
        ));
    }

    #[test]
    fn same_seed_reproduces_the_partition() {
        let mut a = weighted_fixture();
        let mut b = weighted_fixture();
        let context = context_for(2, 0.15, Objective::Km1, 7);
        partition(&mut a, &context, &mut Random::with_seed(99)).unwrap();
        partition(&mut b, &context, &mut Random::with_seed(99)).unwrap();
        assert_eq!(a.partition(), b.partition());
    }

    #[test]
    fn partition_random_hypergraphs() {
        let num_v = 200;
        let num_e = 120;
        let max_net_size = 5;

        let best = (0..16u64)
            .into_par_iter()
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                let nets: Vec<Vec<HypernodeId>> = (0..num_e)
                    .map(|_| {
                        let pins: BTreeSet<HypernodeId> = (0..max_net_size)
                            .map(|_| rng.gen_range(0..num_v as HypernodeId))
                            .collect();
                        pins.into_iter().collect()
                    })
                    .filter(|pins: &Vec<HypernodeId>| pins.len() >= 2)
                    .collect();
                let edge_weights: Vec<HyperedgeWeight> =
                    (0..nets.len()).map(|_| rng.gen_range(1..10)).collect();
                let mut hg = Hypergraph::new(4, &[1; 200], &edge_weights, &nets);
                let context = context_for(4, 0.10, Objective::Km1, num_v as NodeWeight);
                let mut random = Random::with_seed(seed);
                partition(&mut hg, &context, &mut random).unwrap();
                assert!(hg.nodes().all(|v| hg.has_part(v)));
                assert!(is_balanced(&hg, &context));
                km1(&hg)
            })
            .min_by_key(|&objective| OrderedFloat(objective as f64));
        assert!(best.is_some());
    }
}
