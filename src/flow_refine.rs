use std::collections::VecDeque;

use log::debug;

use crate::context::{Context, FlowExecutionPolicy};
use crate::error::Result;
use crate::flow_network::{BuildOutcome, FlowNetwork};
use crate::hypergraph::Hypergraph;
use crate::maxflow::MinCutSolver;
use crate::metrics;
use crate::quotient::QuotientGraph;
use crate::services::Random;
use crate::{HyperedgeWeight, PartitionId};

/// Cut weight below which a pair refinement is skipped on all but the finest
/// level.
const SMALL_CUT_THRESHOLD: HyperedgeWeight = 10;

/// Flow-based refinement between pairs of adjacent blocks, scheduled
/// round-robin on the quotient graph. Between one pair, a bounded region
/// around the cut becomes a flow network whose minimum cut re-assigns the
/// region; the result is kept only if the objective (or the imbalance at an
/// equal objective) improves.
pub(crate) struct FlowRefiner {
    network: FlowNetwork,
    solver: MinCutSolver,
    execution_levels: Vec<usize>,
}

impl FlowRefiner {
    pub(crate) fn new(hg: &Hypergraph) -> Self {
        FlowRefiner {
            network: FlowNetwork::new(hg),
            solver: MinCutSolver::new(hg),
            execution_levels: vec![],
        }
    }

    /// Computes the uncoarsening levels at which flow refinement runs. The
    /// stack keeps the smallest level at its back; a level fires once the
    /// hypergraph has grown past it.
    pub(crate) fn initialize(&mut self, hg: &Hypergraph, context: &Context) {
        let current = hg.num_nodes();
        let initial = hg.initial_num_nodes();
        let mut levels: Vec<usize> = vec![];
        match context.local_search.flow.execution_policy {
            FlowExecutionPolicy::Constant => {
                let beta = context.local_search.flow.beta.max(1);
                let mut level = current + 1;
                while level < initial {
                    levels.push(level);
                    level += beta;
                }
                levels.push(initial);
                levels.reverse();
            }
            FlowExecutionPolicy::Multilevel => {
                let mut level = initial;
                while level >= current.max(1) {
                    levels.push(level);
                    if level == 0 {
                        break;
                    }
                    level /= 2;
                }
            }
            FlowExecutionPolicy::Exponential => {
                let mut step = 1usize;
                while current + step < initial {
                    levels.push(current + step);
                    step *= 2;
                }
                levels.push(initial);
                levels.reverse();
            }
        }
        self.execution_levels = levels;
    }

    fn execute_flow(&mut self, hg: &Hypergraph) -> bool {
        let Some(&next) = self.execution_levels.last() else {
            return false;
        };
        if hg.num_nodes() >= next {
            self.execution_levels.pop();
            true
        } else {
            false
        }
    }

    /// Active block scheduling over the quotient graph: every pair with cut
    /// hyperedges is refined, and an improved pair is re-queued.
    pub(crate) fn refine(
        &mut self,
        hg: &mut Hypergraph,
        context: &Context,
        random: &mut Random,
        ignore_execution_policy: bool,
    ) -> Result<bool> {
        if !self.execute_flow(hg) && !ignore_execution_policy {
            return Ok(false);
        }
        let k = hg.k();
        let mut quotient = QuotientGraph::new(hg);
        let mut queue: VecDeque<(PartitionId, PartitionId)> = quotient.active_pairs().into();
        let mut queued = vec![false; (k * k) as usize];
        for &(i, j) in &queue {
            queued[(i * k + j) as usize] = true;
        }

        let mut improvement = false;
        while let Some((b0, b1)) = queue.pop_front() {
            queued[(b0 * k + b1) as usize] = false;
            if self.refine_pair(hg, &mut quotient, context, random, b0, b1)? {
                improvement = true;
                if !queued[(b0 * k + b1) as usize] {
                    queued[(b0 * k + b1) as usize] = true;
                    queue.push_back((b0, b1));
                }
            }
        }
        Ok(improvement)
    }

    /// Adaptive flow iterations on one block pair: halve α, build the
    /// region, solve the minimum cut, and keep the assignment only when it
    /// improves. Acceptance grows α back for another round.
    fn refine_pair(
        &mut self,
        hg: &mut Hypergraph,
        quotient: &mut QuotientGraph,
        context: &Context,
        random: &mut Random,
        block_0: PartitionId,
        block_1: PartitionId,
    ) -> Result<bool> {
        let objective = context.partition.objective;
        let flow = &context.local_search.flow;
        let mut best_objective = metrics::objective(hg, objective);
        let mut best_imbalance = metrics::imbalance(hg, context);

        let mut improvement = false;
        let mut alpha = flow.alpha * 2.0;
        loop {
            alpha /= 2.0;

            let cut_hyperedges = quotient
                .block_pair_cut_hyperedges(block_0, block_1)
                .to_vec();
            let cut_weight: HyperedgeWeight =
                cut_hyperedges.iter().map(|&e| hg.edge_weight(e)).sum();
            if flow.ignore_small_hyperedge_cut
                && cut_weight <= SMALL_CUT_THRESHOLD
                && !is_refinement_on_last_level(hg)
            {
                return Ok(false);
            }
            if cut_hyperedges.is_empty() {
                break;
            }

            let outcome = self.network.build_flow_problem(
                hg,
                context,
                &cut_hyperedges,
                alpha,
                block_0,
                block_1,
                random,
            );
            let cut_before = match outcome {
                BuildOutcome::Built { cut_before } => cut_before,
                BuildOutcome::EmptyCut | BuildOutcome::EntireBlockExtracted => break,
            };
            debug!(
                "flow problem ({block_0}, {block_1}): {} nodes, {} arcs, alpha {alpha}",
                self.network.num_nodes(),
                self.network.num_edges(),
            );

            let Some(cut_after) = self.solver.minimum_st_cut(
                hg,
                &mut self.network,
                context,
                random,
                block_0,
                block_1,
            )?
            else {
                // Trivial cut: the flow problem has no source or no sink.
                // Nothing was moved; only this block pair is abandoned.
                break;
            };
            debug_assert!(cut_after <= cut_before);

            let current_objective = metrics::objective(hg, objective);
            let current_imbalance = metrics::imbalance(hg, context);
            let equal_metric = current_objective == best_objective;
            let improved_metric = current_objective < best_objective;
            let improved_imbalance = current_imbalance < best_imbalance;
            let feasible = current_imbalance <= context.partition.epsilon;

            let current_improvement = (improved_metric && (feasible || improved_imbalance))
                || (equal_metric && improved_imbalance);
            if current_improvement {
                best_objective = current_objective;
                best_imbalance = current_imbalance;
                improvement = true;
                alpha *= if alpha == flow.alpha { 2.0 } else { 4.0 };
            }

            self.solver.rollback(hg, &self.network, current_improvement)?;

            // Replay the accepted assignment through the quotient graph so
            // the pair cut sets stay consistent.
            if current_improvement {
                for i in 0..self.network.region_hypernodes().len() {
                    let hn = self.network.region_hypernodes()[i];
                    let from = hg.part(hn);
                    let to = self.solver.original_partition(hn);
                    if from != to {
                        quotient.change_node_part(hg, hn, from, to)?;
                    }
                }
            }

            if flow.use_adaptive_alpha_stopping_rule
                && !improvement
                && cut_before == cut_after
            {
                break;
            }
            if alpha <= 1.0 {
                break;
            }
        }

        Ok(improvement)
    }
}

fn is_refinement_on_last_level(hg: &Hypergraph) -> bool {
    hg.num_nodes() == hg.initial_num_nodes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FlowNetworkPolicy, Objective};

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

    fn flow_context() -> Context {
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.6;
        context.partition.objective = Objective::Cut;
        context.local_search.flow.network = FlowNetworkPolicy::Lawler;
        context.local_search.flow.alpha = 8.0;
        context.setup_part_weights(10);
        context
    }

    #[test]
    fn refinement_never_worsens_the_objective() {
        let mut hg = fixture();
        let context = flow_context();
        let mut random = Random::with_seed(11);
        let mut refiner = FlowRefiner::new(&hg);
        let before = metrics::cut(&hg);
        refiner
            .refine(&mut hg, &context, &mut random, true)
            .unwrap();
        assert!(metrics::cut(&hg) <= before);
        hg.check_invariants();
    }

    #[test]
    fn refinement_is_idempotent_at_a_fixed_point() {
        let mut hg = fixture();
        let context = flow_context();
        let mut random = Random::with_seed(23);
        let mut refiner = FlowRefiner::new(&hg);
        while refiner
            .refine(&mut hg, &context, &mut random, true)
            .unwrap()
        {}
        let snapshot = hg.partition();
        let objective = metrics::cut(&hg);
        let improved = refiner
            .refine(&mut hg, &context, &mut random, true)
            .unwrap();
        assert!(!improved);
        assert_eq!(metrics::cut(&hg), objective);
        assert_eq!(hg.partition(), snapshot);
    }

    #[test]
    fn execution_policies_fire_at_full_size() {
        let hg = fixture();
        for policy in [
            FlowExecutionPolicy::Constant,
            FlowExecutionPolicy::Exponential,
            FlowExecutionPolicy::Multilevel,
        ] {
            let mut context = flow_context();
            context.local_search.flow.execution_policy = policy;
            let mut refiner = FlowRefiner::new(&hg);
            refiner.initialize(&hg, &context);
            // At full size the finest level fires exactly once.
            assert!(refiner.execute_flow(&hg), "{policy:?}");
        }
    }

    #[test]
    fn execution_levels_decrease_towards_the_back() {
        // An unpartitioned copy, coarsened down to 7 vertices so several
        // levels remain.
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
        hg.contract(0, 1).unwrap();
        hg.contract(2, 3).unwrap();
        hg.contract(5, 6).unwrap();
        for policy in [
            FlowExecutionPolicy::Constant,
            FlowExecutionPolicy::Exponential,
            FlowExecutionPolicy::Multilevel,
        ] {
            let mut context = flow_context();
            context.local_search.flow.execution_policy = policy;
            context.local_search.flow.beta = 1;
            let mut refiner = FlowRefiner::new(&hg);
            refiner.initialize(&hg, &context);
            assert!(!refiner.execution_levels.is_empty(), "{policy:?}");
            for w in refiner.execution_levels.windows(2) {
                assert!(w[0] > w[1], "{policy:?}: {:?}", refiner.execution_levels);
            }
            // The finest level is always scheduled.
            assert_eq!(refiner.execution_levels[0], hg.initial_num_nodes());
        }
    }
}
