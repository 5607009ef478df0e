use log::{debug, info};

use crate::coarsen::{self, ContractionConstraint};
use crate::context::{Context, LocalSearchAlgorithm, Mode, Objective};
use crate::error::Result;
use crate::flow_refine::FlowRefiner;
use crate::fm::KWayFmRefiner;
use crate::hypergraph::Hypergraph;
use crate::initial;
use crate::metrics;
use crate::services::Random;
use crate::{HypernodeId, NodeWeight, PartitionId, INVALID_PART};

/// Where the coarsest level's partition comes from.
pub(crate) enum CoarsePartitionSource<'a> {
    /// Run the initial partitioning portfolio.
    InitialPartitioner,
    /// Project a given assignment onto the surviving vertices (the
    /// evolutionary combine).
    Projected(&'a [PartitionId]),
    /// The partition survived a constrained re-coarsening (V-cycle).
    Preserved,
}

/// One multilevel run: COARSEN, obtain the coarsest partition, then
/// UNCOARSEN_STEP until the contraction stack is empty, refining after each
/// restored vertex.
pub(crate) fn multilevel_run(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    edge_frequencies: Option<&[f64]>,
    constraint: Option<&ContractionConstraint>,
    source: CoarsePartitionSource,
) -> Result<()> {
    let mementos = coarsen::coarsen(hg, context, random, edge_frequencies, constraint);

    match source {
        CoarsePartitionSource::InitialPartitioner => {
            hg.reset_partition();
            initial::initial_partition(hg, context, random)?;
        }
        CoarsePartitionSource::Projected(parts) => {
            hg.reset_partition();
            for v in hg.nodes().collect::<Vec<_>>() {
                hg.set_node_part(v, parts[v as usize]);
            }
        }
        CoarsePartitionSource::Preserved => {
            debug_assert!(hg.nodes().all(|v| hg.has_part(v)));
        }
    }
    debug!(
        "coarsest level: {} nodes, objective {}",
        hg.num_nodes(),
        metrics::objective(hg, context.partition.objective)
    );

    let use_fm = matches!(
        context.local_search.algorithm,
        LocalSearchAlgorithm::Fm | LocalSearchAlgorithm::FmFlow
    );
    let use_flow = matches!(
        context.local_search.algorithm,
        LocalSearchAlgorithm::Flow | LocalSearchAlgorithm::FmFlow
    );

    let mut fm = KWayFmRefiner::new(hg, context);
    let mut flow = FlowRefiner::new(hg);
    if use_flow {
        flow.initialize(hg, context);
    }

    // Polish the coarsest partition before projecting it upwards.
    if use_fm {
        let seeds: Vec<HypernodeId> = hg.nodes().collect();
        for _ in 0..context.local_search.iterations_per_level.max(1) {
            if !fm.refine(hg, context, random, &seeds)? {
                break;
            }
        }
    }

    for m in mementos.into_iter().rev() {
        hg.uncontract(m);
        if use_fm {
            for _ in 0..context.local_search.iterations_per_level.max(1) {
                if !fm.refine(hg, context, random, &[m.u, m.v])? {
                    break;
                }
            }
        }
        if use_flow {
            flow.refine(hg, context, random, false)?;
        }
    }

    // A last sweep over all border vertices on the finest level.
    if use_fm {
        let seeds: Vec<HypernodeId> = hg.nodes().collect();
        for _ in 0..context.local_search.iterations_per_level.max(1) {
            if !fm.refine(hg, context, random, &seeds)? {
                break;
            }
        }
    }
    Ok(())
}

/// Re-coarsens the current partition (contractions stay within blocks) and
/// refines on the way back up, optionally replacing the coarse partition
/// with a fresh initial partitioning.
pub(crate) fn vcycle(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    fresh_initial_partitioning: bool,
) -> Result<()> {
    let constraint = ContractionConstraint::new(vec![hg.partition()]);
    if fresh_initial_partitioning {
        multilevel_run(
            hg,
            context,
            random,
            None,
            Some(&constraint),
            CoarsePartitionSource::InitialPartitioner,
        )
    } else {
        multilevel_run(
            hg,
            context,
            random,
            None,
            Some(&constraint),
            CoarsePartitionSource::Preserved,
        )
    }
}

/// Top-level single-run entry: mode dispatch, community preprocessing and
/// V-cycles.
pub(crate) fn partition(hg: &mut Hypergraph, context: &Context, random: &mut Random) -> Result<()> {
    if context.preprocessing.detect_communities && context.coarsening.rating.use_communities {
        let communities = coarsen::detect_communities(hg, context, random);
        hg.set_communities(communities);
    }

    match context.partition.mode {
        Mode::Direct => {
            multilevel_run(
                hg,
                context,
                random,
                None,
                None,
                CoarsePartitionSource::InitialPartitioner,
            )?;
            for cycle in 0..context.partition.vcycles {
                let before = metrics::objective(hg, context.partition.objective);
                vcycle(hg, context, random, false)?;
                let after = metrics::objective(hg, context.partition.objective);
                debug!("v-cycle {}: objective {} -> {}", cycle + 1, before, after);
                if after == before {
                    break;
                }
            }
        }
        Mode::Recursive => recursive_bisection(hg, context, random)?,
    }

    info!(
        "partitioned into {} blocks: objective {}, imbalance {:.4}",
        context.partition.k,
        metrics::objective(hg, context.partition.objective),
        metrics::imbalance(hg, context)
    );
    Ok(())
}

/// Recursive bisection: split the block range in half with a 2-way
/// multilevel run, extract both sides, recurse. ε is tightened per level so
/// the composed partition still meets the overall balance constraint.
fn recursive_bisection(hg: &mut Hypergraph, context: &Context, random: &mut Random) -> Result<()> {
    let k = context.partition.k;
    let depth = (k as f64).log2().ceil().max(1.0);
    let adapted_epsilon = (1.0 + context.partition.epsilon).powf(1.0 / depth) - 1.0;

    let (mut sub, node_map) = hg.copy_with_k(2);
    let mut final_parts: Vec<PartitionId> = vec![INVALID_PART; hg.initial_num_nodes()];
    bisect_range(
        &mut sub,
        &node_map,
        &mut final_parts,
        0,
        k,
        context,
        adapted_epsilon,
        random,
    )?;
    for v in hg.nodes().collect::<Vec<_>>() {
        hg.set_node_part(v, final_parts[v as usize]);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn bisect_range(
    sub: &mut Hypergraph,
    node_map: &[HypernodeId],
    final_parts: &mut [PartitionId],
    lo: PartitionId,
    hi: PartitionId,
    context: &Context,
    adapted_epsilon: f64,
    random: &mut Random,
) -> Result<()> {
    debug_assert!(hi > lo);
    if hi - lo == 1 {
        for v in sub.nodes() {
            final_parts[node_map[v as usize] as usize] = lo;
        }
        return Ok(());
    }
    let mid = lo + (hi - lo).div_ceil(2);

    // Fixed vertices carry their final block id; for this bisection only the
    // side matters.
    let saved_fixed: Vec<(HypernodeId, PartitionId)> = sub
        .nodes()
        .filter_map(|v| sub.fixed_block(v).map(|f| (v, f)))
        .collect();
    for &(v, f) in &saved_fixed {
        sub.set_fixed_vertex(v, (f >= mid) as PartitionId);
    }

    let mut bisection_context = context.clone();
    bisection_context.partition.k = 2;
    bisection_context.partition.mode = Mode::Direct;
    bisection_context.partition.vcycles = 0;
    bisection_context.partition.epsilon = adapted_epsilon;
    bisection_context.partition.use_individual_block_weights = false;
    let total = sub.total_weight();
    let blocks = (hi - lo) as f64;
    let left_share = (mid - lo) as f64 / blocks;
    let cap = |share: f64| -> NodeWeight {
        ((1.0 + adapted_epsilon) * (total as f64 * share).ceil()) as NodeWeight
    };
    bisection_context.partition.max_part_weights = vec![cap(left_share), cap(1.0 - left_share)];

    multilevel_run(
        sub,
        &bisection_context,
        random,
        None,
        None,
        CoarsePartitionSource::InitialPartitioner,
    )?;

    for &(v, f) in &saved_fixed {
        sub.set_fixed_vertex(v, f);
    }

    let split_nets = context.partition.objective == Objective::Km1;
    for (side, range) in [(0, (lo, mid)), (1, (mid, hi))] {
        let (l, h) = range;
        if h - l == 1 {
            for v in sub.nodes() {
                if sub.part(v) == side {
                    final_parts[node_map[v as usize] as usize] = l;
                }
            }
            continue;
        }
        let (mut child, child_map) = sub.extract_block(side, 2, split_nets);
        let child_node_map: Vec<HypernodeId> = child_map
            .iter()
            .map(|&sv| node_map[sv as usize])
            .collect();
        bisect_range(
            &mut child,
            &child_node_map,
            final_parts,
            l,
            h,
            context,
            adapted_epsilon,
            random,
        )?;
    }
    Ok(())
}
