use std::collections::BinaryHeap;

use bitvec::prelude::*;
use log::debug;
use ordered_float::OrderedFloat;

use crate::context::{
    AcceptancePolicy, CoarseningAlgorithm, Context, FixedVertexAcceptance, HeavyNodePenalty,
    RatingScore,
};
use crate::hypergraph::{Hypergraph, Memento};
use crate::services::Random;
use crate::{HypernodeId, NodeWeight, PartitionId};

/// Vetoes contractions the caller wants to keep apart: a pair may only be
/// contracted if every recorded partition assigns both vertices to the same
/// block. Used by V-cycles (one parent, the current partition) and the
/// evolutionary combine operator (two parents).
pub(crate) struct ContractionConstraint {
    parents: Vec<Vec<PartitionId>>,
}

impl ContractionConstraint {
    pub(crate) fn new(parents: Vec<Vec<PartitionId>>) -> Self {
        ContractionConstraint { parents }
    }

    fn allows(&self, u: HypernodeId, v: HypernodeId) -> bool {
        self.parents
            .iter()
            .all(|p| p[u as usize] == p[v as usize])
    }
}

/// Scores candidate partners of a vertex. Scores are accumulated over the
/// shared hyperedges, damped by the heavy-node penalty.
struct Rater {
    scores: Vec<f64>,
    touched: Vec<HypernodeId>,
}

impl Rater {
    fn new(n: usize) -> Self {
        Rater {
            scores: vec![0.0; n],
            touched: vec![],
        }
    }

    /// Returns the best-rated admissible partner of u, breaking score ties
    /// by the configured acceptance policy.
    #[allow(clippy::too_many_arguments)]
    fn best_partner(
        &mut self,
        hg: &Hypergraph,
        u: HypernodeId,
        context: &Context,
        max_weight: NodeWeight,
        edge_frequencies: Option<&[f64]>,
        constraint: Option<&ContractionConstraint>,
        matched: Option<&BitVec>,
        random: &mut Random,
    ) -> Option<HypernodeId> {
        let rating = &context.coarsening.rating;
        for e in hg.incident_edges(u) {
            let size = hg.edge_size(e);
            if size < 2 {
                continue;
            }
            let score = edge_score(hg, e, context, edge_frequencies);
            for p in hg.pins(e) {
                if p != u {
                    if self.scores[p as usize] == 0.0 {
                        self.touched.push(p);
                    }
                    self.scores[p as usize] += score;
                }
            }
        }

        let mut ties: Vec<HypernodeId> = vec![];
        let mut unmatched_ties: Vec<HypernodeId> = vec![];
        let mut best = 0.0f64;
        for &v in &self.touched {
            let mut score = self.scores[v as usize];
            if score <= 0.0 {
                continue;
            }
            if !admissible(hg, u, v, context, max_weight, constraint) {
                continue;
            }
            if rating.heavy_node_penalty == HeavyNodePenalty::Multiplicative {
                score /= (hg.node_weight(u) * hg.node_weight(v)) as f64;
            }
            if ties.is_empty() || score > best {
                best = score;
                ties.clear();
                unmatched_ties.clear();
                ties.push(v);
                if matched.map_or(false, |m| !m[v as usize]) {
                    unmatched_ties.push(v);
                }
            } else if score == best {
                ties.push(v);
                if matched.map_or(false, |m| !m[v as usize]) {
                    unmatched_ties.push(v);
                }
            }
        }

        for &v in &self.touched {
            self.scores[v as usize] = 0.0;
        }
        self.touched.clear();

        if ties.is_empty() {
            return None;
        }
        match rating.acceptance {
            AcceptancePolicy::Random => Some(random.pick(&ties)),
            AcceptancePolicy::PreferUnmatched => {
                if !unmatched_ties.is_empty() {
                    Some(random.pick(&unmatched_ties))
                } else {
                    Some(random.pick(&ties))
                }
            }
        }
    }
}

fn edge_score(
    hg: &Hypergraph,
    e: crate::HyperedgeId,
    context: &Context,
    edge_frequencies: Option<&[f64]>,
) -> f64 {
    let size = hg.edge_size(e);
    match context.coarsening.rating.score {
        RatingScore::HeavyEdge => hg.edge_weight(e) as f64 / (size - 1) as f64,
        RatingScore::EdgeFrequency => {
            let freq = edge_frequencies.map(|f| f[e as usize]).unwrap_or(0.0);
            hg.edge_weight(e) as f64 * (-context.evolutionary.gamma * freq).exp()
                / (size - 1) as f64
        }
    }
}

fn admissible(
    hg: &Hypergraph,
    u: HypernodeId,
    v: HypernodeId,
    context: &Context,
    max_weight: NodeWeight,
    constraint: Option<&ContractionConstraint>,
) -> bool {
    if hg.node_weight(u) + hg.node_weight(v) > max_weight {
        return false;
    }
    let rating = &context.coarsening.rating;
    if rating.use_communities && hg.community(u) != hg.community(v) {
        return false;
    }
    match rating.fixed_vertex_acceptance {
        FixedVertexAcceptance::FreeVertexOnly => {
            if hg.is_fixed(u) || hg.is_fixed(v) {
                return false;
            }
        }
        FixedVertexAcceptance::FixedVertexAllowed => {
            if hg.is_fixed(u) && hg.is_fixed(v) {
                return false;
            }
        }
        FixedVertexAcceptance::EquivalentVertices => {
            if hg.is_fixed(u) && hg.is_fixed(v) && hg.fixed_block(u) != hg.fixed_block(v) {
                return false;
            }
        }
    }
    if hg.has_part(u) && hg.part(u) != hg.part(v) {
        return false;
    }
    if let Some(c) = constraint {
        if !c.allows(u, v) {
            return false;
        }
    }
    true
}

/// Contracts the pair in an orientation the fixed-vertex rules permit.
fn contract_pair(hg: &mut Hypergraph, u: HypernodeId, v: HypernodeId) -> Option<Memento> {
    let (u, v) = if hg.is_fixed(v) && !hg.is_fixed(u) {
        (v, u)
    } else {
        (u, v)
    };
    match hg.contract(u, v) {
        Ok(memento) => Some(memento),
        Err(e) => {
            debug!("skipping contraction ({u}, {v}): {e}");
            None
        }
    }
}

/// Rating-driven contraction until the hypergraph has at most t·k vertices.
/// Contractions are recorded in a stack in the order produced; popping it in
/// reverse replays the hierarchy.
pub(crate) fn coarsen(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    edge_frequencies: Option<&[f64]>,
    constraint: Option<&ContractionConstraint>,
) -> Vec<Memento> {
    let limit = context.coarsening.contraction_limit(hg.k());
    let max_weight = context
        .coarsening
        .max_allowed_node_weight(hg.total_weight(), hg.k());
    let before = hg.num_nodes();

    let mementos = match context.coarsening.algorithm {
        CoarseningAlgorithm::HeavyLazy => {
            lazy_coarsen(hg, context, random, edge_frequencies, constraint, limit, max_weight)
        }
        CoarseningAlgorithm::HeavyFull => {
            full_coarsen(hg, context, random, edge_frequencies, constraint, limit, max_weight)
        }
        CoarseningAlgorithm::MlStyle => {
            ml_coarsen(hg, context, random, edge_frequencies, constraint, limit, max_weight)
        }
    };
    debug!(
        "coarsened {} -> {} nodes ({} contractions)",
        before,
        hg.num_nodes(),
        mementos.len()
    );
    mementos
}

/// Lazy variant: a max-heap over cached pair ratings, refreshed only when a
/// popped entry turned stale.
#[allow(clippy::too_many_arguments)]
fn lazy_coarsen(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    edge_frequencies: Option<&[f64]>,
    constraint: Option<&ContractionConstraint>,
    limit: usize,
    max_weight: NodeWeight,
) -> Vec<Memento> {
    let n = hg.initial_num_nodes();
    let mut rater = Rater::new(n);
    let mut pq = BinaryHeap::new();
    let mut push_best = |hg: &Hypergraph,
                         u: HypernodeId,
                         rater: &mut Rater,
                         pq: &mut BinaryHeap<(OrderedFloat<f64>, (HypernodeId, HypernodeId))>,
                         random: &mut Random| {
        if let Some(v) = rater.best_partner(
            hg, u, context, max_weight, edge_frequencies, constraint, None, random,
        ) {
            let score = rate_pair(hg, u, v, context, edge_frequencies);
            pq.push((OrderedFloat(score), (u, v)));
        }
    };

    let nodes: Vec<_> = hg.nodes().collect();
    for u in nodes {
        push_best(hg, u, &mut rater, &mut pq, random);
    }

    let mut removed = bitvec![usize, Lsb0; 0; n];
    let mut invalid = bitvec![usize, Lsb0; 0; n];

    let mut mementos = vec![];
    while hg.num_nodes() > limit {
        let Some((_, (u, v))) = pq.pop() else {
            break;
        };

        if removed[u as usize] {
            continue;
        }
        if invalid[u as usize] || removed[v as usize] {
            push_best(hg, u, &mut rater, &mut pq, random);
            invalid.set(u as usize, false);
            continue;
        }

        let Some(memento) = contract_pair(hg, u, v) else {
            continue;
        };
        mementos.push(memento);
        removed.set(memento.v as usize, true);

        for w in hg.adjacent_nodes(memento.u).collect::<Vec<_>>() {
            invalid.set(w as usize, true);
        }
        push_best(hg, memento.u, &mut rater, &mut pq, random);
    }

    mementos
}

/// Full variant: every round re-rates all live vertices and contracts in
/// descending score order, revalidating each pair before it is applied.
#[allow(clippy::too_many_arguments)]
fn full_coarsen(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    edge_frequencies: Option<&[f64]>,
    constraint: Option<&ContractionConstraint>,
    limit: usize,
    max_weight: NodeWeight,
) -> Vec<Memento> {
    let n = hg.initial_num_nodes();
    let mut rater = Rater::new(n);
    let mut mementos = vec![];
    while hg.num_nodes() > limit {
        let mut rated: Vec<(OrderedFloat<f64>, HypernodeId, HypernodeId)> = vec![];
        let nodes: Vec<_> = hg.nodes().collect();
        for u in nodes {
            if let Some(v) = rater.best_partner(
                hg, u, context, max_weight, edge_frequencies, constraint, None, random,
            ) {
                rated.push((
                    OrderedFloat(rate_pair(hg, u, v, context, edge_frequencies)),
                    u,
                    v,
                ));
            }
        }
        rated.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut contracted = bitvec![usize, Lsb0; 0; n];
        let mut progress = false;
        for (_, u, v) in rated {
            if hg.num_nodes() <= limit {
                break;
            }
            if contracted[u as usize] || contracted[v as usize] {
                continue;
            }
            if !hg.is_node_enabled(u) || !hg.is_node_enabled(v) {
                continue;
            }
            if !admissible(hg, u, v, context, max_weight, constraint) {
                continue;
            }
            if let Some(memento) = contract_pair(hg, u, v) {
                contracted.set(memento.u as usize, true);
                contracted.set(memento.v as usize, true);
                mementos.push(memento);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    mementos
}

/// ml-style variant: passes over the vertices in random order, contracting
/// each with its momentarily best partner right away.
#[allow(clippy::too_many_arguments)]
fn ml_coarsen(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    edge_frequencies: Option<&[f64]>,
    constraint: Option<&ContractionConstraint>,
    limit: usize,
    max_weight: NodeWeight,
) -> Vec<Memento> {
    let n = hg.initial_num_nodes();
    let mut rater = Rater::new(n);
    let mut mementos = vec![];
    loop {
        if hg.num_nodes() <= limit {
            break;
        }
        let mut nodes: Vec<_> = hg.nodes().collect();
        random.shuffle(&mut nodes);
        let mut matched = bitvec![usize, Lsb0; 0; n];
        let mut progress = false;
        for u in nodes {
            if hg.num_nodes() <= limit {
                break;
            }
            if !hg.is_node_enabled(u) || matched[u as usize] {
                continue;
            }
            let Some(v) = rater.best_partner(
                hg,
                u,
                context,
                max_weight,
                edge_frequencies,
                constraint,
                Some(&matched),
                random,
            ) else {
                continue;
            };
            if let Some(memento) = contract_pair(hg, u, v) {
                matched.set(memento.u as usize, true);
                matched.set(memento.v as usize, true);
                mementos.push(memento);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    mementos
}

/// Score of one concrete pair, matching what `best_partner` maximised.
fn rate_pair(
    hg: &Hypergraph,
    u: HypernodeId,
    v: HypernodeId,
    context: &Context,
    edge_frequencies: Option<&[f64]>,
) -> f64 {
    let mut score = 0.0;
    for e in hg.incident_edges(u) {
        if hg.edge_size(e) < 2 || !hg.pins(e).any(|p| p == v) {
            continue;
        }
        score += edge_score(hg, e, context, edge_frequencies);
    }
    if context.coarsening.rating.heavy_node_penalty == HeavyNodePenalty::Multiplicative {
        score /= (hg.node_weight(u) * hg.node_weight(v)) as f64;
    }
    score
}

/// Size-constrained label propagation: every vertex adopts the label its
/// hyperedges connect it to most strongly. The converged labels become the
/// community ids that restrict coarsening partners.
pub(crate) fn detect_communities(
    hg: &Hypergraph,
    context: &Context,
    random: &mut Random,
) -> Vec<u32> {
    let n = hg.initial_num_nodes();
    let mut labels: Vec<u32> = (0..n as u32).collect();
    let mut connection: Vec<f64> = vec![0.0; n];
    let mut touched: Vec<u32> = vec![];

    for _ in 0..context.preprocessing.max_community_pass_iterations {
        let mut nodes: Vec<_> = hg.nodes().collect();
        random.shuffle(&mut nodes);
        let mut changed = false;
        for u in nodes {
            for e in hg.incident_edges(u) {
                let size = hg.edge_size(e);
                if size < 2 {
                    continue;
                }
                let score = hg.edge_weight(e) as f64 / (size - 1) as f64;
                for p in hg.pins(e) {
                    if p == u {
                        continue;
                    }
                    let label = labels[p as usize];
                    if connection[label as usize] == 0.0 {
                        touched.push(label);
                    }
                    connection[label as usize] += score;
                }
            }
            let mut best_label = labels[u as usize];
            let mut best_score = connection[best_label as usize];
            for &label in &touched {
                if connection[label as usize] > best_score {
                    best_score = connection[label as usize];
                    best_label = label;
                }
            }
            for &label in &touched {
                connection[label as usize] = 0.0;
            }
            touched.clear();
            if best_label != labels[u as usize] {
                labels[u as usize] = best_label;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_hypergraph(num_v: usize) -> Hypergraph {
        // A chain of 3-pin nets keeps everything connected.
        let nets: Vec<Vec<HypernodeId>> = (0..num_v - 2)
            .map(|i| vec![i as u32, i as u32 + 1, i as u32 + 2])
            .collect();
        let weights = vec![1i64; nets.len()];
        Hypergraph::new(2, &vec![1i64; num_v], &weights, &nets)
    }

    fn small_context(limit_multiplier: u32) -> Context {
        let mut context = Context::default();
        context.partition.k = 2;
        context.coarsening.contraction_limit_multiplier = limit_multiplier;
        context.coarsening.rating.use_communities = false;
        context
    }

    #[test]
    fn coarsening_stops_at_the_contraction_limit() {
        for algorithm in [
            CoarseningAlgorithm::HeavyLazy,
            CoarseningAlgorithm::HeavyFull,
            CoarseningAlgorithm::MlStyle,
        ] {
            let mut hg = chain_hypergraph(64);
            let mut context = small_context(4);
            context.coarsening.algorithm = algorithm;
            let mut random = Random::with_seed(13);
            let mementos = coarsen(&mut hg, &context, &mut random, None, None);
            assert!(hg.num_nodes() <= 8, "{algorithm:?} left {}", hg.num_nodes());
            assert_eq!(mementos.len(), 64 - hg.num_nodes());
        }
    }

    #[test]
    fn uncontracting_the_stack_restores_every_vertex() {
        let mut hg = chain_hypergraph(32);
        let reference = hg.clone();
        let context = small_context(4);
        let mut random = Random::with_seed(5);
        let mementos = coarsen(&mut hg, &context, &mut random, None, None);
        for m in mementos.into_iter().rev() {
            hg.uncontract(m);
        }
        assert_eq!(hg.nodes().collect::<Vec<_>>(), reference.nodes().collect::<Vec<_>>());
        for v in hg.nodes() {
            assert_eq!(hg.node_weight(v), 1);
        }
        for e in hg.edges() {
            let mut pins: Vec<_> = hg.pins(e).collect();
            let mut expected: Vec<_> = reference.pins(e).collect();
            pins.sort_unstable();
            expected.sort_unstable();
            assert_eq!(pins, expected);
        }
    }

    #[test]
    fn weight_cap_prevents_heavy_clumps() {
        let mut hg = chain_hypergraph(64);
        let mut context = small_context(4);
        context.coarsening.max_allowed_weight_multiplier = 1.0;
        // cap = ceil(64 / 8) = 8
        let mut random = Random::with_seed(21);
        coarsen(&mut hg, &context, &mut random, None, None);
        for v in hg.nodes() {
            assert!(hg.node_weight(v) <= 8);
        }
    }

    #[test]
    fn constraint_blocks_cross_parent_contractions() {
        let mut hg = chain_hypergraph(32);
        // Parents agree only inside {0..15} and {16..31}.
        let parent: Vec<PartitionId> = (0..32).map(|v| (v >= 16) as PartitionId).collect();
        let constraint = ContractionConstraint::new(vec![parent.clone(), parent.clone()]);
        let context = small_context(1);
        let mut random = Random::with_seed(2);
        let mementos = coarsen(&mut hg, &context, &mut random, None, Some(&constraint));
        for m in &mementos {
            assert_eq!(parent[m.u as usize], parent[m.v as usize]);
        }
        assert!(hg.nodes().any(|v| parent[v as usize] == 0));
        assert!(hg.nodes().any(|v| parent[v as usize] == 1));
    }

    #[test]
    fn free_vertex_only_policy_keeps_fixed_vertices_apart() {
        let mut hg = chain_hypergraph(16);
        hg.set_fixed_vertex(3, 0);
        hg.set_fixed_vertex(7, 1);
        let context = small_context(1);
        let mut random = Random::with_seed(8);
        coarsen(&mut hg, &context, &mut random, None, None);
        assert!(hg.is_node_enabled(3));
        assert!(hg.is_node_enabled(7));
        assert_eq!(hg.node_weight(3), 1);
    }

    #[test]
    fn community_detection_separates_disconnected_cliques() {
        let nets = vec![vec![0, 1, 2], vec![0, 1, 2], vec![3, 4, 5], vec![3, 4, 5]];
        let hg = Hypergraph::new(2, &[1; 6], &[1; 4], &nets);
        let mut context = Context::default();
        context.preprocessing.max_community_pass_iterations = 10;
        let mut random = Random::with_seed(17);
        let labels = detect_communities(&hg, &context, &mut random);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }
}
