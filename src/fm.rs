use bitvec::prelude::*;
use log::debug;

use crate::context::{Context, FmStoppingRule, Objective};
use crate::error::Result;
use crate::hypergraph::Hypergraph;
use crate::kway_pq::KWayPriorityQueue;
use crate::metrics;
use crate::services::Random;
use crate::{Gain, HyperedgeWeight, HypernodeId, PartitionId};

/// One applied move of the FM log.
#[derive(Clone, Copy, Debug)]
struct Move {
    v: HypernodeId,
    from: PartitionId,
    to: PartitionId,
}

/// Change in the objective if v moves from its block to `target`,
/// recomputed from the pin counts. The gain cache must agree with this
/// value at every point of a pass.
pub(crate) fn compute_gain(
    hg: &Hypergraph,
    v: HypernodeId,
    target: PartitionId,
    objective: Objective,
) -> Gain {
    let from = hg.part(v);
    debug_assert_ne!(from, target);
    let mut gain = 0;
    for e in hg.incident_edges(v) {
        let weight = hg.edge_weight(e);
        match objective {
            Objective::Km1 => {
                if hg.pin_count_in_part(e, from) == 1 {
                    gain += weight;
                }
                if hg.pin_count_in_part(e, target) == 0 {
                    gain -= weight;
                }
            }
            Objective::Cut => {
                let size = hg.edge_size(e) as u32;
                if hg.pin_count_in_part(e, target) == size - 1 {
                    gain += weight;
                }
                if hg.pin_count_in_part(e, from) == size {
                    gain -= weight;
                }
            }
        }
    }
    gain
}

/// Adaptive random-walk stopping model: a search is hopeless once
/// steps · μ² exceeds α · σ² + β for the gains seen since the last
/// improvement (Osipov & Sanders style).
struct AdaptiveStop {
    steps: u32,
    sum: f64,
    sum_sq: f64,
    alpha: f64,
    beta: f64,
}

impl AdaptiveStop {
    fn new(alpha: f64, num_nodes: usize) -> Self {
        AdaptiveStop {
            steps: 0,
            sum: 0.0,
            sum_sq: 0.0,
            alpha,
            beta: (num_nodes.max(2) as f64).ln(),
        }
    }

    fn record(&mut self, gain: Gain) {
        self.steps += 1;
        self.sum += gain as f64;
        self.sum_sq += (gain * gain) as f64;
    }

    fn reset(&mut self) {
        self.steps = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }

    fn should_stop(&self) -> bool {
        if self.steps <= 1 {
            return false;
        }
        let n = self.steps as f64;
        let mean = self.sum / n;
        if mean > 0.0 {
            return false;
        }
        let variance = (self.sum_sq - n * mean * mean) / (n - 1.0);
        n * mean * mean > self.alpha * variance + self.beta
    }
}

/// k-way Fiduccia-Mattheyses local search: priority-queue moves with delta
/// gain maintenance and rollback to the best feasible move prefix. The gain
/// state lives for the duration of one pass.
pub(crate) struct KWayFmRefiner {
    pq: KWayPriorityQueue,
    active: BitVec,
    marked: BitVec,
    moves: Vec<Move>,
    pending_inserts: Vec<(HypernodeId, PartitionId)>,
    pending_activations: Vec<HypernodeId>,
}

impl KWayFmRefiner {
    pub(crate) fn new(hg: &Hypergraph, _context: &Context) -> Self {
        let n = hg.initial_num_nodes();
        KWayFmRefiner {
            pq: KWayPriorityQueue::new(hg.k(), n, true),
            active: bitvec![usize, Lsb0; 0; n],
            marked: bitvec![usize, Lsb0; 0; n],
            moves: vec![],
            pending_inserts: vec![],
            pending_activations: vec![],
        }
    }

    /// Runs one FM pass from the given seed vertices. Returns whether the
    /// pass kept a strictly improving (or imbalance-reducing at equal
    /// objective) move prefix; otherwise every move is rolled back and the
    /// hypergraph is back in its pre-pass state.
    pub(crate) fn refine(
        &mut self,
        hg: &mut Hypergraph,
        context: &Context,
        random: &mut Random,
        seeds: &[HypernodeId],
    ) -> Result<bool> {
        let objective = context.partition.objective;
        self.pq.clear();
        self.active.fill(false);
        self.marked.fill(false);
        self.moves.clear();

        for &v in seeds {
            self.activate(hg, context, v, objective);
        }
        if self.pq.is_empty() {
            return Ok(false);
        }

        let start_objective = metrics::objective(hg, objective);
        let start_heaviest = heaviest_part_weight(hg);
        let mut current_objective = start_objective;
        let mut best_objective = start_objective;
        let mut best_heaviest = start_heaviest;
        let mut best_prefix = 0usize;

        let mut fruitless: u32 = 0;
        let mut adaptive = AdaptiveStop::new(
            context.local_search.fm.adaptive_stop_alpha,
            hg.initial_num_nodes(),
        );

        while let Some((v, key, to)) = self.pq.delete_max(random) {
            let from = hg.part(v);
            debug_assert_eq!(key, compute_gain(hg, v, to, objective));
            if !is_feasible(hg, context, v, to) {
                // The entry is consumed; v may still move to another block.
                continue;
            }

            hg.change_node_part(v, from, to)?;
            self.marked.set(v as usize, true);
            for t in 0..hg.k() {
                if self.pq.contains(v, t) {
                    self.pq.remove(v, t);
                }
            }
            self.active.set(v as usize, false);
            self.moves.push(Move { v, from, to });
            current_objective -= key;

            if hg.part_weight(to) >= context.partition.max_part_weights[to as usize] {
                self.pq.disable_part(to);
            }
            if hg.part_weight(from) < context.partition.max_part_weights[from as usize] {
                self.pq.enable_part(from);
            }

            self.update_neighbours(hg, context, v, from, to, objective);

            let heaviest = heaviest_part_weight(hg);
            let feasible = metrics::is_balanced(hg, context);
            let improved = current_objective < best_objective
                && (feasible || heaviest <= best_heaviest);
            let rebalanced = current_objective == best_objective && heaviest < best_heaviest;
            if improved || rebalanced {
                best_objective = current_objective;
                best_heaviest = heaviest;
                best_prefix = self.moves.len();
                fruitless = 0;
                adaptive.reset();
            } else {
                fruitless += 1;
                adaptive.record(key);
            }

            let stop = match context.local_search.fm.stopping_rule {
                FmStoppingRule::Simple => fruitless >= context.local_search.fm.max_fruitless_moves,
                FmStoppingRule::AdaptiveOpt => adaptive.should_stop(),
            };
            if stop {
                break;
            }
        }

        // Rollback to the best prefix; an empty prefix reverts the pass.
        for m in self.moves[best_prefix..].iter().rev() {
            hg.change_node_part(m.v, m.to, m.from)?;
        }
        self.moves.truncate(best_prefix);

        debug_assert_eq!(metrics::objective(hg, objective), best_objective);
        let improved = best_objective < start_objective
            || (best_objective == start_objective && best_heaviest < start_heaviest);
        if improved {
            debug!(
                "fm pass: {} -> {} ({} moves kept)",
                start_objective, best_objective, best_prefix
            );
        }
        Ok(improved && best_prefix > 0)
    }

    /// Inserts v into the queues of all its adjacent blocks with freshly
    /// computed gains.
    fn activate(&mut self, hg: &Hypergraph, context: &Context, v: HypernodeId, objective: Objective) {
        if !hg.is_node_enabled(v)
            || self.active[v as usize]
            || self.marked[v as usize]
            || hg.is_fixed(v)
            || !hg.is_border_node(v)
        {
            return;
        }
        let from = hg.part(v);
        let mut inserted = false;
        for t in 0..hg.k() {
            if t == from || !self.is_adjacent(hg, v, t) {
                continue;
            }
            self.pq_insert(hg, context, v, t, compute_gain(hg, v, t, objective));
            inserted = true;
        }
        if inserted {
            self.active.set(v as usize, true);
        }
    }

    fn pq_insert(&mut self, hg: &Hypergraph, context: &Context, v: HypernodeId, t: PartitionId, gain: Gain) {
        self.pq.insert(v, t, gain);
        if hg.part_weight(t) < context.partition.max_part_weights[t as usize] {
            self.pq.enable_part(t);
        }
    }

    fn is_adjacent(&self, hg: &Hypergraph, v: HypernodeId, t: PartitionId) -> bool {
        hg.incident_edges(v).any(|e| hg.pin_count_in_part(e, t) > 0)
    }

    /// Applies the four delta cases of the gain-cache protocol to all
    /// neighbours of the moved vertex, then activates vertices that became
    /// border nodes and inserts newly adjacent targets.
    fn update_neighbours(
        &mut self,
        hg: &Hypergraph,
        context: &Context,
        v: HypernodeId,
        from: PartitionId,
        to: PartitionId,
        objective: Objective,
    ) {
        self.pending_inserts.clear();
        self.pending_activations.clear();

        let incident: Vec<_> = hg.incident_edges(v).collect();
        for e in incident {
            let weight = hg.edge_weight(e);
            let size = hg.edge_size(e) as u32;
            let pins_from = hg.pin_count_in_part(e, from);
            let pins_to = hg.pin_count_in_part(e, to);

            match objective {
                Objective::Km1 => {
                    self.km1_deltas(hg, e, v, from, to, weight, pins_from, pins_to)
                }
                Objective::Cut => {
                    self.cut_deltas(hg, e, v, from, to, weight, size, pins_from, pins_to)
                }
            }

            // Block `from` may have left the hyperedge entirely: drop stale
            // targets of pins no longer adjacent to it.
            if pins_from == 0 {
                for w in hg.pins(e) {
                    if w != v
                        && self.pq.contains(w, from)
                        && !self.is_adjacent(hg, w, from)
                    {
                        self.pq.remove(w, from);
                    }
                }
            }
        }

        let pending = std::mem::take(&mut self.pending_activations);
        for w in pending {
            self.activate(hg, context, w, objective);
        }
        let pending = std::mem::take(&mut self.pending_inserts);
        for (w, t) in pending {
            if !self.marked[w as usize]
                && self.active[w as usize]
                && hg.part(w) != t
                && !self.pq.contains(w, t)
                && self.is_adjacent(hg, w, t)
            {
                self.pq_insert(hg, context, w, t, compute_gain(hg, w, t, objective));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn km1_deltas(
        &mut self,
        hg: &Hypergraph,
        e: crate::HyperedgeId,
        v: HypernodeId,
        from: PartitionId,
        to: PartitionId,
        weight: HyperedgeWeight,
        pins_from: u32,
        pins_to: u32,
    ) {
        // from 2 -> 1: the remaining pin in `from` gains ω(e) on every move.
        if pins_from == 1 {
            if let Some(w0) = hg.pins(e).find(|&w| w != v && hg.part(w) == from) {
                self.update_all_targets(hg, w0, weight);
            }
        }
        // from 1 -> 0: moving a neighbour into `from` no longer keeps λ.
        if pins_from == 0 {
            for w in hg.pins(e) {
                if w != v && self.pq.contains(w, from) {
                    self.pq.update_key_by(w, from, -weight);
                }
            }
        }
        // to 0 -> 1: `to` became free to move into for every other pin.
        if pins_to == 1 {
            for w in hg.pins(e) {
                if w == v || self.marked[w as usize] {
                    continue;
                }
                if !self.active[w as usize] {
                    self.pending_activations.push(w);
                } else if self.pq.contains(w, to) {
                    self.pq.update_key_by(w, to, weight);
                } else {
                    self.pending_inserts.push((w, to));
                }
            }
        }
        // to 1 -> 2: the formerly lone pin in `to` loses ω(e).
        if pins_to == 2 {
            if let Some(w0) = hg.pins(e).find(|&w| w != v && hg.part(w) == to) {
                self.update_all_targets(hg, w0, -weight);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cut_deltas(
        &mut self,
        hg: &Hypergraph,
        e: crate::HyperedgeId,
        v: HypernodeId,
        from: PartitionId,
        to: PartitionId,
        weight: HyperedgeWeight,
        size: u32,
        pins_from: u32,
        pins_to: u32,
    ) {
        // e was internal to `from`: leaving it no longer newly cuts e.
        if pins_from + 1 == size {
            for w in hg.pins(e) {
                if w != v && !self.marked[w as usize] && self.active[w as usize] {
                    self.update_all_targets(hg, w, weight);
                }
            }
        }
        // e became internal to `to`: every move out of it now cuts e.
        if pins_to == size {
            for w in hg.pins(e) {
                if w != v && !self.marked[w as usize] && self.active[w as usize] {
                    self.update_all_targets(hg, w, -weight);
                }
            }
        }
        // All pins but one sit in `to`: the outsider can uncut e.
        if pins_to == size - 1 {
            if let Some(w0) = hg.pins(e).find(|&w| hg.part(w) != to) {
                debug_assert_ne!(w0, v);
                if !self.marked[w0 as usize] {
                    if !self.active[w0 as usize] {
                        self.pending_activations.push(w0);
                    } else if self.pq.contains(w0, to) {
                        self.pq.update_key_by(w0, to, weight);
                    } else {
                        self.pending_inserts.push((w0, to));
                    }
                }
            }
        }
        // Before the move all pins but one sat in `from`; that outsider
        // can no longer uncut e by joining `from`.
        if pins_from + 1 == size - 1 {
            if let Some(w0) = hg.pins(e).find(|&w| w != v && hg.part(w) != from) {
                if self.pq.contains(w0, from) {
                    self.pq.update_key_by(w0, from, -weight);
                }
            }
        }
        // New adjacency without a gain change still needs an entry.
        if pins_to == 1 {
            for w in hg.pins(e) {
                if w == v || self.marked[w as usize] {
                    continue;
                }
                if !self.active[w as usize] {
                    self.pending_activations.push(w);
                } else if !self.pq.contains(w, to) {
                    self.pending_inserts.push((w, to));
                }
            }
        }
    }

    fn update_all_targets(&mut self, hg: &Hypergraph, w: HypernodeId, delta: Gain) {
        if self.marked[w as usize] || !self.active[w as usize] {
            return;
        }
        for t in 0..hg.k() {
            if self.pq.contains(w, t) {
                self.pq.update_key_by(w, t, delta);
            }
        }
    }
}

fn heaviest_part_weight(hg: &Hypergraph) -> crate::NodeWeight {
    (0..hg.k()).map(|p| hg.part_weight(p)).max().unwrap_or(0)
}

fn is_feasible(hg: &Hypergraph, context: &Context, v: HypernodeId, to: PartitionId) -> bool {
    hg.part_weight(to) + hg.node_weight(v) <= context.partition.max_part_weights[to as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn context(k: u32, epsilon: f64, objective: Objective, total_weight: i64) -> Context {
        let mut context = Context::default();
        context.partition.k = k;
        context.partition.epsilon = epsilon;
        context.partition.objective = objective;
        context.setup_part_weights(total_weight);
        context
    }

    /// The S1 hypergraph: moving vertex 2 out of the heavy net {2,5,6}
    /// is the single best move.
    fn s1_hypergraph() -> Hypergraph {
        Hypergraph::new(
            2,
            &[1; 7],
            &[1, 1000, 1, 1000],
            &[vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
        )
    }

    #[test]
    fn gains_match_the_formula() {
        let mut hg = s1_hypergraph();
        for v in 0..7 {
            hg.set_node_part(v, (v % 2) as PartitionId);
        }
        for v in 0..7u32 {
            let from = hg.part(v);
            let t = 1 - from;
            let gain = compute_gain(&hg, v, t, Objective::Km1);
            // Cross-check against a move-and-measure oracle.
            let before = metrics::km1(&hg);
            hg.change_node_part(v, from, t).unwrap();
            let after = metrics::km1(&hg);
            hg.change_node_part(v, t, from).unwrap();
            assert_eq!(gain, before - after, "km1 gain of node {v}");

            let gain = compute_gain(&hg, v, t, Objective::Cut);
            let before = metrics::cut(&hg);
            hg.change_node_part(v, from, t).unwrap();
            let after = metrics::cut(&hg);
            hg.change_node_part(v, t, from).unwrap();
            assert_eq!(gain, before - after, "cut gain of node {v}");
        }
    }

    #[test]
    fn pass_uncuts_the_heavy_nets() {
        let mut hg = s1_hypergraph();
        // Partition cutting both heavy nets.
        for v in [0, 1, 3] {
            hg.set_node_part(v, 0);
        }
        for v in [2, 4, 5, 6] {
            hg.set_node_part(v, 1);
        }
        let context = context(2, 0.03, Objective::Cut, 7);
        let mut random = Random::with_seed(1);
        let mut refiner = KWayFmRefiner::new(&hg, &context);
        let before = metrics::cut(&hg);
        let seeds: Vec<_> = hg.nodes().collect();
        let improved = refiner
            .refine(&mut hg, &context, &mut random, &seeds)
            .unwrap();
        assert!(improved);
        assert!(metrics::cut(&hg) < before);
        assert!(metrics::is_balanced(&hg, &context));
        hg.check_invariants();
    }

    #[test]
    fn refinement_reaches_a_fixed_point() {
        let mut hg = s1_hypergraph();
        for v in [0, 1, 3, 4] {
            hg.set_node_part(v, 0);
        }
        for v in [2, 5, 6] {
            hg.set_node_part(v, 1);
        }
        let context = context(2, 0.03, Objective::Cut, 7);
        let mut random = Random::with_seed(3);
        let mut refiner = KWayFmRefiner::new(&hg, &context);
        let seeds: Vec<_> = hg.nodes().collect();
        while refiner
            .refine(&mut hg, &context, &mut random, &seeds)
            .unwrap()
        {}
        let partition = hg.partition();
        let objective = metrics::cut(&hg);
        // A second invocation on the refined partition keeps every move out.
        let improved = refiner
            .refine(&mut hg, &context, &mut random, &seeds)
            .unwrap();
        assert!(!improved);
        assert_eq!(hg.partition(), partition);
        assert_eq!(metrics::cut(&hg), objective);
    }

    #[test]
    fn rejected_pass_restores_the_partition() {
        // One balanced net: every move only increases the cut, so the pass
        // must end in a full rollback.
        let mut hg = Hypergraph::new(2, &[1; 6], &[1], &[vec![0, 1, 2, 3, 4, 5]]);
        for v in 0..6 {
            hg.set_node_part(v, (v % 2) as PartitionId);
        }
        let context = context(2, 0.03, Objective::Cut, 6);
        let mut random = Random::with_seed(5);
        let snapshot = hg.partition();
        let mut refiner = KWayFmRefiner::new(&hg, &context);
        let seeds: Vec<_> = hg.nodes().collect();
        let improved = refiner
            .refine(&mut hg, &context, &mut random, &seeds)
            .unwrap();
        assert!(!improved);
        assert_eq!(hg.partition(), snapshot);
        hg.check_invariants();
    }

    #[test]
    fn fixed_vertices_never_move() {
        let mut hg = s1_hypergraph();
        hg.set_fixed_vertex(2, 1);
        for v in [0, 1, 3] {
            hg.set_node_part(v, 0);
        }
        for v in [2, 4, 5, 6] {
            hg.set_node_part(v, 1);
        }
        let context = context(2, 0.3, Objective::Km1, 7);
        let mut random = Random::with_seed(11);
        let mut refiner = KWayFmRefiner::new(&hg, &context);
        let seeds: Vec<_> = hg.nodes().collect();
        refiner.refine(&mut hg, &context, &mut random, &seeds).unwrap();
        assert_eq!(hg.part(2), 1);
    }

    /// Random instances drive the delta-update machinery through the
    /// in-pass `debug_assert_eq!(key, compute_gain(..))` audit.
    #[test]
    fn delta_updates_stay_consistent_on_random_hypergraphs() {
        let mut rng = StdRng::seed_from_u64(99);
        for round in 0..20 {
            let num_v = 24;
            let num_e = 16;
            let nets: Vec<Vec<HypernodeId>> = (0..num_e)
                .map(|_| {
                    let mut pins: Vec<HypernodeId> = (0..num_v as u32).collect();
                    pins.shuffle(&mut rng);
                    pins.truncate(rng.gen_range(2..6));
                    pins
                })
                .collect();
            let weights: Vec<i64> = (0..num_e).map(|_| rng.gen_range(1..10)).collect();
            let k = rng.gen_range(2..5);
            let mut hg = Hypergraph::new(k, &[1; 24], &weights, &nets);
            for v in 0..num_v as u32 {
                hg.set_node_part(v, rng.gen_range(0..k));
            }
            let objective = if round % 2 == 0 { Objective::Km1 } else { Objective::Cut };
            let context = context(k, 0.2, objective, num_v as i64);
            let mut random = Random::with_seed(round);
            let mut refiner = KWayFmRefiner::new(&hg, &context);
            let before = metrics::objective(&hg, objective);
            let seeds: Vec<_> = hg.nodes().collect();
            refiner
                .refine(&mut hg, &context, &mut random, &seeds)
                .unwrap();
            assert!(metrics::objective(&hg, objective) <= before);
            hg.check_invariants();
        }
    }
}
