use log::{debug, info};

use crate::coarsen::ContractionConstraint;
use crate::context::{Context, EvoCombineStrategy, EvoMutateStrategy, EvoReplaceStrategy, RatingScore};
use crate::error::Result;
use crate::hypergraph::Hypergraph;
use crate::metrics;
use crate::multilevel::{self, CoarsePartitionSource};
use crate::services::{Random, Timer};
use crate::{HyperedgeId, HyperedgeWeight, PartitionId};

/// One member of the population: a partition, its fitness, and the
/// cut-fingerprints the diverse replacement strategies compare by.
#[derive(Clone, Debug)]
pub(crate) struct Individual {
    pub(crate) partition: Vec<PartitionId>,
    pub(crate) fitness: HyperedgeWeight,
    cut_edges: Vec<HyperedgeId>,
    connectivity_minus_one: Vec<u32>,
}

impl Individual {
    pub(crate) fn from_hypergraph(hg: &Hypergraph, context: &Context) -> Self {
        let mut cut_edges = vec![];
        let mut connectivity_minus_one = vec![0; hg.initial_num_edges()];
        for e in hg.edges() {
            let lambda = hg.connectivity(e);
            if lambda >= 2 {
                cut_edges.push(e);
            }
            connectivity_minus_one[e as usize] = lambda.saturating_sub(1);
        }
        Individual {
            partition: hg.partition(),
            fitness: metrics::objective(hg, context.partition.objective),
            cut_edges,
            connectivity_minus_one,
        }
    }

    /// Size of the symmetric difference of the cut-edge sets.
    fn cut_difference(&self, other: &Individual) -> u64 {
        let mut difference = 0;
        let (mut i, mut j) = (0, 0);
        while i < self.cut_edges.len() && j < other.cut_edges.len() {
            match self.cut_edges[i].cmp(&other.cut_edges[j]) {
                std::cmp::Ordering::Less => {
                    difference += 1;
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    difference += 1;
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        difference + (self.cut_edges.len() - i) as u64 + (other.cut_edges.len() - j) as u64
    }

    /// Σ |λ₁(e) − λ₂(e)| over all hyperedges.
    fn connectivity_difference(&self, other: &Individual) -> u64 {
        self.connectivity_minus_one
            .iter()
            .zip(&other.connectivity_minus_one)
            .map(|(&a, &b)| a.abs_diff(b) as u64)
            .sum()
    }
}

/// Ordered list of individuals with strategy-driven displacement.
#[derive(Default)]
pub(crate) struct Population {
    individuals: Vec<Individual>,
}

impl Population {
    pub(crate) fn size(&self) -> usize {
        self.individuals.len()
    }

    pub(crate) fn individual(&self, i: usize) -> &Individual {
        &self.individuals[i]
    }

    pub(crate) fn push(&mut self, individual: Individual) {
        self.individuals.push(individual);
    }

    pub(crate) fn best(&self) -> usize {
        let mut best = 0;
        for i in 1..self.individuals.len() {
            if self.individuals[i].fitness < self.individuals[best].fitness {
                best = i;
            }
        }
        best
    }

    pub(crate) fn worst(&self) -> usize {
        let mut worst = 0;
        for i in 1..self.individuals.len() {
            if self.individuals[i].fitness > self.individuals[worst].fitness {
                worst = i;
            }
        }
        worst
    }

    pub(crate) fn random_index(&self, random: &mut Random) -> usize {
        random.index(self.individuals.len())
    }

    /// Binary tournament: the fitter of two random members.
    pub(crate) fn tournament(&self, random: &mut Random) -> usize {
        let a = self.random_index(random);
        let b = self.random_index(random);
        if self.individuals[a].fitness <= self.individuals[b].fitness {
            a
        } else {
            b
        }
    }

    /// Inserts by the configured replace strategy; returns the replaced slot
    /// or None if the candidate was rejected.
    pub(crate) fn insert(
        &mut self,
        individual: Individual,
        context: &Context,
    ) -> Option<usize> {
        if self.individuals.len() < context.evolutionary.population_size {
            self.individuals.push(individual);
            return Some(self.individuals.len() - 1);
        }
        match context.evolutionary.replace_strategy {
            EvoReplaceStrategy::Worst => {
                let worst = self.worst();
                if individual.fitness > self.individuals[worst].fitness {
                    return None;
                }
                self.individuals[worst] = individual;
                Some(worst)
            }
            EvoReplaceStrategy::Diverse => {
                self.replace_most_similar(individual, |a, b| a.cut_difference(b))
            }
            EvoReplaceStrategy::StrongDiverse => {
                self.replace_most_similar(individual, |a, b| a.connectivity_difference(b))
            }
        }
    }

    fn replace_most_similar(
        &mut self,
        individual: Individual,
        difference: impl Fn(&Individual, &Individual) -> u64,
    ) -> Option<usize> {
        let mut victim = 0;
        let mut smallest = u64::MAX;
        for (i, other) in self.individuals.iter().enumerate() {
            let d = difference(&individual, other);
            if d < smallest {
                smallest = d;
                victim = i;
            }
        }
        if individual.fitness > self.individuals[victim].fitness {
            return None;
        }
        self.individuals[victim] = individual;
        Some(victim)
    }

    pub(crate) fn replace_at(&mut self, position: usize, individual: Individual) {
        self.individuals[position] = individual;
    }

    /// How often each hyperedge is cut among the `amount` fittest members,
    /// normalised to [0, 1].
    pub(crate) fn edge_frequencies(&self, num_edges: usize, amount: usize) -> Vec<f64> {
        let amount = amount.clamp(1, self.individuals.len());
        let mut ranked: Vec<usize> = (0..self.individuals.len()).collect();
        ranked.sort_by_key(|&i| self.individuals[i].fitness);
        let mut frequencies = vec![0.0; num_edges];
        for &i in ranked.iter().take(amount) {
            for &e in &self.individuals[i].cut_edges {
                frequencies[e as usize] += 1.0;
            }
        }
        for f in &mut frequencies {
            *f /= amount as f64;
        }
        frequencies
    }
}

/// Population size from the first individual's runtime: the initial
/// population should consume roughly the configured fraction of the budget.
pub(crate) fn dynamic_population_size(context: &Context, total_evolutionary: f64) -> usize {
    let target = (context.evolutionary.dynamic_population_amount_of_time
        * context.evolutionary.time_limit_seconds
        / total_evolutionary)
        .round() as i64;
    (target.max(3) as usize).min(50)
}

enum EvoDecision {
    Mutation,
    Combine,
}

/// Evolutionary outer loop: maintain a population of partitions under a
/// wall-clock budget, combining and mutating until time runs out; the final
/// partition is the best individual.
pub fn evo_partition(
    hg: &mut Hypergraph,
    context: &mut Context,
    random: &mut Random,
    timer: &mut Timer,
) -> Result<()> {
    let time_limit = context.evolutionary.time_limit_seconds;
    let mut population = Population::default();
    let mut iteration: u64 = 0;

    generate_initial_population(hg, context, random, timer, &mut population)?;

    while timer.total_evolutionary() <= time_limit {
        iteration += 1;
        if let Some(interval) = context.evolutionary.diversify_interval {
            if interval > 0 && iteration % interval == 0 {
                diversify(hg, context, random, &mut population)?;
            }
        }
        let span = Timer::start_span();
        match decide_next_move(context, random) {
            EvoDecision::Mutation => perform_mutation(hg, context, random, &mut population)?,
            EvoDecision::Combine => perform_combine(hg, context, random, &mut population)?,
        }
        timer.add_evolutionary(span.elapsed().as_secs_f64());
    }

    let best = population.best();
    info!(
        "evolutionary search: {} iterations, best fitness {}",
        iteration,
        population.individual(best).fitness
    );
    hg.set_partition(&population.individual(best).partition.clone());
    Ok(())
}

fn generate_initial_population(
    hg: &mut Hypergraph,
    context: &mut Context,
    random: &mut Random,
    timer: &mut Timer,
    population: &mut Population,
) -> Result<()> {
    let time_limit = context.evolutionary.time_limit_seconds;
    if context.evolutionary.dynamic_population_size {
        let span = Timer::start_span();
        generate_individual(hg, context, random, population)?;
        timer.add_evolutionary(span.elapsed().as_secs_f64());
        context.evolutionary.population_size =
            dynamic_population_size(context, timer.total_evolutionary());
        debug!(
            "dynamic population size: {}",
            context.evolutionary.population_size
        );
    }
    context.evolutionary.edge_frequency_amount =
        (context.evolutionary.population_size as f64).sqrt().floor() as usize;

    while population.size() < context.evolutionary.population_size
        && timer.total_evolutionary() <= time_limit
    {
        let span = Timer::start_span();
        generate_individual(hg, context, random, population)?;
        timer.add_evolutionary(span.elapsed().as_secs_f64());
    }
    Ok(())
}

fn generate_individual(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    population: &mut Population,
) -> Result<()> {
    hg.reset_partition();
    multilevel::partition(hg, context, random)?;
    population.push(Individual::from_hypergraph(hg, context));
    Ok(())
}

fn decide_next_move(context: &Context, random: &mut Random) -> EvoDecision {
    if random.float() < context.evolutionary.mutation_chance {
        EvoDecision::Mutation
    } else {
        EvoDecision::Combine
    }
}

fn pick_combine_strategy(context: &Context, random: &mut Random) -> EvoCombineStrategy {
    if context.evolutionary.combine_strategy == EvoCombineStrategy::EdgeFrequency
        || random.float() < context.evolutionary.edge_frequency_chance
    {
        EvoCombineStrategy::EdgeFrequency
    } else {
        EvoCombineStrategy::Basic
    }
}

fn perform_combine(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    population: &mut Population,
) -> Result<()> {
    match pick_combine_strategy(context, random) {
        EvoCombineStrategy::Basic => {
            let a = population.tournament(random);
            let b = population.tournament(random);
            let (first, second) = if population.individual(a).fitness
                <= population.individual(b).fitness
            {
                (a, b)
            } else {
                (b, a)
            };
            let parent_1 = population.individual(first).partition.clone();
            let parent_2 = population.individual(second).partition.clone();
            let constraint =
                ContractionConstraint::new(vec![parent_1.clone(), parent_2]);
            hg.reset_partition();
            multilevel::multilevel_run(
                hg,
                context,
                random,
                None,
                Some(&constraint),
                CoarsePartitionSource::Projected(&parent_1),
            )?;
            let offspring = Individual::from_hypergraph(hg, context);
            debug_assert!(offspring.fitness <= population.individual(first).fitness);
            population.insert(offspring, context);
        }
        EvoCombineStrategy::EdgeFrequency => {
            let frequencies = population.edge_frequencies(
                hg.initial_num_edges(),
                context.evolutionary.edge_frequency_amount.max(1),
            );
            let mut frequency_context = context.clone();
            frequency_context.coarsening.rating.score = RatingScore::EdgeFrequency;
            hg.reset_partition();
            multilevel::multilevel_run(
                hg,
                &frequency_context,
                random,
                Some(&frequencies),
                None,
                CoarsePartitionSource::InitialPartitioner,
            )?;
            population.insert(Individual::from_hypergraph(hg, context), context);
        }
    }
    Ok(())
}

fn perform_mutation(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    population: &mut Population,
) -> Result<()> {
    let position = population.random_index(random);
    hg.set_partition(&population.individual(position).partition.clone());
    let fresh_initial = matches!(
        context.evolutionary.mutate_strategy,
        EvoMutateStrategy::NewInitialPartitioningVcycle
    );
    multilevel::vcycle(hg, context, random, fresh_initial)?;
    population.insert(Individual::from_hypergraph(hg, context), context);
    Ok(())
}

/// Stable-net diversification: hyperedges cut in most of the population are
/// forced into the lightest block of a random individual, pushing the search
/// away from the consensus.
fn diversify(
    hg: &mut Hypergraph,
    context: &Context,
    random: &mut Random,
    population: &mut Population,
) -> Result<()> {
    let frequencies = population.edge_frequencies(hg.initial_num_edges(), population.size());
    let stable: Vec<HyperedgeId> = hg
        .edges()
        .filter(|&e| frequencies[e as usize] >= context.evolutionary.stable_net_amount)
        .collect();
    if stable.is_empty() {
        return Ok(());
    }
    let position = population.random_index(random);
    hg.set_partition(&population.individual(position).partition.clone());
    for e in stable {
        force_block(hg, e)?;
    }
    population.replace_at(position, Individual::from_hypergraph(hg, context));
    Ok(())
}

/// Moves every pin of the hyperedge into the lightest block.
fn force_block(hg: &mut Hypergraph, e: HyperedgeId) -> Result<()> {
    let smallest = (0..hg.k())
        .min_by_key(|&p| hg.part_weight(p))
        .unwrap_or(0);
    for pin in hg.pins(e).collect::<Vec<_>>() {
        let from = hg.part(pin);
        if from != smallest && !hg.is_fixed(pin) {
            hg.change_node_part(pin, from, smallest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Objective;

    fn hypergraph() -> Hypergraph {
        Hypergraph::new(
            2,
            &[1; 7],
            &[1, 1000, 1, 1000],
            &[vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
        )
    }

    fn evo_context() -> Context {
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.15;
        context.partition.objective = Objective::Km1;
        context.coarsening.rating.use_communities = false;
        context.initial_partitioning.nruns = 2;
        context.evolutionary.enabled = true;
        context.evolutionary.population_size = 4;
        context.setup_part_weights(7);
        context
    }

    fn individual(hg: &mut Hypergraph, context: &Context, parts: &[PartitionId]) -> Individual {
        hg.set_partition(parts);
        Individual::from_hypergraph(hg, context)
    }

    #[test]
    fn dynamic_population_size_is_clamped() {
        let mut context = evo_context();
        context.evolutionary.time_limit_seconds = 60.0;
        context.evolutionary.dynamic_population_amount_of_time = 0.15;
        // 0.15 * 60 / 0.2 = 45 single runs fit into the budgeted fraction.
        assert_eq!(dynamic_population_size(&context, 0.2), 45);
        // Very fast runs are capped at 50 ...
        assert_eq!(dynamic_population_size(&context, 0.01), 50);
        // ... and very slow ones keep a minimum of 3.
        assert_eq!(dynamic_population_size(&context, 30.0), 3);
    }

    #[test]
    fn replace_worst_rejects_worse_candidates() {
        let mut hg = hypergraph();
        let mut context = evo_context();
        context.evolutionary.population_size = 2;
        context.evolutionary.replace_strategy = EvoReplaceStrategy::Worst;
        let mut population = Population::default();
        let good = individual(&mut hg, &context, &[0, 0, 1, 0, 0, 1, 1]);
        let bad = individual(&mut hg, &context, &[0, 1, 0, 1, 0, 1, 0]);
        assert!(good.fitness < bad.fitness);
        population.insert(good.clone(), &context);
        population.insert(good.clone(), &context);
        // Worse than the current worst: rejected.
        assert_eq!(population.insert(bad.clone(), &context), None);
        // Equal fitness displaces the worst slot.
        assert!(population.insert(good, &context).is_some());
    }

    #[test]
    fn diverse_replacement_targets_the_most_similar() {
        let mut hg = hypergraph();
        let mut context = evo_context();
        context.evolutionary.population_size = 2;
        context.evolutionary.replace_strategy = EvoReplaceStrategy::Diverse;
        let mut population = Population::default();
        let a = individual(&mut hg, &context, &[0, 0, 1, 0, 0, 1, 1]);
        let b = individual(&mut hg, &context, &[0, 1, 0, 1, 0, 1, 0]);
        population.insert(a.clone(), &context);
        population.insert(b, &context);
        // A twin of `a` must displace `a`, not the dissimilar individual.
        let replaced = population.insert(a.clone(), &context);
        assert_eq!(replaced, Some(0));
        assert_eq!(population.individual(0).cut_edges, a.cut_edges);
    }

    #[test]
    fn combine_offspring_is_no_worse_than_the_fitter_parent() {
        let mut hg = hypergraph();
        let mut context = evo_context();
        context.evolutionary.combine_strategy = EvoCombineStrategy::Basic;
        context.evolutionary.edge_frequency_chance = 0.0;
        let mut random = Random::with_seed(5);
        let mut population = Population::default();
        for parts in [
            [0, 0, 1, 0, 0, 1, 1],
            [1, 1, 0, 1, 1, 0, 0],
            [0, 1, 1, 0, 0, 1, 1],
        ] {
            population.push(individual(&mut hg, &context, &parts));
        }
        let best_before = population.individual(population.best()).fitness;
        perform_combine(&mut hg, &context, &mut random, &mut population).unwrap();
        let best_after = population.individual(population.best()).fitness;
        assert!(best_after <= best_before);
    }

    #[test]
    fn evolution_respects_the_time_limit() {
        let mut hg = hypergraph();
        let mut context = evo_context();
        context.evolutionary.time_limit_seconds = 0.2;
        context.evolutionary.population_size = 3;
        context.evolutionary.mutation_chance = 0.3;
        let mut random = Random::with_seed(9);
        let mut timer = Timer::new();
        evo_partition(&mut hg, &mut context, &mut random, &mut timer).unwrap();

        let total = timer.total_evolutionary();
        let spans = timer.evolutionary_spans();
        let last = spans.last().copied().unwrap_or(0.0);
        assert!(total > context.evolutionary.time_limit_seconds);
        assert!(total - last <= context.evolutionary.time_limit_seconds);
        // The final partition is the population's best and is complete.
        assert!(hg.nodes().all(|v| hg.has_part(v)));
    }

    #[test]
    fn edge_frequency_amount_is_sqrt_of_population() {
        let mut hg = hypergraph();
        let mut context = evo_context();
        context.evolutionary.population_size = 9;
        context.evolutionary.time_limit_seconds = 1000.0;
        let mut random = Random::with_seed(2);
        let mut timer = Timer::new();
        let mut population = Population::default();
        generate_initial_population(&mut hg, &mut context, &mut random, &mut timer, &mut population)
            .unwrap();
        assert_eq!(context.evolutionary.edge_frequency_amount, 3);
        assert_eq!(population.size(), 9);
    }
}
