use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::NodeWeight;

macro_rules! policy_enum {
    ($name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($repr => Ok($name::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", stringify!($name), " '{}'"), other))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let repr = match self {
                    $($name::$variant => $repr),+
                };
                f.write_str(repr)
            }
        }
    };
}

policy_enum!(Objective { Cut => "cut", Km1 => "km1" });
policy_enum!(Mode { Direct => "direct", Recursive => "recursive" });
policy_enum!(CoarseningAlgorithm {
    MlStyle => "ml_style",
    HeavyFull => "heavy_full",
    HeavyLazy => "heavy_lazy",
});
policy_enum!(RatingScore { HeavyEdge => "heavy_edge", EdgeFrequency => "edge_frequency" });
policy_enum!(HeavyNodePenalty { Multiplicative => "multiplicative", NoPenalty => "no_penalty" });
policy_enum!(AcceptancePolicy { Random => "random", PreferUnmatched => "prefer_unmatched" });
policy_enum!(FixedVertexAcceptance {
    FreeVertexOnly => "free_vertex_only",
    FixedVertexAllowed => "fixed_vertex_allowed",
    EquivalentVertices => "equivalent_vertices",
});
policy_enum!(InitialPartitioningTechnique { Flat => "flat", Multilevel => "multilevel" });
policy_enum!(LocalSearchAlgorithm { Fm => "fm", Flow => "flow", FmFlow => "fm_flow" });
policy_enum!(FmStoppingRule { Simple => "simple", AdaptiveOpt => "adaptive_opt" });
policy_enum!(FlowAlgorithm {
    EdmondsKarp => "edmond_karp",
    GoldbergTarjan => "goldberg_tarjan",
});
policy_enum!(FlowNetworkPolicy {
    Lawler => "lawler",
    Heuer => "heuer",
    Wong => "wong",
    Hybrid => "hybrid",
});
policy_enum!(FlowExecutionPolicy {
    Constant => "constant",
    Exponential => "exponential",
    Multilevel => "multilevel",
});
policy_enum!(EvoCombineStrategy { Basic => "basic", EdgeFrequency => "edge_frequency" });
policy_enum!(EvoMutateStrategy {
    Vcycle => "vcycle",
    NewInitialPartitioningVcycle => "new_initial_partitioning_vcycle",
});
policy_enum!(EvoReplaceStrategy {
    Worst => "worst",
    Diverse => "diverse",
    StrongDiverse => "strong-diverse",
});

#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub k: u32,
    pub epsilon: f64,
    pub objective: Objective,
    pub mode: Mode,
    pub seed: u64,
    pub vcycles: u32,
    /// `None` means no threshold. The CLI encodes this as `-1`.
    pub hyperedge_size_threshold: Option<usize>,
    pub use_individual_block_weights: bool,
    pub individual_block_weights: Vec<NodeWeight>,
    /// Per-block capacity, derived once the hypergraph is known.
    pub max_part_weights: Vec<NodeWeight>,
    pub quiet: bool,
}

impl Default for PartitionContext {
    fn default() -> Self {
        PartitionContext {
            k: 2,
            epsilon: 0.03,
            objective: Objective::Km1,
            mode: Mode::Direct,
            seed: 0,
            vcycles: 0,
            hyperedge_size_threshold: None,
            use_individual_block_weights: false,
            individual_block_weights: vec![],
            max_part_weights: vec![],
            quiet: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatingContext {
    pub score: RatingScore,
    pub heavy_node_penalty: HeavyNodePenalty,
    pub acceptance: AcceptancePolicy,
    pub use_communities: bool,
    pub fixed_vertex_acceptance: FixedVertexAcceptance,
}

impl Default for RatingContext {
    fn default() -> Self {
        RatingContext {
            score: RatingScore::HeavyEdge,
            heavy_node_penalty: HeavyNodePenalty::Multiplicative,
            acceptance: AcceptancePolicy::Random,
            use_communities: true,
            fixed_vertex_acceptance: FixedVertexAcceptance::FreeVertexOnly,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoarseningContext {
    pub algorithm: CoarseningAlgorithm,
    pub rating: RatingContext,
    /// Coarsening halts at `contraction_limit_multiplier * k` nodes.
    pub contraction_limit_multiplier: u32,
    /// Weight cap factor s in s * c(V) / (t * k).
    pub max_allowed_weight_multiplier: f64,
}

impl Default for CoarseningContext {
    fn default() -> Self {
        CoarseningContext {
            algorithm: CoarseningAlgorithm::HeavyLazy,
            rating: RatingContext::default(),
            contraction_limit_multiplier: 160,
            max_allowed_weight_multiplier: 3.25,
        }
    }
}

impl CoarseningContext {
    pub(crate) fn contraction_limit(&self, k: u32) -> usize {
        (self.contraction_limit_multiplier as usize) * k as usize
    }

    pub(crate) fn max_allowed_node_weight(&self, total_weight: NodeWeight, k: u32) -> NodeWeight {
        let limit = self.contraction_limit(k) as f64;
        ((self.max_allowed_weight_multiplier * total_weight as f64) / limit).ceil() as NodeWeight
    }
}

#[derive(Debug, Clone)]
pub struct InitialPartitioningContext {
    pub technique: InitialPartitioningTechnique,
    pub nruns: u32,
}

impl Default for InitialPartitioningContext {
    fn default() -> Self {
        InitialPartitioningContext {
            technique: InitialPartitioningTechnique::Flat,
            nruns: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FmContext {
    pub stopping_rule: FmStoppingRule,
    /// Bound on consecutive fruitless moves for the `simple` rule.
    pub max_fruitless_moves: u32,
    /// α of the adaptive random-walk stopping model.
    pub adaptive_stop_alpha: f64,
}

impl Default for FmContext {
    fn default() -> Self {
        FmContext {
            stopping_rule: FmStoppingRule::Simple,
            max_fruitless_moves: 350,
            adaptive_stop_alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowContext {
    pub algorithm: FlowAlgorithm,
    pub network: FlowNetworkPolicy,
    pub execution_policy: FlowExecutionPolicy,
    /// Region growth bound per block side, and the start of the adaptive
    /// α halving loop.
    pub alpha: f64,
    /// Stride of the `constant` execution policy.
    pub beta: usize,
    pub use_most_balanced_minimum_cut: bool,
    pub use_adaptive_alpha_stopping_rule: bool,
    pub ignore_small_hyperedge_cut: bool,
}

impl Default for FlowContext {
    fn default() -> Self {
        FlowContext {
            algorithm: FlowAlgorithm::GoldbergTarjan,
            network: FlowNetworkPolicy::Hybrid,
            execution_policy: FlowExecutionPolicy::Exponential,
            alpha: 16.0,
            beta: 128,
            use_most_balanced_minimum_cut: true,
            use_adaptive_alpha_stopping_rule: true,
            ignore_small_hyperedge_cut: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalSearchContext {
    pub algorithm: LocalSearchAlgorithm,
    pub iterations_per_level: u32,
    pub fm: FmContext,
    pub flow: FlowContext,
}

impl Default for LocalSearchContext {
    fn default() -> Self {
        LocalSearchContext {
            algorithm: LocalSearchAlgorithm::Fm,
            iterations_per_level: 1,
            fm: FmContext::default(),
            flow: FlowContext::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessingContext {
    pub detect_communities: bool,
    pub max_community_pass_iterations: u32,
}

impl Default for PreprocessingContext {
    fn default() -> Self {
        PreprocessingContext {
            detect_communities: false,
            max_community_pass_iterations: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvolutionaryContext {
    pub enabled: bool,
    pub time_limit_seconds: f64,
    pub population_size: usize,
    pub dynamic_population_size: bool,
    /// Fraction of the budget one run is expected to take when sizing the
    /// population dynamically.
    pub dynamic_population_amount_of_time: f64,
    pub mutation_chance: f64,
    pub edge_frequency_chance: f64,
    /// `None` disables diversification. The CLI encodes this as `-1`.
    pub diversify_interval: Option<u64>,
    pub combine_strategy: EvoCombineStrategy,
    pub mutate_strategy: EvoMutateStrategy,
    pub replace_strategy: EvoReplaceStrategy,
    /// Damping of the edge-frequency rating.
    pub gamma: f64,
    /// Number of fittest individuals feeding the edge-frequency counts,
    /// recomputed as ⌊√population_size⌋ after sizing.
    pub edge_frequency_amount: usize,
    /// A hyperedge cut in at least this fraction of individuals is a stable
    /// net for diversification.
    pub stable_net_amount: f64,
}

impl Default for EvolutionaryContext {
    fn default() -> Self {
        EvolutionaryContext {
            enabled: false,
            time_limit_seconds: 0.0,
            population_size: 50,
            dynamic_population_size: false,
            dynamic_population_amount_of_time: 0.15,
            mutation_chance: 0.5,
            edge_frequency_chance: 0.5,
            diversify_interval: None,
            combine_strategy: EvoCombineStrategy::Basic,
            mutate_strategy: EvoMutateStrategy::Vcycle,
            replace_strategy: EvoReplaceStrategy::Worst,
            gamma: 0.5,
            edge_frequency_amount: 0,
            stable_net_amount: 0.5,
        }
    }
}

/// Immutable-after-setup bag of algorithm parameters. Built from defaults,
/// then a preset file, then CLI overrides, then validated once.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub partition: PartitionContext,
    pub coarsening: CoarseningContext,
    pub initial_partitioning: InitialPartitioningContext,
    pub local_search: LocalSearchContext,
    pub preprocessing: PreprocessingContext,
    pub evolutionary: EvolutionaryContext,
}

impl Context {
    /// Rejects option combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.partition.k < 2 {
            return Err(Error::Config(format!(
                "k must be at least 2, got {}",
                self.partition.k
            )));
        }
        if self.partition.epsilon < 0.0 {
            return Err(Error::Config(format!(
                "epsilon must be non-negative, got {}",
                self.partition.epsilon
            )));
        }
        if self.partition.mode == Mode::Recursive && self.partition.vcycles > 0 {
            return Err(Error::Config(
                "V-cycles are only supported in direct mode".to_string(),
            ));
        }
        if self.partition.use_individual_block_weights
            && self.partition.individual_block_weights.len() != self.partition.k as usize
        {
            return Err(Error::Config(format!(
                "expected {} individual block weights, got {}",
                self.partition.k,
                self.partition.individual_block_weights.len()
            )));
        }
        if self.evolutionary.enabled && self.evolutionary.time_limit_seconds <= 0.0 {
            return Err(Error::Config(
                "evolutionary partitioning requires a positive time-limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Derives the per-block capacities once the total vertex weight is known.
    pub fn setup_part_weights(&mut self, total_weight: NodeWeight) {
        let k = self.partition.k as usize;
        if self.partition.use_individual_block_weights {
            self.partition.max_part_weights = self.partition.individual_block_weights.clone();
        } else {
            let average = (total_weight as f64 / k as f64).ceil();
            let cap = ((1.0 + self.partition.epsilon) * average).floor() as NodeWeight;
            self.partition.max_part_weights = vec![cap; k];
        }
    }

    /// Applies one `key=value` pair. Returns false for unrecognised keys so
    /// preset parsing can skip them for forward compatibility.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: fmt::Display,
        {
            value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("bad value '{value}' for {key}: {e}")))
        }

        match key {
            "k" | "blocks" => self.partition.k = parse(key, value)?,
            "e" | "epsilon" => self.partition.epsilon = parse(key, value)?,
            "objective" => self.partition.objective = parse(key, value)?,
            "mode" => self.partition.mode = parse(key, value)?,
            "seed" => self.partition.seed = parse(key, value)?,
            "vcycles" => self.partition.vcycles = parse(key, value)?,
            "cmaxnet" => {
                let raw: i64 = parse(key, value)?;
                self.partition.hyperedge_size_threshold = match raw {
                    -1 => None,
                    n if n < 0 => {
                        return Err(Error::Config(format!(
                            "cmaxnet must be -1 (no threshold) or non-negative, got {n}"
                        )))
                    }
                    n => Some(n as usize),
                };
            }
            "use-individual-blockweights" => {
                self.partition.use_individual_block_weights = parse(key, value)?
            }
            "quiet" => self.partition.quiet = parse(key, value)?,

            "c-type" => self.coarsening.algorithm = parse(key, value)?,
            "c-t" => self.coarsening.contraction_limit_multiplier = parse(key, value)?,
            "c-s" => self.coarsening.max_allowed_weight_multiplier = parse(key, value)?,
            "c-rating-score" => self.coarsening.rating.score = parse(key, value)?,
            "c-rating-heavy-node-penalty" => {
                self.coarsening.rating.heavy_node_penalty = parse(key, value)?
            }
            "c-rating-acceptance-criterion" => {
                self.coarsening.rating.acceptance = parse(key, value)?
            }
            "c-rating-use-communities" => {
                self.coarsening.rating.use_communities = parse(key, value)?
            }
            "c-fixed-vertex-acceptance-criterion" => {
                self.coarsening.rating.fixed_vertex_acceptance = parse(key, value)?
            }

            "i-mode" => self.initial_partitioning.technique = parse(key, value)?,
            "i-runs" => self.initial_partitioning.nruns = parse(key, value)?,

            "r-type" => self.local_search.algorithm = parse(key, value)?,
            "r-runs-per-level" => self.local_search.iterations_per_level = parse(key, value)?,
            "r-fm-stop" => self.local_search.fm.stopping_rule = parse(key, value)?,
            "r-fm-stop-i" => self.local_search.fm.max_fruitless_moves = parse(key, value)?,
            "r-fm-stop-alpha" => self.local_search.fm.adaptive_stop_alpha = parse(key, value)?,
            "r-flow-algorithm" => self.local_search.flow.algorithm = parse(key, value)?,
            "r-flow-network" => self.local_search.flow.network = parse(key, value)?,
            "r-flow-execution-policy" => {
                self.local_search.flow.execution_policy = parse(key, value)?
            }
            "r-flow-alpha" => self.local_search.flow.alpha = parse(key, value)?,
            "r-flow-beta" => self.local_search.flow.beta = parse(key, value)?,
            "r-flow-use-most-balanced-minimum-cut" => {
                self.local_search.flow.use_most_balanced_minimum_cut = parse(key, value)?
            }
            "r-flow-use-adaptive-alpha-stopping-rule" => {
                self.local_search.flow.use_adaptive_alpha_stopping_rule = parse(key, value)?
            }
            "r-flow-ignore-small-hyperedge-cut" => {
                self.local_search.flow.ignore_small_hyperedge_cut = parse(key, value)?
            }

            "p-detect-communities" => self.preprocessing.detect_communities = parse(key, value)?,
            "p-max-community-pass-iterations" => {
                self.preprocessing.max_community_pass_iterations = parse(key, value)?
            }

            "evolutionary" => self.evolutionary.enabled = parse(key, value)?,
            "time-limit" => self.evolutionary.time_limit_seconds = parse(key, value)?,
            "population-size" => self.evolutionary.population_size = parse(key, value)?,
            "dynamic-population-size" => {
                self.evolutionary.dynamic_population_size = parse(key, value)?
            }
            "dynamic-population-fraction" => {
                self.evolutionary.dynamic_population_amount_of_time = parse(key, value)?
            }
            "mutation-chance" => self.evolutionary.mutation_chance = parse(key, value)?,
            "edge-frequency-chance" => {
                self.evolutionary.edge_frequency_chance = parse(key, value)?
            }
            "diversify-interval" => {
                let raw: i64 = parse(key, value)?;
                self.evolutionary.diversify_interval = if raw < 0 { None } else { Some(raw as u64) };
            }
            "combine-strategy" => {
                if value == "with_edge_frequency_information" {
                    return Err(Error::Config(
                        "combine strategy 'with_edge_frequency_information' has been removed; \
                         use 'edge_frequency'"
                            .to_string(),
                    ));
                }
                self.evolutionary.combine_strategy = parse(key, value)?;
            }
            "mutate-strategy" => self.evolutionary.mutate_strategy = parse(key, value)?,
            "replace-strategy" => self.evolutionary.replace_strategy = parse(key, value)?,
            "gamma" => self.evolutionary.gamma = parse(key, value)?,
            "stable-net-amount" => self.evolutionary.stable_net_amount = parse(key, value)?,

            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Reads a `.ini` preset. Lines are `key=value`; `#`, `;` and `%` start
    /// comments; unknown keys are skipped.
    pub fn apply_preset(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('%') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "{}:{}: expected key=value, got '{}'",
                    path.display(),
                    lineno + 1,
                    line
                )));
            };
            let key = key.trim();
            let value = value.trim();
            if !self.set_option(key, value)? {
                log::debug!("ignoring unknown preset key '{key}'");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_names() {
        assert_eq!("km1".parse::<Objective>().unwrap(), Objective::Km1);
        assert_eq!(
            "heavy_lazy".parse::<CoarseningAlgorithm>().unwrap(),
            CoarseningAlgorithm::HeavyLazy
        );
        assert_eq!(
            "strong-diverse".parse::<EvoReplaceStrategy>().unwrap(),
            EvoReplaceStrategy::StrongDiverse
        );
        assert!("heavy_lazyy".parse::<CoarseningAlgorithm>().is_err());
    }

    #[test]
    fn cmaxnet_sentinel() {
        let mut context = Context::default();
        context.set_option("cmaxnet", "-1").unwrap();
        assert_eq!(context.partition.hyperedge_size_threshold, None);
        context.set_option("cmaxnet", "50").unwrap();
        assert_eq!(context.partition.hyperedge_size_threshold, Some(50));
        assert!(context.set_option("cmaxnet", "-7").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut context = Context::default();
        assert!(!context.set_option("some-future-option", "1").unwrap());
    }

    #[test]
    fn removed_combine_strategy_is_rejected() {
        let mut context = Context::default();
        assert!(context
            .set_option("combine-strategy", "with_edge_frequency_information")
            .is_err());
        context.set_option("combine-strategy", "edge_frequency").unwrap();
        assert_eq!(
            context.evolutionary.combine_strategy,
            EvoCombineStrategy::EdgeFrequency
        );
    }

    #[test]
    fn recursive_mode_with_vcycles_is_rejected() {
        let mut context = Context::default();
        context.partition.mode = Mode::Recursive;
        context.partition.vcycles = 3;
        assert!(context.validate().is_err());
        context.partition.vcycles = 0;
        assert!(context.validate().is_ok());
    }

    #[test]
    fn part_weights_respect_epsilon() {
        let mut context = Context::default();
        context.partition.k = 2;
        context.partition.epsilon = 0.03;
        context.setup_part_weights(7);
        // ceil(7/2) = 4, floor(4 * 1.03) = 4
        assert_eq!(context.partition.max_part_weights, vec![4, 4]);
    }
}
