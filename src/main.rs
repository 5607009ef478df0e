use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use log::info;

use hypart::{
    apply_fixed_vertices, cut, evo_partition, imbalance, km1, partition, partition_file_name,
    read_hypergraph, write_partition, Context, Random, Timer,
};

/// k-way hypergraph partitioner: minimises the cut or connectivity metric
/// of a hypergraph partition under a balance constraint.
#[derive(Parser)]
#[command(name = "hypart", version, disable_help_flag = true)]
struct Cli {
    /// Print this help text.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Hypergraph file (hMetis format).
    #[arg(short = 'h', value_name = "FILE")]
    hypergraph: PathBuf,

    /// Number of blocks.
    #[arg(short = 'k', value_name = "INT")]
    blocks: u32,

    /// Imbalance tolerance ε.
    #[arg(short = 'e', value_name = "FLOAT")]
    epsilon: f64,

    /// Objective: cut | km1.
    #[arg(short = 'o', value_name = "OBJ")]
    objective: String,

    /// Partitioning mode: direct | recursive.
    #[arg(short = 'm', value_name = "MODE")]
    mode: String,

    /// Preset file with key=value lines; CLI flags override it.
    #[arg(short = 'p', value_name = "FILE")]
    preset: Option<PathBuf>,

    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Hyperedges with more pins are ignored; -1 disables the threshold.
    #[arg(long, value_name = "INT", allow_hyphen_values = true)]
    cmaxnet: Option<i64>,

    #[arg(long, value_name = "INT")]
    vcycles: Option<u32>,

    /// Fixed-vertex file: one block id per vertex, -1 = free.
    #[arg(short = 'f', long = "fixed-vertices", value_name = "FILE")]
    fixed_vertices: Option<PathBuf>,

    #[arg(long = "use-individual-blockweights")]
    use_individual_blockweights: bool,

    /// Individual block weights w_0 .. w_{k-1}.
    #[arg(long = "blockweights", value_name = "W", num_args = 1..)]
    blockweights: Vec<i64>,

    #[arg(long)]
    quiet: bool,

    // Coarsening.
    #[arg(long = "c-type", value_name = "POLICY")]
    c_type: Option<String>,
    #[arg(long = "c-t", value_name = "INT")]
    c_t: Option<String>,
    #[arg(long = "c-s", value_name = "FLOAT")]
    c_s: Option<String>,
    #[arg(long = "c-rating-score", value_name = "POLICY")]
    c_rating_score: Option<String>,
    #[arg(long = "c-rating-heavy-node-penalty", value_name = "POLICY")]
    c_rating_heavy_node_penalty: Option<String>,
    #[arg(long = "c-rating-acceptance-criterion", value_name = "POLICY")]
    c_rating_acceptance_criterion: Option<String>,
    #[arg(long = "c-rating-use-communities", value_name = "BOOL")]
    c_rating_use_communities: Option<String>,
    #[arg(long = "c-fixed-vertex-acceptance-criterion", value_name = "POLICY")]
    c_fixed_vertex_acceptance_criterion: Option<String>,

    // Initial partitioning.
    #[arg(long = "i-mode", value_name = "POLICY")]
    i_mode: Option<String>,
    #[arg(long = "i-runs", value_name = "INT")]
    i_runs: Option<String>,

    // Local search.
    #[arg(long = "r-type", value_name = "POLICY")]
    r_type: Option<String>,
    #[arg(long = "r-runs-per-level", value_name = "INT")]
    r_runs_per_level: Option<String>,
    #[arg(long = "r-fm-stop", value_name = "POLICY")]
    r_fm_stop: Option<String>,
    #[arg(long = "r-fm-stop-i", value_name = "INT")]
    r_fm_stop_i: Option<String>,
    #[arg(long = "r-fm-stop-alpha", value_name = "FLOAT")]
    r_fm_stop_alpha: Option<String>,
    #[arg(long = "r-flow-algorithm", value_name = "POLICY")]
    r_flow_algorithm: Option<String>,
    #[arg(long = "r-flow-network", value_name = "POLICY")]
    r_flow_network: Option<String>,
    #[arg(long = "r-flow-execution-policy", value_name = "POLICY")]
    r_flow_execution_policy: Option<String>,
    #[arg(long = "r-flow-alpha", value_name = "FLOAT")]
    r_flow_alpha: Option<String>,
    #[arg(long = "r-flow-beta", value_name = "INT")]
    r_flow_beta: Option<String>,
    #[arg(long = "r-flow-use-most-balanced-minimum-cut", value_name = "BOOL")]
    r_flow_use_most_balanced_minimum_cut: Option<String>,
    #[arg(long = "r-flow-use-adaptive-alpha-stopping-rule", value_name = "BOOL")]
    r_flow_use_adaptive_alpha_stopping_rule: Option<String>,
    #[arg(long = "r-flow-ignore-small-hyperedge-cut", value_name = "BOOL")]
    r_flow_ignore_small_hyperedge_cut: Option<String>,

    // Preprocessing.
    #[arg(long = "p-detect-communities", value_name = "BOOL")]
    p_detect_communities: Option<String>,

    // Evolutionary.
    #[arg(long)]
    evolutionary: bool,
    #[arg(long = "time-limit", value_name = "SECONDS")]
    time_limit: Option<String>,
    #[arg(long = "population-size", value_name = "INT")]
    population_size: Option<String>,
    #[arg(long = "dynamic-population-size", value_name = "BOOL")]
    dynamic_population_size: Option<String>,
    #[arg(long = "dynamic-population-fraction", value_name = "FLOAT")]
    dynamic_population_fraction: Option<String>,
    #[arg(long = "gamma", value_name = "FLOAT")]
    gamma: Option<String>,
    #[arg(long = "replace-strategy", value_name = "POLICY")]
    replace_strategy: Option<String>,
    #[arg(long = "combine-strategy", value_name = "POLICY")]
    combine_strategy: Option<String>,
    #[arg(long = "mutate-strategy", value_name = "POLICY")]
    mutate_strategy: Option<String>,
    #[arg(long = "diversify-interval", value_name = "INT", allow_hyphen_values = true)]
    diversify_interval: Option<String>,
    #[arg(long = "mutation-chance", value_name = "FLOAT")]
    mutation_chance: Option<String>,
    #[arg(long = "edge-frequency-chance", value_name = "FLOAT")]
    edge_frequency_chance: Option<String>,
}

fn build_context(cli: &Cli) -> anyhow::Result<Context> {
    let mut context = Context::default();
    if let Some(preset) = &cli.preset {
        context
            .apply_preset(preset)
            .with_context(|| format!("failed to read preset {}", preset.display()))?;
    }

    context.set_option("k", &cli.blocks.to_string())?;
    context.set_option("epsilon", &cli.epsilon.to_string())?;
    context.set_option("objective", &cli.objective)?;
    context.set_option("mode", &cli.mode)?;
    if let Some(seed) = cli.seed {
        context.set_option("seed", &seed.to_string())?;
    }
    if let Some(cmaxnet) = cli.cmaxnet {
        context.set_option("cmaxnet", &cmaxnet.to_string())?;
    }
    if let Some(vcycles) = cli.vcycles {
        context.set_option("vcycles", &vcycles.to_string())?;
    }
    if cli.use_individual_blockweights {
        context.set_option("use-individual-blockweights", "true")?;
        context.partition.individual_block_weights = cli.blockweights.clone();
    }
    if cli.quiet {
        context.set_option("quiet", "true")?;
    }
    if cli.evolutionary {
        context.set_option("evolutionary", "true")?;
    }

    let passthrough: [(&str, &Option<String>); 29] = [
        ("c-type", &cli.c_type),
        ("c-t", &cli.c_t),
        ("c-s", &cli.c_s),
        ("c-rating-score", &cli.c_rating_score),
        ("c-rating-heavy-node-penalty", &cli.c_rating_heavy_node_penalty),
        ("c-rating-acceptance-criterion", &cli.c_rating_acceptance_criterion),
        ("c-rating-use-communities", &cli.c_rating_use_communities),
        (
            "c-fixed-vertex-acceptance-criterion",
            &cli.c_fixed_vertex_acceptance_criterion,
        ),
        ("i-mode", &cli.i_mode),
        ("i-runs", &cli.i_runs),
        ("r-type", &cli.r_type),
        ("r-runs-per-level", &cli.r_runs_per_level),
        ("r-fm-stop", &cli.r_fm_stop),
        ("r-fm-stop-i", &cli.r_fm_stop_i),
        ("r-fm-stop-alpha", &cli.r_fm_stop_alpha),
        ("r-flow-algorithm", &cli.r_flow_algorithm),
        ("r-flow-network", &cli.r_flow_network),
        ("r-flow-execution-policy", &cli.r_flow_execution_policy),
        ("r-flow-alpha", &cli.r_flow_alpha),
        ("r-flow-beta", &cli.r_flow_beta),
        (
            "r-flow-use-most-balanced-minimum-cut",
            &cli.r_flow_use_most_balanced_minimum_cut,
        ),
        (
            "r-flow-use-adaptive-alpha-stopping-rule",
            &cli.r_flow_use_adaptive_alpha_stopping_rule,
        ),
        (
            "r-flow-ignore-small-hyperedge-cut",
            &cli.r_flow_ignore_small_hyperedge_cut,
        ),
        ("p-detect-communities", &cli.p_detect_communities),
        ("time-limit", &cli.time_limit),
        ("population-size", &cli.population_size),
        ("dynamic-population-size", &cli.dynamic_population_size),
        ("dynamic-population-fraction", &cli.dynamic_population_fraction),
        ("gamma", &cli.gamma),
    ];
    for (key, value) in passthrough {
        if let Some(value) = value {
            context.set_option(key, value)?;
        }
    }
    for (key, value) in [
        ("replace-strategy", &cli.replace_strategy),
        ("combine-strategy", &cli.combine_strategy),
        ("mutate-strategy", &cli.mutate_strategy),
        ("diversify-interval", &cli.diversify_interval),
        ("mutation-chance", &cli.mutation_chance),
        ("edge-frequency-chance", &cli.edge_frequency_chance),
    ] {
        if let Some(value) = value {
            context.set_option(key, value)?;
        }
    }

    context.validate()?;
    Ok(context)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut context = build_context(&cli)?;

    let mut hg = read_hypergraph(
        &cli.hypergraph,
        context.partition.k,
        context.partition.hyperedge_size_threshold,
    )
    .with_context(|| format!("failed to read {}", cli.hypergraph.display()))?;
    if let Some(fixed) = &cli.fixed_vertices {
        apply_fixed_vertices(&mut hg, fixed, context.partition.k)
            .with_context(|| format!("failed to read {}", fixed.display()))?;
    }
    context.setup_part_weights(hg.total_weight());

    let mut random = Random::with_seed(context.partition.seed);
    let mut timer = Timer::new();
    let start = Instant::now();
    if context.evolutionary.enabled {
        evo_partition(&mut hg, &mut context, &mut random, &mut timer)?;
    } else {
        partition(&mut hg, &context, &mut random)?;
    }
    let elapsed = start.elapsed().as_secs_f64();

    let output = partition_file_name(
        &cli.hypergraph,
        context.partition.k,
        context.partition.epsilon,
        context.partition.seed,
    );
    write_partition(&output, &hg.partition())?;
    info!("partition written to {}", output.display());

    if !context.partition.quiet {
        println!("cut        = {}", cut(&hg));
        println!("km1        = {}", km1(&hg));
        println!("imbalance  = {:.5}", imbalance(&hg, &context));
        println!("time       = {elapsed:.3}s");
        println!("output     = {}", output.display());
    }
    Ok(())
}
