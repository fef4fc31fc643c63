use std::{io, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use log::{LevelFilter, error, info};
use tokio::runtime::Builder;

use abxgen_core::{
    configuration::Configuration,
    core::{
        database::ItemDatabase,
        error::Result,
        sideop::expressions::{parse_filter, parse_regressor},
        task::{GenerateOutcome, GenerateRequest, Task, generate},
    },
};

#[derive(Parser, Debug)]
#[command(name = "abxgen", version, about = "ABX triplet and pair generator")]
struct Args {
    /// Item database (.item file)
    #[arg(value_name = "DATABASE")]
    database: PathBuf,

    /// Output directory (default: the database path with an .abx extension)
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Attribute shared by A and X, differing for B
    #[arg(long)]
    on: String,

    /// Attributes shared by A and B, differing for X
    #[arg(long, num_args = 1..)]
    across: Vec<String>,

    /// Attributes shared by A, B and X
    #[arg(long, num_args = 1..)]
    by: Vec<String>,

    /// Filters such as `talker_A == talker_B` or `phone != "sil"`
    #[arg(long = "filter", num_args = 1..)]
    filters: Vec<String>,

    /// Regressors such as `talker_A` or `context`
    #[arg(long = "reg", num_args = 1..)]
    regressors: Vec<String>,

    /// Proportion (below 1) or number of triplets to sample
    #[arg(long)]
    sample: Option<f64>,

    /// Triplets kept per regressor signature in each block
    #[arg(long)]
    threshold: Option<usize>,

    /// Memory for external sorts in megabytes (default: 1000)
    #[arg(long = "memory-mb", alias = "memory_mb", value_name = "MB")]
    memory_mb: Option<u64>,

    /// Print statistics and exit
    #[arg(long = "stats-only", alias = "stats_only")]
    stats_only: bool,

    /// Also write the detailed statistics to this file
    #[arg(long = "stats-file", alias = "stats_file", value_name = "PATH")]
    stats_file: Option<PathBuf>,

    /// Estimate filtered triplet counts instead of counting them
    #[arg(long)]
    approximate: bool,

    /// Number of by groups processed in parallel (default: available cores)
    #[arg(long = "concurrent-threads", alias = "concurrent_threads", value_name = "N")]
    concurrent_threads: Option<usize>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for temporary files (default: inside the output)
    #[arg(long = "temp-location", alias = "temp_location", value_name = "PATH")]
    temp_location: Option<PathBuf>,

    /// Logging level off, error, warn, info, debug, trace (default: info)
    #[arg(long = "log-level", alias = "log_level", value_name = "LEVEL")]
    log_level: Option<LevelFilter>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level.unwrap_or(LevelFilter::Info))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Configuration {
        concurrent_threads: args.concurrent_threads,
        memory_budget: args.memory_mb.map(|mb| mb * 1_000_000),
        read_chunk_rows: None,
        seed: args.seed,
        temp_location: args.temp_location.clone(),
    };

    let db = ItemDatabase::load(&args.database)?;

    let filters = args
        .filters
        .iter()
        .map(|f| parse_filter(f, &db.attributes, &args.by))
        .collect::<Result<Vec<_>>>()?;
    let regressors = args
        .regressors
        .iter()
        .map(|r| parse_regressor(r, &db.attributes))
        .collect::<Result<Vec<_>>>()?;

    let task = Task::build_with(db, &args.on, &args.across, &args.by, filters, regressors, args.approximate)?;

    if let Some(path) = &args.stats_file {
        task.stats().write_stats_file(path, false)?;
    }

    if args.stats_only {
        task.stats().print_stats(&mut io::stdout().lock(), true)?;
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.database.with_extension("abx"));

    let request = GenerateRequest {
        output,
        sample: args.sample,
        threshold: args.threshold,
        config: config.clone(),
    };

    let rt = Builder::new_multi_thread()
        .worker_threads(config.concurrent_threads())
        .enable_all()
        .build()?;

    match rt.block_on(generate(Arc::new(task), request))? {
        GenerateOutcome::Empty => info!("No triplets generated"),
        GenerateOutcome::Written(summary) => info!(
            "Generated {} triplets and {} unique pairs in {}",
            summary.nb_triplets,
            summary.nb_unique_pairs,
            summary.output.display()
        ),
    }

    Ok(())
}
