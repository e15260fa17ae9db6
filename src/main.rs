// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, bail, Context, Error, Result};
use clap::Parser;
use log::{error, info, warn};
use std::time::Instant;

use cohort_split::config::SplitConfig;
use cohort_split::extract::{GenotypeExtractor, Plink2Extractor};
use cohort_split::layout::{Layout, NodeId};
use cohort_split::loader::{FileTabularLoader, TabularLoader};
use cohort_split::pipeline::{discover_nodes, run_cv, run_partition};
use cohort_split::repartition::{repartition, SliceSpec};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting cohort_split with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    match &cli_args.command {
        cli::Command::Partition { config, no_extract } => {
            let config = SplitConfig::load(config)
                .with_context(|| format!("Failed to load configuration {}", config.display()))?;
            partition(&config, *no_extract)?;
        }
        cli::Command::Cv { config, nodes } => {
            let config = SplitConfig::load(config)
                .with_context(|| format!("Failed to load configuration {}", config.display()))?;
            cross_validation(&config, nodes.as_deref())?;
        }
        cli::Command::Repartition {
            config,
            source_split,
            node,
            target_split,
            count,
            proportions,
        } => {
            let config = SplitConfig::load(config)
                .with_context(|| format!("Failed to load configuration {}", config.display()))?;
            let spec = match (count, proportions) {
                (Some(n), None) => SliceSpec::Count(*n),
                (None, Some(shares)) => SliceSpec::Proportions(shares.clone()),
                _ => bail!("Exactly one of --count or --proportions is required."),
            };
            let source = Layout::new(&config.output_root, source_split, &config.cv.phenotype);
            let target = Layout::new(&config.output_root, target_split, &config.cv.phenotype);
            let sub_nodes = repartition(&source, &node_id(node), &target, &spec, config.fold_count)?;
            info!(
                "Node {} of {} re-partitioned into {} sub-nodes under {}.",
                node,
                source_split,
                sub_nodes.len(),
                target.split_root().display()
            );
        }
    }

    info!(
        "Total execution time: {:.2?}",
        total_time_start.elapsed()
    );
    Ok(())
}

fn node_id(name: &str) -> NodeId {
    match name.parse::<usize>() {
        Ok(index) => NodeId::from_index(index),
        Err(_) => NodeId::named(name),
    }
}

fn partition(config: &SplitConfig, no_extract: bool) -> Result<()> {
    let loader = config.inputs.loader_root.as_ref().map(FileTabularLoader::new);
    let extractor = (config.extraction.enabled && !no_extract)
        .then(|| Plink2Extractor::from_config(&config.extraction));
    if extractor.is_none() {
        info!("Genotype extraction disabled for this run.");
    }

    let outcome = run_partition(
        config,
        loader.as_ref().map(|l| l as &dyn TabularLoader),
        extractor.as_ref().map(|e| e as &dyn GenotypeExtractor),
    )?;
    for node in &outcome.nodes {
        info!("Node {}: {} samples", node.id, node.samples.len());
    }

    if let Some(report) = outcome.extraction {
        if !report.failed.is_empty() {
            for (node, e) in &report.failed {
                error!("Node {} has no genotypes: {}", node, e);
            }
            return Err(anyhow!(
                "Genotype extraction failed for {} of {} nodes.",
                report.failed.len(),
                report.failed.len() + report.succeeded.len()
            ));
        }
        info!("Genotypes extracted for all {} nodes.", report.succeeded.len());
    }
    Ok(())
}

fn cross_validation(config: &SplitConfig, requested: Option<&[String]>) -> Result<()> {
    let layout = config.layout();
    let nodes: Vec<NodeId> = match requested {
        Some(names) => names.iter().map(|name| node_id(name)).collect(),
        None => discover_nodes(&layout)?,
    };
    if nodes.is_empty() {
        bail!("No nodes found under {}", layout.split_ids_dir().display());
    }
    info!("Preparing {} folds for {} nodes.", config.fold_count, nodes.len());

    let report = run_cv(config, &nodes)?;
    if report.failed.is_empty() {
        return Ok(());
    }
    for (node, fold, e) in &report.failed {
        if e.is_fatal_for_run() {
            error!("Node {} fold {}: {}", node, fold, e);
        } else {
            warn!("Node {} fold {} skipped: {}", node, fold, e);
        }
    }
    Err(anyhow!(
        "{} of {} fold units failed.",
        report.failed.len(),
        report.failed.len() + report.completed.len()
    ))
}

mod cli {
    use std::path::PathBuf;
    use clap::{Parser, Subcommand};

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Cohort partitioning and cross-validation preparation.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Partition the cohort into nodes and extract per-node genotypes.
        Partition {
            #[arg(short, long)]
            config: PathBuf,

            #[arg(long)]
            no_extract: bool,
        },
        /// Split nodes into folds, align tables and standardize covariates.
        Cv {
            #[arg(short, long)]
            config: PathBuf,

            /// Nodes to process; defaults to every node in split_ids/.
            #[arg(long, num_args = 1..)]
            nodes: Option<Vec<String>>,
        },
        /// Slice one node's train/val folds into sub-nodes sharing its test folds.
        Repartition {
            #[arg(short, long)]
            config: PathBuf,

            #[arg(long)]
            source_split: String,

            #[arg(long)]
            node: String,

            #[arg(long)]
            target_split: String,

            #[arg(long, conflicts_with = "proportions")]
            count: Option<usize>,

            #[arg(long, num_args = 1.., value_delimiter = ',')]
            proportions: Option<Vec<f64>>,
        },
    }
}
