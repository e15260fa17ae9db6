// pipeline.rs
//
// Run-level orchestration: loader -> strategy -> node files -> extraction, and
// per (node, fold) CV units processed on the rayon pool.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;

use crate::align::{align_fold, NodeSources};
use crate::config::{CriterionConfig, SplitConfig};
use crate::error::{Result, SplitError};
use crate::extract::GenotypeExtractor;
use crate::folds::split_node_file;
use crate::layout::{ensure_parent, Layout, NodeId};
use crate::loader::{
    load_category_records, load_region_table, load_superpopulation_records, read_sample_qc_ids,
    retain_qc_passed, SampleRecord, TabularLoader,
};
use crate::partition::{strategy_for, Node};
use crate::standardize::{standardize_fold, ScalingParameters};
use crate::table::{write_ids, Table};

fn progress_bar(len: usize, unit: &str) -> ProgressBar {
    let template = format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
        unit
    );
    let bar = ProgressBar::new(len as u64);
    match ProgressStyle::default_bar().template(&template) {
        Ok(style) => bar.with_style(style.progress_chars("=> ")),
        Err(e) => {
            warn!("Failed to create progress bar style: {}", e);
            bar
        }
    }
}

/// Canonical sample table for the configured criterion, restricted to QC-passed samples.
pub fn load_samples(config: &SplitConfig, loader: Option<&dyn TabularLoader>) -> Result<Vec<SampleRecord>> {
    let records = match (&config.criterion, config.criterion.loader_field()) {
        (CriterionConfig::Superpopulation { table, .. }, _) => load_superpopulation_records(table)?,
        (_, Some(field)) => {
            let loader = loader.ok_or_else(|| {
                SplitError::Configuration(format!("criterion needs loader field {} but no loader is configured", field))
            })?;
            load_category_records(loader, field)?
        }
        (_, None) => {
            return Err(SplitError::Configuration("criterion has no sample source".into()));
        }
    };
    match &config.inputs.sample_qc_ids {
        Some(path) => Ok(retain_qc_passed(records, &read_sample_qc_ids(path)?)),
        None => Ok(records),
    }
}

/// Runs the configured strategy and writes `split_ids/{node}.csv` for every node.
/// Nothing is written unless the whole partition is valid.
pub fn partition_cohort(config: &SplitConfig, samples: &[SampleRecord]) -> Result<Vec<Node>> {
    let regions = match &config.criterion {
        CriterionConfig::Region { region_table, region_column, .. } => {
            Some(load_region_table(region_table, region_column)?)
        }
        _ => None,
    };
    let strategy = strategy_for(&config.criterion, regions)?;
    info!("Partitioning {} samples with the {} strategy.", samples.len(), strategy.name());
    let nodes = strategy.partition(samples)?;
    if strategy.overlapping() {
        info!("Subsample nodes intentionally overlap their reference population.");
    }

    let layout = config.layout();
    remove_stale_node_files(&layout, &nodes)?;
    for node in &nodes {
        write_ids(&layout.node_ids_path(&node.id), &node.samples)?;
    }
    info!("Wrote {} node identifier files to {}", nodes.len(), layout.split_ids_dir().display());
    Ok(nodes)
}

/// Deletes node id files left in `split_ids/` by an earlier partition with more nodes.
fn remove_stale_node_files(layout: &Layout, nodes: &[Node]) -> Result<()> {
    let current: HashSet<NodeId> = nodes.iter().map(|node| node.id.clone()).collect();
    for stale in discover_nodes(layout)?.into_iter().filter(|id| !current.contains(id)) {
        for ext in ["csv", "tsv"] {
            let path = layout.split_ids_dir().join(format!("{}.{}", stale, ext));
            if path.is_file() {
                warn!("Removing node file {} from a previous partition.", path.display());
                fs::remove_file(&path).map_err(|e| SplitError::io(&path, e))?;
            }
        }
    }
    Ok(())
}

/// Outcome of per-node extraction. Failures do not affect other nodes.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub succeeded: Vec<NodeId>,
    pub failed: Vec<(NodeId, SplitError)>,
}

/// Extracts genotypes for every node concurrently, one call per node.
pub fn extract_genotypes(extractor: &dyn GenotypeExtractor, layout: &Layout, nodes: &[NodeId]) -> ExtractionReport {
    let bar = progress_bar(nodes.len(), "nodes");
    let results: Vec<(NodeId, Result<()>)> = nodes
        .par_iter()
        .map(|node| {
            let prefix = layout.genotype_prefix(node);
            let result = ensure_parent(&prefix)
                .and_then(|_| extractor.extract(node, &layout.node_ids_path(node), &prefix));
            bar.inc(1);
            (node.clone(), result)
        })
        .collect();
    bar.finish_with_message("Extraction complete.");

    let mut report = ExtractionReport::default();
    for (node, result) in results {
        match result {
            Ok(()) => report.succeeded.push(node),
            Err(e) => {
                error!("Genotype extraction failed for node {}: {}", node, e);
                report.failed.push((node, e));
            }
        }
    }
    report
}

#[derive(Debug)]
pub struct PartitionOutcome {
    pub nodes: Vec<Node>,
    pub extraction: Option<ExtractionReport>,
}

pub fn run_partition(
    config: &SplitConfig,
    loader: Option<&dyn TabularLoader>,
    extractor: Option<&dyn GenotypeExtractor>,
) -> Result<PartitionOutcome> {
    let samples = load_samples(config, loader)?;
    let nodes = partition_cohort(config, &samples)?;
    let extraction = extractor.map(|extractor| {
        let ids: Vec<NodeId> = nodes.iter().map(|node| node.id.clone()).collect();
        extract_genotypes(extractor, &config.layout(), &ids)
    });
    Ok(PartitionOutcome { nodes, extraction })
}

/// Node ids found in `split_ids/`, in natural order.
pub fn discover_nodes(layout: &Layout) -> Result<Vec<NodeId>> {
    let dir = layout.split_ids_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(&dir)
        .map_err(|e| SplitError::io(&dir, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv" || ext == "tsv"))
        .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .collect();
    names.sort_by(|a, b| natord::compare(a, b));
    names.dedup();
    Ok(names
        .into_iter()
        .map(|name| match name.parse::<usize>() {
            Ok(index) => NodeId::from_index(index),
            Err(_) => NodeId::named(name),
        })
        .collect())
}

/// IID to stratification label, from a column of the node's phenotype table.
fn stratification_labels(table: &Table, column: &str, path: &Path) -> Result<HashMap<String, String>> {
    let index = table
        .column_index(column)
        .ok_or_else(|| SplitError::parse(path, format!("stratification column '{}' not found", column)))?;
    let values = table.values()?;
    Ok(table
        .keys()?
        .into_iter()
        .zip(values.column(index))
        .filter(|(_, value)| !value.is_nan())
        .map(|(key, value)| (key.iid, value.to_string()))
        .collect())
}

#[derive(Debug, Default)]
pub struct CvReport {
    pub completed: Vec<(NodeId, usize, ScalingParameters)>,
    pub failed: Vec<(NodeId, usize, SplitError)>,
}

/// Splits each node into folds, then aligns and standardizes every (node, fold) in parallel.
/// Configuration errors abort before any fold of the offending node is written; failures of
/// individual units are collected in the report.
pub fn run_cv(config: &SplitConfig, nodes: &[NodeId]) -> Result<CvReport> {
    let layout = config.layout();
    let k = config.fold_count;

    let mut units = Vec::with_capacity(nodes.len() * k);
    for node in nodes {
        let sources = NodeSources::load(&layout, node)?;
        let labels = match &config.cv.stratify_column {
            Some(column) => Some(stratification_labels(
                &sources.covariates_phenotype,
                column,
                &layout.source_phenotype_path(node),
            )?),
            None => None,
        };
        split_node_file(
            &layout,
            node,
            &layout.source_ids_path(node),
            labels.as_ref(),
            config.cv.stratify_column.as_deref().unwrap_or_default(),
            k,
            config.random_seed,
        )?;
        let sources = Arc::new(sources);
        units.extend((0..k).map(|fold| (node.clone(), fold, Arc::clone(&sources))));
    }

    let standardize_columns = config.cv.standardize_columns.as_deref();
    let bar = progress_bar(units.len(), "folds");
    let results: Vec<(NodeId, usize, Result<ScalingParameters>)> = units
        .par_iter()
        .map(|(node, fold, sources)| {
            let result = align_fold(&layout, node, *fold, sources, config.cv.n_pcs)
                .and_then(|_| standardize_fold(&layout, node, *fold, standardize_columns));
            bar.inc(1);
            (node.clone(), *fold, result)
        })
        .collect();
    bar.finish_with_message("Folds prepared.");

    let mut report = CvReport::default();
    for (node, fold, result) in results {
        match result {
            Ok(params) => report.completed.push((node, fold, params)),
            Err(e) => {
                error!("Node {} fold {} failed: {}", node, fold, e);
                report.failed.push((node, fold, e));
            }
        }
    }
    info!(
        "CV preparation finished: {} fold units completed, {} failed.",
        report.completed.len(),
        report.failed.len()
    );
    Ok(report)
}
