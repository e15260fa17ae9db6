// partition.rs
//
// Partition strategies: canonical sample records in, numbered nodes out.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{AssessmentCentre, CriterionConfig};
use crate::error::{Result, SplitError};
use crate::layout::NodeId;
use crate::loader::SampleRecord;
use crate::table::SampleKey;

/// A named subset of the cohort. Samples keep the canonical input order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub samples: Vec<SampleKey>,
}

pub trait PartitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maps samples to nodes. Every returned node is non-empty.
    fn partition(&self, samples: &[SampleRecord]) -> Result<Vec<Node>>;

    /// Whether nodes may share samples.
    fn overlapping(&self) -> bool {
        false
    }
}

fn into_nodes(strategy: &str, buckets: Vec<Vec<SampleKey>>) -> Result<Vec<Node>> {
    buckets
        .into_iter()
        .enumerate()
        .map(|(index, samples)| {
            let id = NodeId::from_index(index);
            if samples.is_empty() {
                return Err(SplitError::EmptyNode {
                    node: id,
                    context: format!("{} strategy assigned no samples", strategy),
                });
            }
            Ok(Node { id, samples })
        })
        .collect()
}

fn log_sizes(strategy: &str, nodes: &[Node]) {
    for node in nodes {
        info!("{} split: node {} has {} samples.", strategy, node.id, node.samples.len());
    }
}

/// Buckets for the IID variant: the largest population re-split uniformly at random.
#[derive(Clone, Copy, Debug)]
pub struct IidResplit {
    pub buckets: usize,
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct EthnicityStrategy {
    split_map: HashMap<i64, usize>,
    exclude: HashSet<i64>,
    n_nodes: usize,
    iid: Option<IidResplit>,
}

impl EthnicityStrategy {
    pub fn new(split_map: &[(i64, usize)], exclude: &[i64], iid: Option<IidResplit>) -> Result<Self> {
        let n_nodes = split_map
            .iter()
            .map(|&(_, node)| node + 1)
            .max()
            .ok_or_else(|| SplitError::Configuration("ethnicity split map is empty".into()))?;
        if iid.is_some_and(|resplit| resplit.buckets == 0) {
            return Err(SplitError::Configuration("IID re-split needs at least one bucket".into()));
        }
        Ok(Self {
            split_map: split_map.iter().copied().collect(),
            exclude: exclude.iter().copied().collect(),
            n_nodes,
            iid,
        })
    }

    fn mapped_populations(&self, samples: &[SampleRecord]) -> Vec<Vec<SampleKey>> {
        let mut populations = vec![Vec::new(); self.n_nodes];
        let (mut excluded, mut unmapped) = (0usize, 0usize);
        for record in samples {
            let Some(code) = record.label.code() else {
                unmapped += 1;
                continue;
            };
            if self.exclude.contains(&code) {
                excluded += 1;
                continue;
            }
            match self.split_map.get(&code) {
                Some(&node) => populations[node].push(record.key.clone()),
                None => unmapped += 1,
            }
        }
        debug!(
            "Ethnicity mapping: {} excluded codes, {} codes without a node.",
            excluded, unmapped
        );
        populations
    }
}

impl PartitionStrategy for EthnicityStrategy {
    fn name(&self) -> &'static str {
        if self.iid.is_some() {
            "ethnicity (iid)"
        } else {
            "ethnicity"
        }
    }

    fn partition(&self, samples: &[SampleRecord]) -> Result<Vec<Node>> {
        let populations = self.mapped_populations(samples);
        let nodes = match self.iid {
            None => into_nodes(self.name(), populations)?,
            Some(IidResplit { buckets, seed }) => {
                // Ties go to the lowest node index.
                let largest = populations
                    .iter()
                    .enumerate()
                    .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
                    .map(|(index, _)| index)
                    .unwrap_or(0);
                info!(
                    "IID split: re-splitting population {} ({} samples) into {} buckets with seed {}.",
                    largest,
                    populations[largest].len(),
                    buckets,
                    seed
                );
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut bucketed = vec![Vec::new(); buckets];
                for key in &populations[largest] {
                    bucketed[rng.random_range(0..buckets)].push(key.clone());
                }
                into_nodes(self.name(), bucketed)?
            }
        };
        log_sizes(self.name(), &nodes);
        Ok(nodes)
    }
}

/// One node per region code among samples of the admitted ethnic backgrounds.
#[derive(Clone, Debug)]
pub struct RegionStrategy {
    admitted: HashSet<i64>,
    exclude: HashSet<i64>,
    regions: HashMap<String, String>,
}

impl RegionStrategy {
    pub fn new(admitted: &[i64], exclude: &[i64], regions: HashMap<String, String>) -> Self {
        Self {
            admitted: admitted.iter().copied().collect(),
            exclude: exclude.iter().copied().collect(),
            regions,
        }
    }
}

impl PartitionStrategy for RegionStrategy {
    fn name(&self) -> &'static str {
        "region"
    }

    fn partition(&self, samples: &[SampleRecord]) -> Result<Vec<Node>> {
        let located: Vec<(&SampleKey, &String)> = samples
            .iter()
            .filter(|record| {
                record
                    .label
                    .code()
                    .is_some_and(|code| !self.exclude.contains(&code) && self.admitted.contains(&code))
            })
            .filter_map(|record| self.regions.get(&record.key.iid).map(|region| (&record.key, region)))
            .collect();

        let codes: BTreeSet<&String> = located.iter().map(|(_, region)| *region).collect();
        if codes.is_empty() {
            return Err(SplitError::Configuration(
                "no admitted sample has a region code".into(),
            ));
        }
        let node_of: HashMap<&String, usize> = codes.iter().enumerate().map(|(i, code)| (*code, i)).collect();
        for (code, index) in &node_of {
            debug!("Region {} -> node {}", code, index);
        }

        let mut buckets = vec![Vec::new(); codes.len()];
        for (key, region) in located {
            buckets[node_of[region]].push(key.clone());
        }
        let nodes = into_nodes(self.name(), buckets)?;
        log_sizes(self.name(), &nodes);
        Ok(nodes)
    }
}

/// One node per superpopulation label, plus subsample nodes drawn from the reference
/// population. Subsample nodes overlap their source node and each other.
#[derive(Clone, Debug)]
pub struct SuperpopulationStrategy {
    n_subsample_nodes: usize,
    n_subsample_samples: usize,
    reference_node: usize,
}

impl SuperpopulationStrategy {
    pub fn new(n_subsample_nodes: usize, n_subsample_samples: usize, reference_node: usize) -> Self {
        Self {
            n_subsample_nodes,
            n_subsample_samples,
            reference_node,
        }
    }
}

impl PartitionStrategy for SuperpopulationStrategy {
    fn name(&self) -> &'static str {
        "superpopulation"
    }

    fn overlapping(&self) -> bool {
        self.n_subsample_nodes > 0
    }

    fn partition(&self, samples: &[SampleRecord]) -> Result<Vec<Node>> {
        let mut populations: Vec<Vec<SampleKey>> = Vec::new();
        for record in samples {
            let index = match record.label.code() {
                Some(code) if code >= 0 => code as usize,
                _ => {
                    return Err(SplitError::Configuration(format!(
                        "sample {} has superpopulation label '{}', expected a non-negative node index",
                        record.key.iid, record.label
                    )))
                }
            };
            if index >= populations.len() {
                populations.resize(index + 1, Vec::new());
            }
            populations[index].push(record.key.clone());
        }

        let reference = populations.get(self.reference_node).cloned().unwrap_or_default();
        if self.n_subsample_nodes > 0 && reference.len() < self.n_subsample_samples {
            return Err(SplitError::Configuration(format!(
                "reference population {} has {} samples, cannot draw {} per subsample node",
                self.reference_node,
                reference.len(),
                self.n_subsample_samples
            )));
        }

        let n_populations = populations.len();
        for offset in 0..self.n_subsample_nodes {
            // Seeded by the node index so each subsample node is reproducible on its own.
            let node_index = n_populations + offset;
            let mut rng = ChaCha8Rng::seed_from_u64(node_index as u64);
            let mut picked = rand::seq::index::sample(&mut rng, reference.len(), self.n_subsample_samples).into_vec();
            picked.sort_unstable();
            populations.push(picked.into_iter().map(|i| reference[i].clone()).collect());
        }

        let nodes = into_nodes(self.name(), populations)?;
        log_sizes(self.name(), &nodes);
        Ok(nodes)
    }
}

/// One node per assessment centre, in the order of the centre table.
#[derive(Clone, Debug)]
pub struct AssessmentCentreStrategy {
    centres: Vec<AssessmentCentre>,
}

impl AssessmentCentreStrategy {
    pub fn new(centres: Vec<AssessmentCentre>) -> Self {
        Self { centres }
    }
}

impl PartitionStrategy for AssessmentCentreStrategy {
    fn name(&self) -> &'static str {
        "assessment centre"
    }

    fn partition(&self, samples: &[SampleRecord]) -> Result<Vec<Node>> {
        let node_of: HashMap<i64, usize> = self
            .centres
            .iter()
            .enumerate()
            .map(|(index, centre)| (centre.code, index))
            .collect();
        let mut buckets = vec![Vec::new(); self.centres.len()];
        for record in samples {
            if let Some(&index) = record.label.code().and_then(|code| node_of.get(&code)) {
                buckets[index].push(record.key.clone());
            }
        }
        for (index, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                return Err(SplitError::EmptyNode {
                    node: NodeId::from_index(index),
                    context: format!(
                        "assessment centre {} ({}) has no samples",
                        self.centres[index].code, self.centres[index].name
                    ),
                });
            }
        }
        let nodes = into_nodes(self.name(), buckets)?;
        log_sizes(self.name(), &nodes);
        Ok(nodes)
    }
}

/// Builds the strategy selected by `criterion`. Region codes are supplied by the caller
/// because they come from an external table.
pub fn strategy_for(
    criterion: &CriterionConfig,
    regions: Option<HashMap<String, String>>,
) -> Result<Box<dyn PartitionStrategy>> {
    Ok(match criterion {
        CriterionConfig::Ethnicity { split_map, exclude_codes, iid_buckets, iid_seed } => {
            let iid = iid_buckets.map(|buckets| IidResplit { buckets, seed: *iid_seed });
            Box::new(EthnicityStrategy::new(split_map, exclude_codes, iid)?)
        }
        CriterionConfig::Region { codes, exclude_codes, .. } => {
            let regions = regions.ok_or_else(|| {
                SplitError::Configuration("region strategy requires a region table".into())
            })?;
            Box::new(RegionStrategy::new(codes, exclude_codes, regions))
        }
        CriterionConfig::Superpopulation { n_subsample_nodes, n_subsample_samples, reference_node, .. } => {
            Box::new(SuperpopulationStrategy::new(*n_subsample_nodes, *n_subsample_samples, *reference_node))
        }
        CriterionConfig::AssessmentCentre { centres } => Box::new(AssessmentCentreStrategy::new(centres.clone())),
    })
}
