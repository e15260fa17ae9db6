// config.rs
//
// Static description of a run, read once from TOML and shared by reference.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SplitError};
use crate::layout::Layout;

pub const DEFAULT_RANDOM_SEED: u64 = 34;
pub const DEFAULT_FOLD_COUNT: usize = 5;
pub const DEFAULT_IID_SEED: u64 = 32;

/// Missing, "prefer not to answer" and "do not know" ethnic background codes.
pub fn default_exclude_codes() -> Vec<i64> {
    vec![-1, -3, 0]
}

/// Ethnic background (UKB field 21000) code to node index.
pub fn default_ethnicity_map() -> Vec<(i64, usize)> {
    vec![
        // White British
        (1001, 0),
        // Other white backgrounds
        (1, 1),
        (1002, 1),
        (1003, 1),
        // South Asian
        (3, 2),
        (3001, 2),
        (3002, 2),
        (3003, 2),
        // Black
        (4, 3),
        (4001, 3),
        (4002, 3),
        (4003, 3),
        // East Asian
        (5, 4),
    ]
}

/// Assessment centre (UKB field 54) codes, in node order.
pub fn default_assessment_centres() -> Vec<AssessmentCentre> {
    [
        (11012, "Barts"),
        (11021, "Birmingham"),
        (11011, "Bristol"),
        (11008, "Bury"),
        (11003, "Cardiff"),
        (11024, "Cheadle (revisit)"),
        (11020, "Croydon"),
        (11005, "Edinburgh"),
        (11004, "Glasgow"),
        (11018, "Hounslow"),
        (11010, "Leeds"),
        (11016, "Liverpool"),
        (11001, "Manchester"),
        (11017, "Middlesborough"),
        (11009, "Newcastle"),
        (11013, "Nottingham"),
        (11002, "Oxford"),
        (11007, "Reading"),
        (11014, "Sheffield"),
        (10003, "Stockport (pilot)"),
        (11006, "Stoke"),
        (11022, "Swansea"),
        (11023, "Wrexham"),
    ]
    .into_iter()
    .map(|(code, name)| AssessmentCentre {
        code,
        name: name.to_string(),
    })
    .collect()
}

fn default_random_seed() -> u64 {
    DEFAULT_RANDOM_SEED
}

fn default_fold_count() -> usize {
    DEFAULT_FOLD_COUNT
}

fn default_iid_seed() -> u64 {
    DEFAULT_IID_SEED
}

fn default_n_pcs() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_plink_binary() -> String {
    "plink2".to_string()
}

fn default_source_flag() -> String {
    "--pfile".to_string()
}

fn default_phenotype() -> String {
    "phenotype".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AssessmentCentre {
    pub code: i64,
    pub name: String,
}

/// Partitioning criterion. Exactly one is active per run.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionConfig {
    Ethnicity {
        #[serde(default = "default_ethnicity_map")]
        split_map: Vec<(i64, usize)>,
        #[serde(default = "default_exclude_codes")]
        exclude_codes: Vec<i64>,
        /// Re-split the largest population into this many uniformly random buckets.
        #[serde(default)]
        iid_buckets: Option<usize>,
        #[serde(default = "default_iid_seed")]
        iid_seed: u64,
    },
    Region {
        /// Ethnic background codes admitted to the region split.
        codes: Vec<i64>,
        #[serde(default = "default_exclude_codes")]
        exclude_codes: Vec<i64>,
        /// Table with `IID` and a region code column.
        region_table: PathBuf,
        #[serde(default = "default_region_column")]
        region_column: String,
    },
    Superpopulation {
        /// Table with `IID` and integer `node_index` columns.
        table: PathBuf,
        #[serde(default)]
        n_subsample_nodes: usize,
        #[serde(default)]
        n_subsample_samples: usize,
        #[serde(default)]
        reference_node: usize,
    },
    AssessmentCentre {
        #[serde(default = "default_assessment_centres")]
        centres: Vec<AssessmentCentre>,
    },
}

fn default_region_column() -> String {
    "nuts118cd".to_string()
}

impl CriterionConfig {
    pub fn default_split_name(&self) -> &'static str {
        match self {
            CriterionConfig::Ethnicity { iid_buckets: Some(_), .. } => "iid_split",
            CriterionConfig::Ethnicity { .. } => "ethnic_split",
            CriterionConfig::Region { .. } => "region_split",
            CriterionConfig::Superpopulation { .. } => "tg_split",
            CriterionConfig::AssessmentCentre { .. } => "assessment_centre_split",
        }
    }

    /// UKB field code the loader must supply for this criterion, if any.
    pub fn loader_field(&self) -> Option<&'static str> {
        match self {
            CriterionConfig::Ethnicity { .. } | CriterionConfig::Region { .. } => Some("21000"),
            CriterionConfig::AssessmentCentre { .. } => Some("54"),
            CriterionConfig::Superpopulation { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InputsConfig {
    /// Sample QC output (`.id` table); samples absent from it are dropped.
    #[serde(default)]
    pub sample_qc_ids: Option<PathBuf>,
    /// Root of the tabular loader: `{loader_root}/{field}/{train,val,test}.tsv`.
    #[serde(default)]
    pub loader_root: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_plink_binary")]
    pub binary: String,
    #[serde(default = "default_source_flag")]
    pub source_flag: String,
    #[serde(default)]
    pub source: PathBuf,
    #[serde(default)]
    pub retries: u8,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_plink_binary(),
            source_flag: default_source_flag(),
            source: PathBuf::new(),
            retries: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CvConfig {
    #[serde(default = "default_phenotype")]
    pub phenotype: String,
    #[serde(default = "default_n_pcs")]
    pub n_pcs: usize,
    /// Columns of the PCA+covariate table to z-standardize; all non-key columns when absent.
    #[serde(default)]
    pub standardize_columns: Option<Vec<String>>,
    /// Column of the phenotype table used to stratify folds.
    #[serde(default)]
    pub stratify_column: Option<String>,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            phenotype: default_phenotype(),
            n_pcs: default_n_pcs(),
            standardize_columns: None,
            stratify_column: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SplitConfig {
    pub output_root: PathBuf,
    #[serde(default)]
    pub split_name: Option<String>,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    #[serde(default = "default_fold_count")]
    pub fold_count: usize,
    pub criterion: CriterionConfig,
    #[serde(default)]
    pub inputs: InputsConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub cv: CvConfig,
}

impl SplitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SplitConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SplitError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn split_name(&self) -> &str {
        self.split_name
            .as_deref()
            .unwrap_or_else(|| self.criterion.default_split_name())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.output_root, self.split_name(), &self.cv.phenotype)
    }

    /// At most one retry around the extraction tool.
    pub fn extraction_retries(&self) -> u8 {
        self.extraction.retries.min(1)
    }

    fn validate(&self) -> Result<()> {
        if self.fold_count < 3 {
            return Err(SplitError::Configuration(format!(
                "fold_count must be at least 3 to leave room for train, val and test, got {}",
                self.fold_count
            )));
        }
        match &self.criterion {
            CriterionConfig::Ethnicity { split_map, iid_buckets, .. } => {
                if split_map.is_empty() {
                    return Err(SplitError::Configuration("ethnicity split_map is empty".into()));
                }
                let mut seen = BTreeSet::new();
                for (code, _) in split_map {
                    if !seen.insert(*code) {
                        return Err(SplitError::Configuration(format!(
                            "ethnic background code {} is mapped twice",
                            code
                        )));
                    }
                }
                if *iid_buckets == Some(0) {
                    return Err(SplitError::Configuration("iid_buckets must be positive".into()));
                }
            }
            CriterionConfig::Region { codes, .. } => {
                if codes.is_empty() {
                    return Err(SplitError::Configuration("region split admits no ethnic codes".into()));
                }
            }
            CriterionConfig::Superpopulation { n_subsample_nodes, n_subsample_samples, .. } => {
                if *n_subsample_nodes > 0 && *n_subsample_samples == 0 {
                    return Err(SplitError::Configuration(
                        "n_subsample_samples must be positive when subsample nodes are requested".into(),
                    ));
                }
            }
            CriterionConfig::AssessmentCentre { centres } => {
                if centres.is_empty() {
                    return Err(SplitError::Configuration("assessment centre table is empty".into()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_ethnicity_config_gets_defaults() -> Result<()> {
        let config = SplitConfig::from_toml_str(
            r#"
            output_root = "/data"

            [criterion]
            kind = "ethnicity"
            "#,
        )?;
        assert_eq!(config.random_seed, 34);
        assert_eq!(config.fold_count, 5);
        assert_eq!(config.split_name(), "ethnic_split");
        assert!(!config.extraction.enabled);
        match &config.criterion {
            CriterionConfig::Ethnicity { exclude_codes, split_map, iid_buckets, .. } => {
                assert_eq!(exclude_codes, &vec![-1, -3, 0]);
                assert!(split_map.contains(&(1001, 0)));
                assert_eq!(*iid_buckets, None);
            }
            other => panic!("unexpected criterion {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn full_config_parses_all_sections() -> Result<()> {
        let config = SplitConfig::from_toml_str(
            r#"
            output_root = "/data"
            split_name = "custom"
            random_seed = 7
            fold_count = 4

            [criterion]
            kind = "superpopulation"
            table = "/data/superpopulations.tsv"
            n_subsample_nodes = 2
            n_subsample_samples = 100

            [inputs]
            sample_qc_ids = "/data/qc.id"

            [extraction]
            binary = "/opt/plink2"
            source = "/data/ukb"
            retries = 5

            [cv]
            phenotype = "standing_height"
            standardize_columns = ["PC1", "age"]
            "#,
        )?;
        assert_eq!(config.split_name(), "custom");
        assert!(config.extraction.enabled);
        assert_eq!(config.extraction_retries(), 1);
        assert_eq!(config.cv.n_pcs, 10);
        assert_eq!(
            config.layout().node_ids_path(&crate::layout::NodeId::from_index(0)),
            PathBuf::from("/data/custom/split_ids/0.csv")
        );
        Ok(())
    }

    #[test]
    fn invalid_fold_count_is_rejected() {
        let result = SplitConfig::from_toml_str(
            r#"
            output_root = "/data"
            fold_count = 2
            [criterion]
            kind = "assessment_centre"
            "#,
        );
        assert!(matches!(result, Err(SplitError::Configuration(_))));
    }
}
