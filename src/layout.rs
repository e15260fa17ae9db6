// layout.rs
//
// Every file name the pipeline reads or writes is derived here.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SplitError};

/// Name of a node. Strategies number their nodes, but CV can also address nodes by
/// an arbitrary name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        NodeId(index.to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric index, if this node was created by a partition strategy.
    pub fn index(&self) -> Option<usize> {
        self.0.parse().ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Part {
    Train,
    Val,
    Test,
}

impl Part {
    pub const ALL: [Part; 3] = [Part::Train, Part::Val, Part::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Part::Train => "train",
            Part::Val => "val",
            Part::Test => "test",
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-fold artifacts. Each kind lives under its own directory tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoldArtifact {
    Ids,
    /// Node phenotype+covariate table restricted to one fold part.
    CovariatesPhenotype,
    Pca,
    Phenotype,
    PcaCovariates,
}

#[derive(Clone, Debug)]
pub struct Layout {
    split_root: PathBuf,
    phenotype: String,
}

impl Layout {
    pub fn new(output_root: impl AsRef<Path>, split_name: &str, phenotype: &str) -> Self {
        Self {
            split_root: output_root.as_ref().join(split_name),
            phenotype: phenotype.to_string(),
        }
    }

    pub fn split_root(&self) -> &Path {
        &self.split_root
    }

    pub fn split_ids_dir(&self) -> PathBuf {
        self.split_root.join("split_ids")
    }

    pub fn genotypes_dir(&self) -> PathBuf {
        self.split_root.join("genotypes")
    }

    /// Identifier file written by a partition strategy: `split_ids/{node}.csv`.
    pub fn node_ids_path(&self, node: &NodeId) -> PathBuf {
        self.split_ids_dir().join(format!("{}.csv", node))
    }

    /// Identifier file for a node addressed by name rather than index.
    pub fn named_node_ids_path(&self, node: &NodeId) -> PathBuf {
        self.split_ids_dir().join(format!("{}.tsv", node))
    }

    /// Source identifiers for CV: numbered nodes use `.csv`, named nodes `.tsv`.
    pub fn source_ids_path(&self, node: &NodeId) -> PathBuf {
        match node.index() {
            Some(_) => self.node_ids_path(node),
            None => self.named_node_ids_path(node),
        }
    }

    pub fn genotype_prefix(&self, node: &NodeId) -> PathBuf {
        self.genotypes_dir().join(format!("node_{}", node))
    }

    pub fn source_phenotype_path(&self, node: &NodeId) -> PathBuf {
        self.split_root
            .join("phenotypes")
            .join(&self.phenotype)
            .join(format!("{}.tsv", node))
    }

    pub fn source_pca_path(&self, node: &NodeId) -> PathBuf {
        self.split_root.join("pca").join(format!("{}.eigenvec", node))
    }

    fn artifact_dir(&self, artifact: FoldArtifact) -> PathBuf {
        match artifact {
            FoldArtifact::Ids => self.split_ids_dir(),
            FoldArtifact::Pca => self.split_root.join("pca"),
            FoldArtifact::Phenotype => self.split_root.join("phenotypes").join(&self.phenotype),
            FoldArtifact::CovariatesPhenotype => {
                self.split_root.join("covariates").join(&self.phenotype)
            }
            FoldArtifact::PcaCovariates => {
                self.split_root.join("pca_covariates").join(&self.phenotype)
            }
        }
    }

    /// `{artifact_dir}/{node}/fold_{k}/{part}.tsv`
    pub fn fold_path(&self, artifact: FoldArtifact, node: &NodeId, fold: usize, part: Part) -> PathBuf {
        self.artifact_dir(artifact)
            .join(node.as_str())
            .join(format!("fold_{}", fold))
            .join(format!("{}.tsv", part))
    }

    pub fn ids_path(&self, node: &NodeId, fold: usize, part: Part) -> PathBuf {
        self.fold_path(FoldArtifact::Ids, node, fold, part)
    }
}

/// Creates the parent directory of `path` if needed.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| SplitError::io(parent, e))?;
        }
    }
    Ok(())
}
