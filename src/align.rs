// align.rs
//
// Joins phenotype, covariate and PCA tables onto a fold's identifier sets.

use log::debug;

use crate::error::{Result, SplitError};
use crate::folds::read_fold;
use crate::layout::{FoldArtifact, Layout, NodeId, Part};
use crate::table::Table;

/// Node-level sources, loaded once and shared read-only by every fold of the node.
#[derive(Clone, Debug)]
pub struct NodeSources {
    /// Covariates followed by the phenotype as the last column.
    pub covariates_phenotype: Table,
    pub pca: Table,
}

impl NodeSources {
    pub fn load(layout: &Layout, node: &NodeId) -> Result<Self> {
        let covariates_phenotype = Table::read(&layout.source_phenotype_path(node))?;
        if covariates_phenotype.columns().is_empty() {
            return Err(SplitError::Configuration(format!(
                "phenotype table for node {} has no phenotype column",
                node
            )));
        }
        Ok(Self {
            covariates_phenotype,
            pca: Table::read(&layout.source_pca_path(node))?,
        })
    }
}

/// Row counts written for one part of one fold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignedPart {
    pub part: Part,
    pub ids: usize,
    pub rows: usize,
}

fn pc_columns(n_pcs: usize) -> Vec<String> {
    (1..=n_pcs).map(|i| format!("PC{}", i)).collect()
}

/// Splits a joined PCA + covariate/phenotype table into the phenotype-only table and the
/// PCA+covariate table. Association tooling wants them as separate files.
///
/// Missing covariates are filled with the mean of this table's own rows, so train, val and
/// test are each imputed from their own statistics.
pub fn prepare_cov_and_phenotype(pca: &Table, covariates_phenotype: &Table, n_pcs: usize) -> Result<(Table, Table)> {
    let columns = covariates_phenotype.columns();
    let (phenotype_column, covariate_columns) = columns
        .split_last()
        .ok_or_else(|| SplitError::Configuration("phenotype table has no phenotype column".into()))?;

    let merged = pca.inner_join(covariates_phenotype)?;
    let mut pca_cov_columns = pc_columns(n_pcs);
    pca_cov_columns.extend(covariate_columns.iter().cloned());

    let pca_cov = merged.select(&pca_cov_columns)?.fill_missing_with_column_mean()?;
    let phenotype = merged.select(std::slice::from_ref(phenotype_column))?;
    Ok((phenotype, pca_cov))
}

fn non_empty(table: Table, node: &NodeId, fold: usize, part: Part, name: &str) -> Result<Table> {
    if table.nrows() == 0 {
        return Err(SplitError::JoinIntegrity {
            node: node.clone(),
            fold,
            part,
            table: name.to_string(),
        });
    }
    Ok(table)
}

/// Writes the sliced sources, the phenotype table and the PCA+covariate table for every
/// part of one fold. Identifiers are re-read from the persisted fold files.
pub fn align_fold(
    layout: &Layout,
    node: &NodeId,
    fold_index: usize,
    sources: &NodeSources,
    n_pcs: usize,
) -> Result<Vec<AlignedPart>> {
    let fold = read_fold(layout, node, fold_index)?;
    let mut aligned = Vec::with_capacity(Part::ALL.len());
    for part in Part::ALL {
        let ids = fold.part(part);
        let path = |artifact| layout.fold_path(artifact, node, fold_index, part);

        let covariates_phenotype = non_empty(
            sources.covariates_phenotype.restrict_to(ids)?,
            node,
            fold_index,
            part,
            "phenotype",
        )?;
        let pca = non_empty(sources.pca.restrict_to(ids)?, node, fold_index, part, "pca")?;
        covariates_phenotype.write(&path(FoldArtifact::CovariatesPhenotype))?;
        pca.write(&path(FoldArtifact::Pca))?;

        let (phenotype, pca_cov) = prepare_cov_and_phenotype(&pca, &covariates_phenotype, n_pcs)?;
        let pca_cov = non_empty(pca_cov, node, fold_index, part, "pca+covariates")?;
        phenotype.write(&path(FoldArtifact::Phenotype))?;
        pca_cov.write(&path(FoldArtifact::PcaCovariates))?;

        debug!(
            "Node {} fold {} {}: {} ids, {} aligned rows",
            node,
            fold_index,
            part,
            ids.len(),
            pca_cov.nrows()
        );
        aligned.push(AlignedPart {
            part,
            ids: ids.len(),
            rows: pca_cov.nrows(),
        });
    }
    Ok(aligned)
}
