// standardize.rs
//
// Z-standardization fitted on the train part only.

use log::info;
use ndarray::{Array2, Axis};
use statrs::statistics::Statistics;

use crate::error::{Result, SplitError};
use crate::layout::{FoldArtifact, Layout, NodeId, Part};
use crate::table::Table;

/// Per-column mean and population standard deviation of a train table.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalingParameters {
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl ScalingParameters {
    /// Fits on `train`. `columns = None` selects every column except FID and IID.
    /// Missing cells are ignored.
    pub fn fit(train: &Table, columns: Option<&[String]>) -> Result<Self> {
        let columns: Vec<String> = match columns {
            Some(columns) => columns.to_vec(),
            None => train.columns(),
        };
        let values = train.values()?;
        let mut means = Vec::with_capacity(columns.len());
        let mut stds = Vec::with_capacity(columns.len());
        for name in &columns {
            let index = column_index(train, name)?;
            let observed: Vec<f64> = values
                .column(index)
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .collect();
            means.push(observed.iter().mean());
            stds.push(observed.iter().population_std_dev());
        }
        Ok(Self { columns, means, stds })
    }

    /// Zero-variance (or unobserved) columns are left unchanged.
    fn is_scalable(&self, c: usize) -> bool {
        let (mean, std) = (self.means[c], self.stds[c]);
        mean.is_finite() && std.is_finite() && std > f64::EPSILON * mean.abs().max(1.0)
    }

    /// Scales the fitted columns of `values`, laid out as `table`'s value columns.
    fn apply_to(&self, table: &Table, values: &mut Array2<f64>) -> Result<()> {
        for (c, name) in self.columns.iter().enumerate() {
            let index = column_index(table, name)?;
            if !self.is_scalable(c) {
                continue;
            }
            let (mean, std) = (self.means[c], self.stds[c]);
            values
                .index_axis_mut(Axis(1), index)
                .mapv_inplace(|v| (v - mean) / std);
        }
        Ok(())
    }

    /// Returns `table` with the fitted parameters applied. Identifier columns are never touched.
    pub fn apply(&self, table: &Table) -> Result<Table> {
        let mut values = table.values()?;
        self.apply_to(table, &mut values)?;
        table.with_values(values)
    }
}

fn column_index(table: &Table, name: &str) -> Result<usize> {
    table
        .column_index(name)
        .ok_or_else(|| SplitError::Configuration(format!("cannot standardize missing column '{}'", name)))
}

pub fn fit_transform(train: &Table, columns: Option<&[String]>) -> Result<(Table, ScalingParameters)> {
    let params = ScalingParameters::fit(train, columns)?;
    Ok((params.apply(train)?, params))
}

pub fn transform(other: &Table, params: &ScalingParameters) -> Result<Table> {
    params.apply(other)
}

/// Standardizes the PCA+covariate tables of one fold in place, fitting on train.
pub fn standardize_fold(
    layout: &Layout,
    node: &NodeId,
    fold: usize,
    columns: Option<&[String]>,
) -> Result<ScalingParameters> {
    let path = |part| layout.fold_path(FoldArtifact::PcaCovariates, node, fold, part);

    let (train, params) = fit_transform(&Table::read(&path(Part::Train))?, columns)?;
    train.write(&path(Part::Train))?;
    for part in [Part::Val, Part::Test] {
        transform(&Table::read(&path(part))?, &params)?.write(&path(part))?;
    }

    let summary: Vec<String> = params
        .columns
        .iter()
        .zip(params.means.iter().zip(&params.stds))
        .map(|(name, (mean, std))| format!("{}: mean {:.4}, std {:.4}", name, mean, std))
        .collect();
    info!("Node {} fold {} scaling parameters: {}", node, fold, summary.join("; "));
    Ok(params)
}
