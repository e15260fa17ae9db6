// error.rs

use polars::prelude::PolarsError;
use std::path::PathBuf;
use thiserror::Error;

use crate::layout::{NodeId, Part};

/// Every failure the partitioning engine can surface.
///
/// Configuration-class variants abort the run before any file for the affected unit is
/// written. `JoinIntegrity` is scoped to one (node, fold, part) and `ExternalTool` to one
/// node's extraction; callers that process many units collect those and keep going.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration error: node {node} has no samples ({context})")]
    EmptyNode { node: NodeId, context: String },

    #[error(
        "Configuration error: stratum '{label}' has {count} member(s) in node {node}, fewer than the {folds} folds requested"
    )]
    UndersizedStratum {
        node: NodeId,
        label: String,
        count: usize,
        folds: usize,
    },

    #[error("Configuration error: sample {iid} in node {node} has no value for required column '{column}'")]
    UnmappedCriterion {
        node: NodeId,
        iid: String,
        column: String,
    },

    #[error(
        "Join integrity error: node {node}, fold {fold}, part {part}: no identifiers matched rows of {table}"
    )]
    JoinIntegrity {
        node: NodeId,
        fold: usize,
        part: Part,
        table: String,
    },

    #[error("External tool error for node {node}: exited with {status}:\n{diagnostics}")]
    ExternalTool {
        node: NodeId,
        status: String,
        diagnostics: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed table {path}: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl SplitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SplitError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn table(path: impl Into<PathBuf>, source: PolarsError) -> Self {
        SplitError::Table {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SplitError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for errors that invalidate the whole run rather than a single unit.
    pub fn is_fatal_for_run(&self) -> bool {
        !matches!(
            self,
            SplitError::JoinIntegrity { .. } | SplitError::ExternalTool { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SplitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_scoped_errors_do_not_abort_the_run() {
        let join = SplitError::JoinIntegrity {
            node: NodeId::from_index(2),
            fold: 1,
            part: Part::Val,
            table: "pca".to_string(),
        };
        assert!(!join.is_fatal_for_run());
        let message = join.to_string();
        assert!(message.contains("node 2"));
        assert!(message.contains("fold 1"));
        assert!(message.contains("val"));

        let empty = SplitError::EmptyNode {
            node: NodeId::from_index(0),
            context: "ethnicity".to_string(),
        };
        assert!(empty.is_fatal_for_run());
    }
}
