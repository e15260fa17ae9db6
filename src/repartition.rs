// repartition.rs
//
// Redistributes an existing node's train/val identifiers into finer sub-nodes. Every
// sub-node shares the original node's test file.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, SplitError};
use crate::layout::{ensure_parent, Layout, NodeId, Part};
use crate::table::{read_ids, write_ids};

/// How train/val rows are divided among sub-nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum SliceSpec {
    /// Near-equal contiguous slices; the first `len % n` slices get one extra row.
    Count(usize),
    /// Split points at `floor(cumsum(p) * len)`. Shares summing to less than one leave a
    /// remainder that becomes one more sub-node.
    Proportions(Vec<f64>),
}

const SHARE_TOLERANCE: f64 = 1e-9;

impl SliceSpec {
    pub fn validate(&self) -> Result<()> {
        match self {
            SliceSpec::Count(0) => Err(SplitError::Configuration("sub-node count must be positive".into())),
            SliceSpec::Count(_) => Ok(()),
            SliceSpec::Proportions(shares) => {
                if shares.is_empty() || shares.iter().any(|&p| !(p > 0.0) || !p.is_finite()) {
                    return Err(SplitError::Configuration(format!(
                        "sub-node shares must be positive, got {:?}",
                        shares
                    )));
                }
                let total: f64 = shares.iter().sum();
                if total > 1.0 + SHARE_TOLERANCE {
                    return Err(SplitError::Configuration(format!(
                        "sub-node shares sum to {}, more than 1",
                        total
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            SliceSpec::Count(n) => *n,
            SliceSpec::Proportions(shares) => {
                let total: f64 = shares.iter().sum();
                shares.len() + usize::from(total < 1.0 - SHARE_TOLERANCE)
            }
        }
    }

    /// Half-open row ranges for `len` rows, one per sub-node.
    pub fn bounds(&self, len: usize) -> Vec<(usize, usize)> {
        let mut cuts = vec![0usize];
        match self {
            SliceSpec::Count(n) => {
                for i in 0..*n {
                    let size = len / n + usize::from(i < len % n);
                    cuts.push(cuts[i] + size);
                }
            }
            SliceSpec::Proportions(shares) => {
                let mut cumulative = 0.0_f64;
                for share in shares {
                    cumulative += *share;
                    let cut = if cumulative >= 1.0 - SHARE_TOLERANCE {
                        len
                    } else {
                        ((cumulative * len as f64).floor() as usize).min(len)
                    };
                    cuts.push(cut);
                }
                if cuts.len() - 1 < self.node_count() {
                    cuts.push(len);
                }
            }
        }
        cuts.windows(2).map(|w| (w[0], w[1])).collect()
    }
}

#[cfg(unix)]
fn link_shared(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, destination)
}

#[cfg(not(unix))]
fn link_shared(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::hard_link(source, destination)
}

/// Slices each fold's train and val identifiers of `source_node` into sub-nodes
/// `0..spec.node_count()` of `target`, and links every sub-node's test file to the source
/// node's test file.
pub fn repartition(
    source: &Layout,
    source_node: &NodeId,
    target: &Layout,
    spec: &SliceSpec,
    n_folds: usize,
) -> Result<Vec<NodeId>> {
    spec.validate()?;
    let sub_nodes: Vec<NodeId> = (0..spec.node_count()).map(NodeId::from_index).collect();
    info!(
        "Re-partitioning node {} of {} into {} sub-nodes of {}",
        source_node,
        source.split_root().display(),
        sub_nodes.len(),
        target.split_root().display()
    );

    // Every slice is checked before the first file is written.
    let mut slices = Vec::with_capacity(n_folds * 2);
    for fold in 0..n_folds {
        for part in [Part::Train, Part::Val] {
            let ids = read_ids(&source.ids_path(source_node, fold, part))?;
            let bounds = spec.bounds(ids.len());
            let sliced: usize = bounds.iter().map(|(start, end)| end - start).sum();
            if sliced != ids.len() {
                return Err(SplitError::Configuration(format!(
                    "fold {} {}: slices cover {} of {} rows",
                    fold,
                    part,
                    sliced,
                    ids.len()
                )));
            }
            if let Some(position) = bounds.iter().position(|(start, end)| start == end) {
                return Err(SplitError::EmptyNode {
                    node: sub_nodes[position].clone(),
                    context: format!("fold {} {} slice of node {} is empty", fold, part, source_node),
                });
            }
            slices.push((fold, part, ids, bounds));
        }
    }

    for (fold, part, ids, bounds) in &slices {
        for (node, &(start, end)) in sub_nodes.iter().zip(bounds) {
            write_ids(&target.ids_path(node, *fold, *part), &ids[start..end])?;
        }
    }

    for fold in 0..n_folds {
        let shared_test = source.ids_path(source_node, fold, Part::Test);
        let shared_test = fs::canonicalize(&shared_test).map_err(|e| SplitError::io(&shared_test, e))?;
        for node in &sub_nodes {
            let destination = target.ids_path(node, fold, Part::Test);
            if fs::symlink_metadata(&destination).is_ok() {
                debug!("{} already exists; leaving it in place.", destination.display());
                continue;
            }
            ensure_parent(&destination)?;
            link_shared(&shared_test, &destination).map_err(|e| SplitError::io(&destination, e))?;
        }
    }
    Ok(sub_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folds::{read_fold, split, write_folds};
    use crate::table::SampleKey;
    use tempfile::tempdir;

    #[test]
    fn count_bounds_match_array_split() {
        assert_eq!(SliceSpec::Count(3).bounds(10), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(SliceSpec::Count(2).bounds(4), vec![(0, 2), (2, 4)]);
    }

    #[test]
    fn proportion_bounds_use_floored_cumulative_cuts() {
        let spec = SliceSpec::Proportions(vec![0.5, 0.3, 0.2]);
        assert_eq!(spec.node_count(), 3);
        assert_eq!(spec.bounds(11), vec![(0, 5), (5, 8), (8, 11)]);

        let partial = SliceSpec::Proportions(vec![0.25, 0.25]);
        assert_eq!(partial.node_count(), 3);
        assert_eq!(partial.bounds(10), vec![(0, 2), (2, 5), (5, 10)]);

        let tenths = SliceSpec::Proportions(vec![0.1; 10]);
        assert_eq!(tenths.node_count(), 10);
        let bounds = tenths.bounds(100);
        assert_eq!(bounds.len(), 10);
        assert_eq!(bounds.last().map(|&(_, end)| end), Some(100));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(SliceSpec::Count(0).validate().is_err());
        assert!(SliceSpec::Proportions(vec![0.7, 0.6]).validate().is_err());
        assert!(SliceSpec::Proportions(vec![0.5, -0.1]).validate().is_err());
        assert!(SliceSpec::Proportions(vec![]).validate().is_err());
    }

    #[test]
    fn sub_nodes_partition_train_val_and_share_test() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let source = Layout::new(dir.path(), "ethnic_split", "height");
        let target = Layout::new(dir.path(), "wb_split", "height");
        let node = NodeId::from_index(0);
        let ids: Vec<SampleKey> = (0..120).map(|i| SampleKey::subject(i.to_string())).collect();
        let folds = split(&node, &ids, None, 5, 34)?;
        write_folds(&source, &node, &folds)?;

        let spec = SliceSpec::Proportions(vec![0.5, 0.3, 0.2]);
        let sub_nodes = repartition(&source, &node, &target, &spec, 5)?;
        assert_eq!(sub_nodes.len(), 3);

        for original in &folds {
            let mut train_val = Vec::new();
            for sub in &sub_nodes {
                let fold = read_fold(&target, sub, original.index)?;
                assert_eq!(fold.test, original.test);
                train_val.extend(fold.train);
                train_val.extend(fold.val);
            }
            let mut expected = original.train.clone();
            expected.extend(original.val.iter().cloned());
            train_val.sort();
            expected.sort();
            assert_eq!(train_val, expected);
        }

        let link = target.ids_path(&sub_nodes[2], 0, Part::Test);
        let metadata = fs::symlink_metadata(&link).map_err(|e| SplitError::io(&link, e))?;
        assert_eq!(metadata.file_type().is_symlink(), cfg!(unix));

        // Re-running leaves the shared links alone.
        repartition(&source, &node, &target, &spec, 5)?;
        Ok(())
    }

    #[test]
    fn too_many_sub_nodes_leave_an_empty_slice() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let source = Layout::new(dir.path(), "ethnic_split", "height");
        let target = Layout::new(dir.path(), "wb_split", "height");
        let node = NodeId::from_index(0);
        let ids: Vec<SampleKey> = (0..9).map(|i| SampleKey::subject(i.to_string())).collect();
        write_folds(&source, &node, &split(&node, &ids, None, 3, 34)?)?;

        let result = repartition(&source, &node, &target, &SliceSpec::Count(10), 3);
        assert!(matches!(result, Err(SplitError::EmptyNode { .. })));
        Ok(())
    }

    #[test]
    fn empty_slice_in_any_fold_writes_nothing() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let source = Layout::new(dir.path(), "ethnic_split", "height");
        let target = Layout::new(dir.path(), "wb_split", "height");
        let node = NodeId::from_index(0);
        let ids: Vec<SampleKey> = (0..9).map(|i| SampleKey::subject(i.to_string())).collect();
        let folds = split(&node, &ids, None, 3, 34)?;
        assert!(folds.iter().all(|fold| fold.train.len() + fold.val.len() == 6));
        write_folds(&source, &node, &folds)?;

        // Six train/val rows cannot fill four slices in both parts.
        let result = repartition(&source, &node, &target, &SliceSpec::Count(4), 3);
        assert!(matches!(result, Err(SplitError::EmptyNode { .. })));
        assert!(!target.split_ids_dir().exists());
        assert!(!target.ids_path(&NodeId::from_index(0), 0, Part::Train).exists());
        Ok(())
    }
}
