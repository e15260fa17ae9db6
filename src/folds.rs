// folds.rs
//
// Deterministic K-fold splitting of one node into train/val/test identifier sets.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, SplitError};
use crate::layout::{Layout, NodeId, Part};
use crate::table::{read_ids, write_ids, SampleKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<SampleKey>,
    pub val: Vec<SampleKey>,
    pub test: Vec<SampleKey>,
}

impl Fold {
    pub fn part(&self, part: Part) -> &[SampleKey] {
        match part {
            Part::Train => &self.train,
            Part::Val => &self.val,
            Part::Test => &self.test,
        }
    }
}

/// Splits `ids` into `k` folds. When `labels` is given (one per id, same order) both the
/// test folds and the train/val split preserve label proportions.
///
/// Identical `ids`, `labels`, `k` and `seed` always give identical folds. Within each part
/// identifiers keep their input order.
pub fn split(
    node: &NodeId,
    ids: &[SampleKey],
    labels: Option<&[String]>,
    k: usize,
    seed: u64,
) -> Result<Vec<Fold>> {
    if k < 3 {
        return Err(SplitError::Configuration(format!(
            "node {}: {} folds leave no room for a validation part",
            node, k
        )));
    }
    if ids.is_empty() {
        return Err(SplitError::EmptyNode {
            node: node.clone(),
            context: "no identifiers to split into folds".into(),
        });
    }
    if ids.len() < k {
        return Err(SplitError::Configuration(format!(
            "node {} has {} identifiers, fewer than the {} folds requested",
            node,
            ids.len(),
            k
        )));
    }
    if let Some(labels) = labels {
        if labels.len() != ids.len() {
            return Err(SplitError::Configuration(format!(
                "node {}: {} stratification labels for {} identifiers",
                node,
                labels.len(),
                ids.len()
            )));
        }
    }

    let test_assignment = match labels {
        None => kfold_assignment(ids.len(), k, seed),
        Some(labels) => stratified_kfold_assignment(node, labels, k, seed)?,
    };

    let mut folds = Vec::with_capacity(k);
    for fold_index in 0..k {
        let mut test = Vec::new();
        let mut train_val = Vec::new();
        for (position, &assigned) in test_assignment.iter().enumerate() {
            if assigned == fold_index {
                test.push(position);
            } else {
                train_val.push(position);
            }
        }

        let n_train = train_val.len() * (k - 2) / (k - 1);
        let is_val = match labels {
            None => holdout_mask(&train_val, n_train, seed),
            Some(labels) => stratified_holdout_mask(&train_val, labels, n_train, seed),
        };

        let mut train = Vec::with_capacity(n_train);
        let mut val = Vec::with_capacity(train_val.len() - n_train);
        for (slot, &position) in train_val.iter().enumerate() {
            if is_val[slot] {
                val.push(ids[position].clone());
            } else {
                train.push(ids[position].clone());
            }
        }
        debug!(
            "Node {} fold {}: train {}, val {}, test {}",
            node,
            fold_index,
            train.len(),
            val.len(),
            test.len()
        );
        folds.push(Fold {
            index: fold_index,
            train,
            val,
            test: test.into_iter().map(|position| ids[position].clone()).collect(),
        });
    }
    Ok(folds)
}

/// Sizes of `k` contiguous chunks of `n` items; the first `n % k` are one larger.
fn chunk_sizes(n: usize, k: usize) -> Vec<usize> {
    (0..k).map(|i| n / k + usize::from(i < n % k)).collect()
}

/// Fold index per position: shuffle positions, then cut into contiguous chunks.
fn kfold_assignment(n: usize, k: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let mut assignment = vec![0; n];
    let mut cursor = 0;
    for (fold, size) in chunk_sizes(n, k).into_iter().enumerate() {
        for &position in &order[cursor..cursor + size] {
            assignment[position] = fold;
        }
        cursor += size;
    }
    assignment
}

fn strata(labels: &[String], positions: impl Iterator<Item = usize>) -> BTreeMap<&str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for position in positions {
        groups.entry(labels[position].as_str()).or_default().push(position);
    }
    groups
}

/// Each stratum is shuffled and dealt round-robin, continuing where the previous stratum
/// stopped, so every fold gets its share of each label and fold sizes differ by at most one.
fn stratified_kfold_assignment(node: &NodeId, labels: &[String], k: usize, seed: u64) -> Result<Vec<usize>> {
    let groups = strata(labels, 0..labels.len());
    if let Some((label, members)) = groups.iter().find(|(_, members)| members.len() < k) {
        return Err(SplitError::UndersizedStratum {
            node: node.clone(),
            label: label.to_string(),
            count: members.len(),
            folds: k,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignment = vec![0; labels.len()];
    let mut dealt = 0usize;
    for members in groups.into_values() {
        let mut members = members;
        members.shuffle(&mut rng);
        for position in members {
            assignment[position] = dealt % k;
            dealt += 1;
        }
    }
    Ok(assignment)
}

/// Marks all but `n_train` of `positions` as validation, chosen by a seeded shuffle.
fn holdout_mask(positions: &[usize], n_train: usize, seed: u64) -> Vec<bool> {
    let mut slots: Vec<usize> = (0..positions.len()).collect();
    slots.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let mut is_val = vec![false; positions.len()];
    for &slot in &slots[n_train..] {
        is_val[slot] = true;
    }
    is_val
}

/// Validation counts per stratum by largest remainder, so the total is exact and each
/// stratum's share is within one of proportional.
fn stratified_holdout_mask(positions: &[usize], labels: &[String], n_train: usize, seed: u64) -> Vec<bool> {
    let n = positions.len();
    let n_val = n - n_train;
    let slot_of: HashMap<usize, usize> = positions.iter().enumerate().map(|(slot, &p)| (p, slot)).collect();
    let groups = strata(labels, positions.iter().copied());

    let mut quotas: Vec<usize> = Vec::with_capacity(groups.len());
    let mut remainders: Vec<(usize, usize)> = Vec::with_capacity(groups.len());
    for (g, members) in groups.values().enumerate() {
        let exact = members.len() * n_val;
        quotas.push(exact / n);
        remainders.push((exact % n, g));
    }
    let shortfall = n_val - quotas.iter().sum::<usize>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, g) in remainders.iter().take(shortfall) {
        quotas[g] += 1;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut is_val = vec![false; n];
    for (members, quota) in groups.into_values().zip(quotas) {
        let mut members = members;
        members.shuffle(&mut rng);
        for position in &members[..quota] {
            is_val[slot_of[position]] = true;
        }
    }
    is_val
}

/// Persists folds as the canonical identifier files every later step re-reads.
pub fn write_folds(layout: &Layout, node: &NodeId, folds: &[Fold]) -> Result<()> {
    for fold in folds {
        for part in Part::ALL {
            write_ids(&layout.ids_path(node, fold.index, part), fold.part(part))?;
        }
    }
    info!("Wrote {} folds for node {} under {}", folds.len(), node, layout.split_ids_dir().display());
    Ok(())
}

pub fn read_fold(layout: &Layout, node: &NodeId, fold_index: usize) -> Result<Fold> {
    let read = |part: Part| -> Result<Vec<SampleKey>> { read_ids(&layout.ids_path(node, fold_index, part)) };
    Ok(Fold {
        index: fold_index,
        train: read(Part::Train)?,
        val: read(Part::Val)?,
        test: read(Part::Test)?,
    })
}

/// Reads a node's identifiers, splits them and writes the fold files.
pub fn split_node_file(
    layout: &Layout,
    node: &NodeId,
    ids_path: &Path,
    labels: Option<&HashMap<String, String>>,
    stratify_column: &str,
    k: usize,
    seed: u64,
) -> Result<Vec<Fold>> {
    let ids = read_ids(ids_path)?;
    let node_labels = match labels {
        None => None,
        Some(lookup) => Some(
            ids.iter()
                .map(|key| {
                    lookup.get(&key.iid).cloned().ok_or_else(|| SplitError::UnmappedCriterion {
                        node: node.clone(),
                        iid: key.iid.clone(),
                        column: stratify_column.to_string(),
                    })
                })
                .collect::<Result<Vec<String>>>()?,
        ),
    };
    let folds = split(node, &ids, node_labels.as_deref(), k, seed)?;
    write_folds(layout, node, &folds)?;
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn ids(n: usize) -> Vec<SampleKey> {
        (0..n).map(|i| SampleKey::subject(format!("S{}", i))).collect()
    }

    fn assert_partition_of(folds: &[Fold], all: &[SampleKey]) {
        let everything: HashSet<&SampleKey> = all.iter().collect();
        let mut test_counts: HashMap<&SampleKey, usize> = HashMap::new();
        for fold in folds {
            let mut seen = HashSet::new();
            for part in Part::ALL {
                for key in fold.part(part) {
                    assert!(seen.insert(key), "{} repeated in fold {}", key.iid, fold.index);
                }
            }
            assert_eq!(seen.len(), all.len());
            assert!(seen.iter().all(|key| everything.contains(key)));
            for key in &fold.test {
                *test_counts.entry(key).or_default() += 1;
            }
        }
        assert_eq!(test_counts.len(), all.len());
        assert!(test_counts.values().all(|&count| count == 1));
    }

    #[test]
    fn hundred_twenty_samples_five_folds() -> Result<()> {
        let node = NodeId::from_index(0);
        let all = ids(120);
        let folds = split(&node, &all, None, 5, 34)?;
        assert_eq!(folds.len(), 5);
        for fold in &folds {
            assert_eq!(fold.test.len(), 24);
            assert_eq!(fold.train.len(), 72);
            assert_eq!(fold.val.len(), 24);
        }
        assert_partition_of(&folds, &all);
        assert_eq!(folds, split(&node, &all, None, 5, 34)?);
        Ok(())
    }

    #[test]
    fn different_seeds_give_different_folds() -> Result<()> {
        let node = NodeId::from_index(0);
        let all = ids(60);
        assert_ne!(split(&node, &all, None, 5, 1)?, split(&node, &all, None, 5, 2)?);
        Ok(())
    }

    #[test]
    fn uneven_sizes_still_cover_every_identifier() -> Result<()> {
        let all = ids(103);
        let folds = split(&NodeId::from_index(1), &all, None, 4, 7)?;
        assert_partition_of(&folds, &all);
        let test_sizes: Vec<usize> = folds.iter().map(|f| f.test.len()).collect();
        assert_eq!(test_sizes, vec![26, 26, 26, 25]);
        Ok(())
    }

    #[test]
    fn stratified_folds_preserve_label_balance() -> Result<()> {
        let all = ids(100);
        let labels: Vec<String> = (0..100).map(|i| if i < 80 { "0".into() } else { "1".into() }).collect();
        let folds = split(&NodeId::from_index(0), &all, Some(&labels), 5, 34)?;
        assert_partition_of(&folds, &all);
        let label_of: HashMap<&SampleKey, &String> = all.iter().zip(labels.iter()).collect();
        for fold in &folds {
            let cases = |part: &[SampleKey]| part.iter().filter(|k| label_of[k].as_str() == "1").count();
            assert_eq!(fold.test.len(), 20);
            assert_eq!(cases(&fold.test), 4);
            assert_eq!(fold.train.len(), 60);
            assert_eq!(cases(&fold.train), 12);
            assert_eq!(cases(&fold.val), 4);
        }
        assert_eq!(folds, split(&NodeId::from_index(0), &all, Some(&labels), 5, 34)?);
        Ok(())
    }

    #[test]
    fn undersized_stratum_is_a_configuration_error() {
        let all = ids(30);
        let labels: Vec<String> = (0..30).map(|i| if i < 27 { "a".into() } else { "rare".into() }).collect();
        let err = split(&NodeId::from_index(2), &all, Some(&labels), 5, 34).unwrap_err();
        match err {
            SplitError::UndersizedStratum { label, count, folds, .. } => {
                assert_eq!(label, "rare");
                assert_eq!(count, 3);
                assert_eq!(folds, 5);
            }
            other => panic!("expected undersized stratum, got {:?}", other),
        }
    }

    #[test]
    fn too_few_identifiers_or_folds_are_rejected() {
        let node = NodeId::from_index(0);
        assert!(matches!(split(&node, &ids(4), None, 5, 34), Err(SplitError::Configuration(_))));
        assert!(matches!(split(&node, &ids(10), None, 2, 34), Err(SplitError::Configuration(_))));
        assert!(matches!(split(&node, &[], None, 5, 34), Err(SplitError::EmptyNode { .. })));
    }

    #[test]
    fn fold_files_round_trip_through_layout() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let layout = Layout::new(dir.path(), "ethnic_split", "height");
        let node = NodeId::from_index(0);
        let source = layout.node_ids_path(&node);
        write_ids(&source, &ids(30))?;

        let folds = split_node_file(&layout, &node, &source, None, "", 5, 34)?;
        for fold in &folds {
            assert_eq!(&read_fold(&layout, &node, fold.index)?, fold);
        }
        Ok(())
    }

    #[test]
    fn missing_stratification_label_names_the_sample() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let layout = Layout::new(dir.path(), "ethnic_split", "asthma");
        let node = NodeId::from_index(0);
        let source = layout.node_ids_path(&node);
        write_ids(&source, &ids(10))?;
        let labels: HashMap<String, String> = (0..9).map(|i| (format!("S{}", i), "0".to_string())).collect();

        let err = split_node_file(&layout, &node, &source, Some(&labels), "asthma", 3, 34).unwrap_err();
        assert!(matches!(err, SplitError::UnmappedCriterion { ref iid, .. } if iid == "S9"));
        Ok(())
    }
}
