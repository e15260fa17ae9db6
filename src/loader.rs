// loader.rs
//
// Normalizes raw per-sample label sources into canonical `SampleRecord`s.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{Result, SplitError};
use crate::layout::Part;
use crate::table::{is_missing, RawTable, SampleKey, IID};

/// Value of the partitioning criterion for one sample.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    Code(i64),
    Text(String),
}

impl Label {
    pub fn code(&self) -> Option<i64> {
        match self {
            Label::Code(code) => Some(*code),
            Label::Text(_) => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Code(code) => write!(f, "{}", code),
            Label::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleRecord {
    pub key: SampleKey,
    pub label: Label,
}

/// Parses integer category codes, including the `1001.0` form written by float columns.
pub fn parse_code(token: &str) -> Option<i64> {
    if let Ok(code) = token.parse::<i64>() {
        return Some(code);
    }
    let value = token.parse::<f64>().ok()?;
    (value.is_finite() && value.fract() == 0.0).then_some(value as i64)
}

/// Supplies per-field tables already split into train/val/test views.
pub trait TabularLoader {
    fn load_view(&self, field: &str, part: Part) -> Result<RawTable>;
}

/// Reads `{root}/{field}/{part}.tsv`; each view has an `IID` column and a column named
/// after the field code.
#[derive(Clone, Debug)]
pub struct FileTabularLoader {
    root: PathBuf,
}

impl FileTabularLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TabularLoader for FileTabularLoader {
    fn load_view(&self, field: &str, part: Part) -> Result<RawTable> {
        let path = self.root.join(field).join(format!("{}.tsv", part));
        RawTable::read(&path)
    }
}

/// Natural order on IIDs so numeric identifiers sort numerically.
fn sort_canonical(records: &mut [SampleRecord]) {
    records.sort_by(|a, b| natord::compare(&a.key.iid, &b.key.iid));
}

/// Concatenates the loader's three views of `field` into canonical records.
/// Rows with a missing or non-integer value are dropped; duplicate IIDs keep the first view's row.
pub fn load_category_records(loader: &dyn TabularLoader, field: &str) -> Result<Vec<SampleRecord>> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut dropped = 0usize;

    for part in Part::ALL {
        let view = loader.load_view(field, part)?;
        let source = PathBuf::from(format!("{}/{}", field, part));
        let iid_col = view.require_column(IID, &source)?;
        let value_col = view.require_column(field, &source)?;
        for row in &view.rows {
            let token = row[value_col].as_str();
            let code = if is_missing(token) { None } else { parse_code(token) };
            let Some(code) = code else {
                dropped += 1;
                continue;
            };
            if !seen.insert(row[iid_col].clone()) {
                warn!("Sample {} appears in more than one loader view; keeping the first.", row[iid_col]);
                continue;
            }
            records.push(SampleRecord {
                key: SampleKey::subject(row[iid_col].clone()),
                label: Label::Code(code),
            });
        }
    }

    sort_canonical(&mut records);
    info!(
        "Loaded {} samples for field {} ({} rows without a usable value dropped).",
        records.len(),
        field,
        dropped
    );
    Ok(records)
}

/// Reads the sample QC id list (`IID` or `#IID` column).
pub fn read_sample_qc_ids(path: &Path) -> Result<HashSet<String>> {
    let raw = RawTable::read(path)?;
    let iid_col = raw.require_column(IID, path)?;
    Ok(raw.rows.into_iter().map(|mut row| row.swap_remove(iid_col)).collect())
}

pub fn retain_qc_passed(records: Vec<SampleRecord>, passed: &HashSet<String>) -> Vec<SampleRecord> {
    let before = records.len();
    let kept: Vec<SampleRecord> = records
        .into_iter()
        .filter(|record| passed.contains(&record.key.iid))
        .collect();
    info!("Sample QC: kept {} of {} samples.", kept.len(), before);
    kept
}

/// IID to region code. Rows without a region are skipped.
pub fn load_region_table(path: &Path, column: &str) -> Result<HashMap<String, String>> {
    let raw = RawTable::read(path)?;
    let iid_col = raw.require_column(IID, path)?;
    let region_col = raw.require_column(column, path)?;
    let regions: HashMap<String, String> = raw
        .rows
        .iter()
        .filter(|row| !is_missing(&row[region_col]))
        .map(|row| (row[iid_col].clone(), row[region_col].clone()))
        .collect();
    debug!("Region table {}: {} samples with a region code.", path.display(), regions.len());
    Ok(regions)
}

/// Superpopulation assignments: `IID` plus an integer-coded `node_index`.
pub fn load_superpopulation_records(path: &Path) -> Result<Vec<SampleRecord>> {
    let raw = RawTable::read(path)?;
    let iid_col = raw.require_column(IID, path)?;
    let node_col = raw.require_column("node_index", path)?;
    let mut records = Vec::with_capacity(raw.rows.len());
    for row in &raw.rows {
        let token = row[node_col].as_str();
        if is_missing(token) {
            continue;
        }
        let code = parse_code(token)
            .ok_or_else(|| SplitError::parse(path, format!("node_index '{}' is not an integer", token)))?;
        records.push(SampleRecord {
            key: SampleKey::subject(row[iid_col].clone()),
            label: Label::Code(code),
        });
    }
    sort_canonical(&mut records);
    Ok(records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// In-memory loader keyed by (field, part).
    pub(crate) struct MemoryLoader {
        pub(crate) views: HashMap<(String, Part), RawTable>,
    }

    impl TabularLoader for MemoryLoader {
        fn load_view(&self, field: &str, part: Part) -> Result<RawTable> {
            self.views
                .get(&(field.to_string(), part))
                .cloned()
                .ok_or_else(|| SplitError::Configuration(format!("no {} view for field {}", part, field)))
        }
    }

    pub(crate) fn view(field: &str, rows: &[(&str, &str)]) -> RawTable {
        RawTable {
            headers: vec![IID.to_string(), field.to_string()],
            rows: rows
                .iter()
                .map(|(iid, value)| vec![iid.to_string(), value.to_string()])
                .collect(),
        }
    }

    #[test]
    fn parse_code_accepts_float_formatted_integers() {
        assert_eq!(parse_code("1001"), Some(1001));
        assert_eq!(parse_code("1001.0"), Some(1001));
        assert_eq!(parse_code("-3"), Some(-3));
        assert_eq!(parse_code("1.5"), None);
        assert_eq!(parse_code("abc"), None);
    }

    #[test]
    fn views_are_concatenated_deduplicated_and_sorted() -> Result<()> {
        let mut views = HashMap::new();
        views.insert(("21000".to_string(), Part::Train), view("21000", &[("10", "1001"), ("2", "NA")]));
        views.insert(("21000".to_string(), Part::Val), view("21000", &[("9", "4001.0")]));
        views.insert(("21000".to_string(), Part::Test), view("21000", &[("10", "5"), ("1", "-3")]));
        let records = load_category_records(&MemoryLoader { views }, "21000")?;

        let ids: Vec<&str> = records.iter().map(|r| r.key.iid.as_str()).collect();
        assert_eq!(ids, vec!["1", "9", "10"]);
        assert_eq!(records[2].label, Label::Code(1001));
        assert_eq!(records[0].label, Label::Code(-3));
        assert_eq!(records[1].key.fid, "9");
        Ok(())
    }

    #[test]
    fn file_loader_reads_field_views_from_disk() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let field_dir = dir.path().join("54");
        fs::create_dir_all(&field_dir).map_err(|e| SplitError::io(&field_dir, e))?;
        for (part, body) in [("train", "IID\t54\n1\t11012\n"), ("val", "IID\t54\n2\t11021\n"), ("test", "IID\t54\n")] {
            let path = field_dir.join(format!("{}.tsv", part));
            fs::write(&path, body).map_err(|e| SplitError::io(&path, e))?;
        }
        let records = load_category_records(&FileTabularLoader::new(dir.path()), "54")?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label.code(), Some(11021));
        Ok(())
    }

    #[test]
    fn qc_filter_and_region_table() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let qc = dir.path().join("qc.id");
        fs::write(&qc, "#IID\tSEX\n1\t1\n3\t2\n").map_err(|e| SplitError::io(&qc, e))?;
        let passed = read_sample_qc_ids(&qc)?;
        let records = vec![
            SampleRecord { key: SampleKey::subject("1"), label: Label::Code(1001) },
            SampleRecord { key: SampleKey::subject("2"), label: Label::Code(1001) },
        ];
        let kept = retain_qc_passed(records, &passed);
        assert_eq!(kept.len(), 1);

        let areas = dir.path().join("areas.csv");
        fs::write(&areas, "IID,nuts118cd\n1,UKC\n2,\n3,UKD\n").map_err(|e| SplitError::io(&areas, e))?;
        let regions = load_region_table(&areas, "nuts118cd")?;
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.get("3").map(String::as_str), Some("UKD"));
        Ok(())
    }
}
