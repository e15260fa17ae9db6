// table.rs
//
// Tab-separated per-sample tables keyed by (FID, IID), held as polars DataFrames.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, warn};
use ndarray::Array2;
use polars::prelude::*;

use crate::error::{Result, SplitError};
use crate::layout::ensure_parent;

pub const FID: &str = "FID";
pub const IID: &str = "IID";

const NULL_TOKENS: [&str; 4] = ["NA", "nan", "NaN", "None"];
const MISSING_OUTPUT: &str = "NA";
const ROW_ORDER: &str = "__row_order";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleKey {
    pub fid: String,
    pub iid: String,
}

impl SampleKey {
    /// Cohort samples carry the subject identifier in both columns.
    pub fn subject(iid: impl Into<String>) -> Self {
        let iid = iid.into();
        Self {
            fid: iid.clone(),
            iid,
        }
    }
}

/// Tab if the header line has one, otherwise comma. Identifier files are tab-separated
/// despite their `.csv` extension, so the extension is not trusted.
fn sniff_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path).map_err(|e| SplitError::io(path, e))?;
    let mut first_line = String::new();
    BufReader::new(file)
        .read_line(&mut first_line)
        .map_err(|e| SplitError::io(path, e))?;
    Ok(if first_line.contains('\t') { b'\t' } else { b',' })
}

/// Reads every column as a string. Missing tokens become nulls and the plink `#` header
/// marker is stripped.
fn read_string_frame(path: &Path) -> Result<DataFrame> {
    let separator = sniff_delimiter(path)?;
    let file = File::open(path).map_err(|e| SplitError::io(path, e))?;
    let null_values = NullValues::AllColumns(NULL_TOKENS.iter().map(|token| (*token).into()).collect());
    let mut frame = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(separator)
                        .with_missing_is_null(true)
                        .with_null_values(Some(null_values)),
                ),
        )
        .finish()
        .map_err(|e| SplitError::table(path, e))?;

    let marked: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .filter(|name| name.starts_with('#') || name.trim() != name)
        .collect();
    for name in marked {
        let normalized = name.trim().trim_start_matches('#').to_string();
        frame
            .rename(&name, normalized.into())
            .map_err(|e| SplitError::table(path, e))?;
    }
    debug!("Read {} rows x {} columns from {}", frame.height(), frame.width(), path.display());
    Ok(frame)
}

fn write_frame(path: &Path, frame: &mut DataFrame) -> Result<()> {
    ensure_parent(path)?;
    let mut file = File::create(path).map_err(|e| SplitError::io(path, e))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .with_null_value(MISSING_OUTPUT.to_string())
        .finish(frame)
        .map_err(|e| SplitError::table(path, e))
}

fn has_column(frame: &DataFrame, name: &str) -> bool {
    frame.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Untyped table used for label sources where values are codes, not measurements.
/// Null cells are represented by the empty string.
#[derive(Clone, Debug)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn read(path: &Path) -> Result<Self> {
        let frame = read_string_frame(path)?;
        let headers: Vec<String> = frame.get_column_names().iter().map(|name| name.to_string()).collect();
        let mut columns: Vec<Vec<String>> = Vec::with_capacity(headers.len());
        for column in frame.get_columns() {
            let values = column
                .str()
                .map_err(|e| SplitError::table(path, e))?
                .into_iter()
                .map(|cell| cell.map(|value| value.trim().to_string()).unwrap_or_default())
                .collect();
            columns.push(values);
        }
        let rows = (0..frame.height())
            .map(|r| columns.iter().map(|column| column[r].clone()).collect())
            .collect();
        Ok(Self { headers, rows })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str, path: &Path) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| SplitError::parse(path, format!("missing required column '{}'", name)))
    }
}

pub fn is_missing(token: &str) -> bool {
    token.is_empty() || NULL_TOKENS.contains(&token)
}

/// Reads an identifier file. Accepts `FID`+`IID`, or `IID` alone (FID := IID).
pub fn read_ids(path: &Path) -> Result<Vec<SampleKey>> {
    let raw = RawTable::read(path)?;
    let iid_col = raw.require_column(IID, path)?;
    let fid_col = raw.column_index(FID);
    Ok(raw
        .rows
        .iter()
        .map(|row| SampleKey {
            fid: row[fid_col.unwrap_or(iid_col)].clone(),
            iid: row[iid_col].clone(),
        })
        .collect())
}

fn key_columns(keys: &[SampleKey]) -> Vec<Column> {
    vec![
        Series::new(FID.into(), keys.iter().map(|key| key.fid.as_str()).collect::<Vec<_>>()).into(),
        Series::new(IID.into(), keys.iter().map(|key| key.iid.as_str()).collect::<Vec<_>>()).into(),
    ]
}

pub fn write_ids(path: &Path, keys: &[SampleKey]) -> Result<()> {
    let mut frame = DataFrame::new(key_columns(keys))?;
    write_frame(path, &mut frame)
}

/// Numeric table: `FID`, `IID`, then Float64 value columns. Missing values are nulls in the
/// frame and NaN once converted to an ndarray.
#[derive(Clone, Debug)]
pub struct Table {
    frame: DataFrame,
}

impl Table {
    pub fn new(keys: Vec<SampleKey>, columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != keys.len() || values.ncols() != columns.len() {
            return Err(SplitError::Configuration(format!(
                "table shape {}x{} does not match {} keys and {} columns",
                values.nrows(),
                values.ncols(),
                keys.len(),
                columns.len()
            )));
        }
        let mut frame_columns = key_columns(&keys);
        frame_columns.extend(value_columns(&columns, &values));
        Ok(Self {
            frame: DataFrame::new(frame_columns)?,
        })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn nrows(&self) -> usize {
        self.frame.height()
    }

    /// Value column names, in order.
    pub fn columns(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .filter(|name| name != FID && name != IID)
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns().iter().position(|c| c == name)
    }

    pub fn keys(&self) -> Result<Vec<SampleKey>> {
        let fid = self.frame.column(FID)?.str()?;
        let iid = self.frame.column(IID)?.str()?;
        Ok(fid
            .into_iter()
            .zip(iid)
            .map(|(fid, iid)| SampleKey {
                fid: fid.unwrap_or_default().to_string(),
                iid: iid.unwrap_or_default().to_string(),
            })
            .collect())
    }

    /// Value columns as an `n x m` array; nulls become NaN.
    pub fn values(&self) -> Result<Array2<f64>> {
        let columns = self.columns();
        if columns.is_empty() {
            return Ok(Array2::zeros((self.nrows(), 0)));
        }
        let values = self
            .frame
            .select(columns.iter().map(String::as_str))?
            .to_ndarray::<Float64Type>(IndexOrder::C)?;
        Ok(values)
    }

    /// Same keys and column names with new values. NaN is stored as null.
    pub fn with_values(&self, values: Array2<f64>) -> Result<Table> {
        let columns = self.columns();
        if values.nrows() != self.nrows() || values.ncols() != columns.len() {
            return Err(SplitError::Configuration(format!(
                "replacement values are {}x{}, table is {}x{}",
                values.nrows(),
                values.ncols(),
                self.nrows(),
                columns.len()
            )));
        }
        let mut frame_columns = vec![self.frame.column(FID)?.clone(), self.frame.column(IID)?.clone()];
        frame_columns.extend(value_columns(&columns, &values));
        Ok(Self {
            frame: DataFrame::new(frame_columns)?,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = read_string_frame(path)?;
        if !has_column(&raw, IID) {
            return Err(SplitError::parse(path, format!("missing required column '{}'", IID)));
        }
        let iid = raw.column(IID)?.clone();
        let fid = if has_column(&raw, FID) {
            raw.column(FID)?.clone()
        } else {
            iid.as_materialized_series().clone().with_name(FID.into()).into()
        };

        let mut frame_columns = vec![fid, iid];
        for column in raw.get_columns() {
            let name = column.name().as_str();
            if name == FID || name == IID {
                continue;
            }
            let casted = column
                .cast(&DataType::Float64)
                .map_err(|e| SplitError::table(path, e))?;
            if casted.null_count() > column.null_count() {
                return Err(SplitError::parse(path, format!("non-numeric value in column '{}'", name)));
            }
            frame_columns.push(casted);
        }
        Ok(Self {
            frame: DataFrame::new(frame_columns).map_err(|e| SplitError::table(path, e))?,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_frame(path, &mut self.frame.clone())
    }

    /// Keeps rows whose key is in `keys`, preserving this table's row order.
    pub fn restrict_to(&self, keys: &[SampleKey]) -> Result<Table> {
        let wanted = DataFrame::new(key_columns(keys))?;
        Ok(Self {
            frame: join_on_keys(&self.frame, &wanted)?,
        })
    }

    /// Inner join on (FID, IID). Row order follows `self`; columns are `self`'s then `other`'s.
    pub fn inner_join(&self, other: &Table) -> Result<Table> {
        Ok(Self {
            frame: join_on_keys(&self.frame, &other.frame)?,
        })
    }

    pub fn select(&self, columns: &[String]) -> Result<Table> {
        if let Some(missing) = columns.iter().find(|name| !has_column(&self.frame, name)) {
            return Err(SplitError::Configuration(format!("column '{}' not present in table", missing)));
        }
        let selection = [FID, IID].into_iter().chain(columns.iter().map(String::as_str));
        Ok(Self {
            frame: self.frame.select(selection)?,
        })
    }

    /// Replaces nulls with the mean of the observed cells of the same column.
    /// Columns with no observed value stay missing.
    pub fn fill_missing_with_column_mean(&self) -> Result<Table> {
        let columns = self.columns();
        if columns.is_empty() {
            return Ok(self.clone());
        }
        let filled = self
            .frame
            .select(columns.iter().map(String::as_str))?
            .fill_null(FillNullStrategy::Mean)?;
        for column in filled.get_columns() {
            if filled.height() > 0 && column.null_count() == filled.height() {
                warn!("Column '{}' has no observed values; leaving it missing.", column.name());
            }
        }
        let frame = self.frame.select([FID, IID])?.hstack(filled.get_columns())?;
        Ok(Self { frame })
    }
}

fn value_columns(names: &[String], values: &Array2<f64>) -> Vec<Column> {
    names
        .iter()
        .zip(values.columns())
        .map(|(name, column)| {
            let cells: Vec<Option<f64>> = column.iter().map(|v| (!v.is_nan()).then_some(*v)).collect();
            Series::new(name.as_str().into(), cells).into()
        })
        .collect()
}

/// Inner join on (FID, IID) keeping the left frame's row order.
fn join_on_keys(left: &DataFrame, right: &DataFrame) -> Result<DataFrame> {
    let joined = left
        .clone()
        .lazy()
        .with_row_index(ROW_ORDER, None)
        .join(
            right.clone().lazy(),
            [col(FID), col(IID)],
            [col(FID), col(IID)],
            JoinArgs::new(JoinType::Inner),
        )
        .sort([ROW_ORDER], SortMultipleOptions::default())
        .collect()?;
    Ok(joined.drop(ROW_ORDER)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    fn keys(ids: &[&str]) -> Vec<SampleKey> {
        ids.iter().map(|id| SampleKey::subject(*id)).collect()
    }

    #[test]
    fn read_normalizes_plink_headers_and_missing_values() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let path = dir.path().join("pcs.eigenvec");
        fs::write(&path, "#FID\tIID\tPC1\tPC2\n1\t1\t0.5\tNA\n2\t2\t-1.5\t3\n")
            .map_err(|e| SplitError::io(&path, e))?;
        let table = Table::read(&path)?;
        assert_eq!(table.columns(), vec!["PC1", "PC2"]);
        assert_eq!(table.keys()?, keys(&["1", "2"]));
        let values = table.values()?;
        assert!(values[[0, 1]].is_nan());
        assert_eq!(values[[1, 0]], -1.5);
        Ok(())
    }

    #[test]
    fn non_numeric_value_is_a_parse_error() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let path = dir.path().join("pheno.tsv");
        fs::write(&path, "FID\tIID\tage\n1\t1\tforty\n").map_err(|e| SplitError::io(&path, e))?;
        assert!(matches!(Table::read(&path), Err(SplitError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn iid_only_tables_reuse_iid_as_fid() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let path = dir.path().join("ids.id");
        fs::write(&path, "#IID\nA\nB\n").map_err(|e| SplitError::io(&path, e))?;
        assert_eq!(read_ids(&path)?, keys(&["A", "B"]));
        Ok(())
    }

    #[test]
    fn ids_round_trip_through_tab_separated_file() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let path = dir.path().join("nested").join("0.csv");
        let written = keys(&["10", "11", "12"]);
        write_ids(&path, &written)?;
        let text = fs::read_to_string(&path).map_err(|e| SplitError::io(&path, e))?;
        assert!(text.starts_with("FID\tIID\n10\t10\n"));
        assert_eq!(read_ids(&path)?, written);
        Ok(())
    }

    #[test]
    fn missing_values_are_written_as_na() -> Result<()> {
        let dir = tempdir().map_err(|e| SplitError::io("tempdir", e))?;
        let path = dir.path().join("cov.tsv");
        let table = Table::new(keys(&["a"]), vec!["age".into()], array![[f64::NAN]])?;
        table.write(&path)?;
        let text = fs::read_to_string(&path).map_err(|e| SplitError::io(&path, e))?;
        assert_eq!(text.lines().nth(1), Some("a\ta\tNA"));
        assert!(Table::read(&path)?.values()?[[0, 0]].is_nan());
        Ok(())
    }

    #[test]
    fn inner_join_keeps_left_order_and_drops_unmatched() -> Result<()> {
        let left = Table::new(keys(&["c", "a", "b"]), vec!["x".into()], array![[3.0], [1.0], [2.0]])?;
        let right = Table::new(keys(&["a", "c", "z"]), vec!["y".into()], array![[10.0], [30.0], [99.0]])?;
        let joined = left.inner_join(&right)?;
        assert_eq!(joined.keys()?, keys(&["c", "a"]));
        assert_eq!(joined.columns(), vec!["x", "y"]);
        assert_eq!(joined.values()?, array![[3.0, 30.0], [1.0, 10.0]]);
        Ok(())
    }

    #[test]
    fn restrict_to_is_an_inner_join_on_identifiers() -> Result<()> {
        let table = Table::new(keys(&["a", "b", "c"]), vec!["x".into()], array![[1.0], [2.0], [3.0]])?;
        let restricted = table.restrict_to(&keys(&["c", "a", "missing"]))?;
        assert_eq!(restricted.keys()?, keys(&["a", "c"]));
        assert_eq!(restricted.values()?, array![[1.0], [3.0]]);
        Ok(())
    }

    #[test]
    fn select_rejects_unknown_columns() -> Result<()> {
        let table = Table::new(keys(&["a"]), vec!["x".into(), "y".into()], array![[1.0, 2.0]])?;
        assert_eq!(table.select(&["y".to_string()])?.columns(), vec!["y"]);
        assert!(matches!(table.select(&["z".to_string()]), Err(SplitError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn mean_imputation_uses_own_rows() -> Result<()> {
        let table = Table::new(
            keys(&["a", "b", "c"]),
            vec!["age".into(), "empty".into()],
            array![[40.0, f64::NAN], [f64::NAN, f64::NAN], [60.0, f64::NAN]],
        )?;
        let filled = table.fill_missing_with_column_mean()?;
        let values = filled.values()?;
        assert_eq!(values[[1, 0]], 50.0);
        assert!(values.column(1).iter().all(|v| v.is_nan()));
        assert_eq!(filled.keys()?, keys(&["a", "b", "c"]));
        Ok(())
    }
}
