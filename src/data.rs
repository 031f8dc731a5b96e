//! Feature table and label loading using Polars, plus the column scaler

use std::fs::{self, File};
use std::path::Path;

use anyhow::Context;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ChurnError, ChurnResult};

/// Numeric predictor columns, one row per customer
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    /// Column names in file order
    pub names: Vec<String>,
    /// Raw values as ndarray (n_rows, n_features)
    pub values: Array2<f64>,
}

impl FeatureTable {
    pub fn new(names: Vec<String>, values: Array2<f64>) -> ChurnResult<Self> {
        if names.len() != values.ncols() {
            return Err(ChurnError::ShapeMismatch {
                expected: names.len(),
                actual: values.ncols(),
            });
        }
        Ok(Self { names, values })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Reorder the columns to `expected`, failing if the column sets differ
    pub fn align_to(&self, expected: &[String]) -> ChurnResult<FeatureTable> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !self.names.contains(name))
            .cloned()
            .collect();
        let unexpected: Vec<String> = self
            .names
            .iter()
            .filter(|name| !expected.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ChurnError::SchemaMismatch {
                missing,
                unexpected,
            });
        }

        if self.names == expected {
            return Ok(self.clone());
        }

        let indices: Vec<usize> = expected
            .iter()
            .filter_map(|name| self.names.iter().position(|n| n == name))
            .collect();
        Ok(FeatureTable {
            names: expected.to_vec(),
            values: self.values.select(Axis(1), &indices),
        })
    }

    /// One Polars series per feature column
    pub(crate) fn to_series(&self) -> Vec<Series> {
        self.names
            .iter()
            .zip(self.values.columns())
            .map(|(name, column)| Series::new(name.as_str(), column.to_vec()))
            .collect()
    }
}

/// Per-feature standardization (zero mean, unit variance) fitted on training data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    /// Column means
    pub mean: Array1<f64>,
    /// Column population standard deviations, 1.0 for constant columns
    pub scale: Array1<f64>,
}

impl StandardScaler {
    /// Fit column means and standard deviations
    pub fn fit(records: &Array2<f64>) -> ChurnResult<Self> {
        let mean = records
            .mean_axis(Axis(0))
            .ok_or_else(|| ChurnError::invalid_parameter("records", "cannot fit a scaler on zero rows"))?;
        let scale = records
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s < 10.0 * f64::EPSILON { 1.0 } else { s });
        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, records: ArrayView2<f64>) -> ChurnResult<Array2<f64>> {
        self.check_width(records.ncols())?;
        Ok((&records - &self.mean) / &self.scale)
    }

    pub fn inverse_transform(&self, scaled: ArrayView2<f64>) -> ChurnResult<Array2<f64>> {
        self.check_width(scaled.ncols())?;
        Ok(&scaled * &self.scale + &self.mean)
    }

    fn check_width(&self, actual: usize) -> ChurnResult<()> {
        if actual != self.n_features() {
            return Err(ChurnError::ShapeMismatch {
                expected: self.n_features(),
                actual,
            });
        }
        Ok(())
    }
}

/// Read a CSV file into a DataFrame with full-file schema inference
pub fn read_csv(path: &Path) -> crate::Result<DataFrame> {
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }

    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(None)
        .finish()
        .and_then(|lf| lf.collect())
        .with_context(|| format!("Failed to read CSV {}", path.display()))?;

    Ok(df)
}

/// Write a DataFrame as CSV, creating the parent directory if needed
pub fn write_csv(df: &mut DataFrame, path: &Path) -> crate::Result<()> {
    ensure_parent_dir(path)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .with_context(|| format!("Failed to write CSV {}", path.display()))?;
    Ok(())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Load a table of numeric feature columns
///
/// # Arguments
/// * `path` - CSV file with a header row and one numeric column per feature
///
/// # Returns
/// * `FeatureTable` with columns in file order
pub fn load_feature_table(path: &Path) -> crate::Result<FeatureTable> {
    let df = read_csv(path)?;
    feature_table_from_frame(&df).with_context(|| format!("Invalid feature table {}", path.display()))
}

fn feature_table_from_frame(df: &DataFrame) -> crate::Result<FeatureTable> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    if names.is_empty() {
        anyhow::bail!("Feature table has no columns");
    }

    let mut values = Array2::<f64>::zeros((df.height(), names.len()));
    for (j, name) in names.iter().enumerate() {
        let column = float_column(df, name)?;
        for (i, value) in column.into_iter().enumerate() {
            values[[i, j]] = value;
        }
    }

    Ok(FeatureTable::new(names, values)?)
}

/// Extract a column as finite f64 values, naming the first bad cell on failure
pub(crate) fn float_column(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    series
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(i, value)| match value {
            Some(v) if v.is_finite() => Ok(v),
            _ => Err(anyhow::anyhow!(
                "Column '{}' has a missing or non-numeric value at row {}",
                name,
                i + 1
            )),
        })
        .collect()
}

/// Load a single-column 0/1 label file
pub fn load_labels(path: &Path) -> crate::Result<Array1<usize>> {
    let df = read_csv(path)?;
    let first = df
        .get_column_names()
        .first()
        .map(|name| name.to_string())
        .ok_or_else(|| anyhow::anyhow!("Label file {} has no columns", path.display()))?;

    let raw = float_column(&df, &first)
        .with_context(|| format!("Invalid label file {}", path.display()))?;
    let labels = parse_labels(&raw).with_context(|| format!("Invalid label file {}", path.display()))?;
    Ok(labels)
}

pub(crate) fn parse_labels(raw: &[f64]) -> ChurnResult<Array1<usize>> {
    raw.iter()
        .enumerate()
        .map(|(i, &value)| match value {
            v if v == 0.0 => Ok(0),
            v if v == 1.0 => Ok(1),
            v => Err(ChurnError::InvalidLabel { row: i + 1, value: v }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_feature_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "tenure,monthly_charges,support_calls").unwrap();
        writeln!(file, "12,70.5,1").unwrap();
        writeln!(file, "3,99.9,4").unwrap();
        writeln!(file, "48,20.0,0").unwrap();
        writeln!(file, "24,55.25,2").unwrap();
        file
    }

    #[test]
    fn test_load_feature_table() {
        let file = create_feature_csv();
        let table = load_feature_table(file.path()).unwrap();

        assert_eq!(table.names, vec!["tenure", "monthly_charges", "support_calls"]);
        assert_eq!(table.values.shape(), &[4, 3]);
        assert_eq!(table.values[[1, 1]], 99.9);
        assert_eq!(table.values[[2, 0]], 48.0);
    }

    #[test]
    fn test_non_numeric_cell_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "tenure,plan").unwrap();
        writeln!(file, "12,1").unwrap();
        writeln!(file, "3,gold").unwrap();

        let err = load_feature_table(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("plan"));
    }

    #[test]
    fn test_missing_file_fails_fast() {
        let result = load_feature_table(Path::new("does/not/exist.csv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_labels() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "churn").unwrap();
        for label in ["0", "1", "1.0", "0"] {
            writeln!(file, "{}", label).unwrap();
        }

        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels, array![0, 1, 1, 0]);
    }

    #[test]
    fn test_invalid_label_value() {
        let result = parse_labels(&[0.0, 2.0]);
        assert!(matches!(result, Err(ChurnError::InvalidLabel { row: 2, .. })));
    }

    #[test]
    fn test_scaler_zero_mean_unit_variance() {
        let records = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]];
        let scaler = StandardScaler::fit(&records).unwrap();
        let scaled = scaler.transform(records.view()).unwrap();

        for column in scaled.columns() {
            let mean = column.mean().unwrap();
            let std = column.std(0.0);
            assert!(mean.abs() < 1e-12);
            assert!((std - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_scaler_round_trip() {
        let records = array![[1.5, -3.0, 7.0], [2.5, 4.0, 7.0], [-0.5, 0.25, 7.0]];
        let scaler = StandardScaler::fit(&records).unwrap();

        let scaled = scaler.transform(records.view()).unwrap();
        let restored = scaler.inverse_transform(scaled.view()).unwrap();

        for (a, b) in records.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scaler_constant_column() {
        let records = array![[5.0, 1.0], [5.0, 2.0]];
        let scaler = StandardScaler::fit(&records).unwrap();
        assert_eq!(scaler.scale[0], 1.0);

        let scaled = scaler.transform(records.view()).unwrap();
        assert_eq!(scaled[[0, 0]], 0.0);
    }

    #[test]
    fn test_scaler_shape_mismatch() {
        let scaler = StandardScaler::fit(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let result = scaler.transform(array![[1.0, 2.0, 3.0]].view());
        assert!(matches!(
            result,
            Err(ChurnError::ShapeMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_align_to_reorders_columns() {
        let table = FeatureTable::new(
            vec!["b".into(), "a".into()],
            array![[2.0, 1.0], [4.0, 3.0]],
        )
        .unwrap();
        let aligned = table.align_to(&["a".to_string(), "b".to_string()]).unwrap();

        assert_eq!(aligned.names, vec!["a", "b"]);
        assert_eq!(aligned.values, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_align_to_reports_schema_mismatch() {
        let table = FeatureTable::new(
            vec!["a".into(), "extra".into()],
            array![[1.0, 2.0]],
        )
        .unwrap();

        match table.align_to(&["a".to_string(), "b".to_string()]) {
            Err(ChurnError::SchemaMismatch { missing, unexpected }) => {
                assert_eq!(missing, vec!["b"]);
                assert_eq!(unexpected, vec!["extra"]);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }
}
