//! Batch scorer: apply the persisted bundle to a feature table and attach
//! the synthetic demo metadata

use std::path::Path;

use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{MetadataConfig, ScoreConfig};
use crate::data::{self, FeatureTable};
use crate::error::ChurnError;
use crate::model::ModelBundle;

/// Date format used for `join_date`
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Scored customer row without its feature values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub customer_id: String,
    pub pred_churn_proba: f64,
    pub anomaly_flag: bool,
    pub cohort: String,
    pub join_date: NaiveDate,
}

/// Scored feature table ready to be written
#[derive(Debug, Clone)]
pub struct PredictionTable {
    /// Features in training order
    pub features: FeatureTable,
    pub records: Vec<PredictionRecord>,
}

impl PredictionTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_dataframe(&self) -> crate::Result<DataFrame> {
        let mut columns = self.features.to_series();
        columns.push(Series::new(
            "customer_id",
            self.records
                .iter()
                .map(|r| r.customer_id.clone())
                .collect::<Vec<_>>(),
        ));
        columns.push(Series::new(
            "pred_churn_proba",
            self.records.iter().map(|r| r.pred_churn_proba).collect::<Vec<_>>(),
        ));
        columns.push(Series::new(
            "anomaly_flag",
            self.records
                .iter()
                .map(|r| i32::from(r.anomaly_flag))
                .collect::<Vec<_>>(),
        ));
        columns.push(Series::new(
            "cohort",
            self.records.iter().map(|r| r.cohort.clone()).collect::<Vec<_>>(),
        ));
        columns.push(Series::new(
            "join_date",
            self.records
                .iter()
                .map(|r| r.join_date.format(DATE_FORMAT).to_string())
                .collect::<Vec<_>>(),
        ));
        Ok(DataFrame::new(columns)?)
    }

    pub fn write(&self, path: &Path) -> crate::Result<()> {
        let mut df = self.to_dataframe()?;
        data::write_csv(&mut df, path)
    }
}

/// Columns appended by the scorer; input features may not use these names
pub const OUTPUT_COLUMNS: [&str; 5] = [
    "customer_id",
    "pred_churn_proba",
    "anomaly_flag",
    "cohort",
    "join_date",
];

/// Deterministic anomaly rule on a churn probability
pub fn is_anomaly(proba: f64, threshold: f64) -> bool {
    proba > threshold
}

/// Daily join dates ending on `end`, one per row, ascending
pub fn join_dates(end: NaiveDate, rows: usize) -> Vec<NaiveDate> {
    (0..rows)
        .map(|i| end - Duration::days((rows - 1 - i) as i64))
        .collect()
}

/// Score a feature table with the bundle and attach demo metadata
///
/// # Arguments
/// * `bundle` - Scaler and classifier trained together
/// * `table` - Raw features; columns are validated and reordered to training order
/// * `metadata` - Threshold, cohort label, id prefix and last join date
///
/// # Returns
/// * One prediction record per input row
pub fn score_table(
    bundle: &ModelBundle,
    table: &FeatureTable,
    metadata: &MetadataConfig,
) -> crate::Result<PredictionTable> {
    if let Some(name) = table
        .names
        .iter()
        .find(|name| OUTPUT_COLUMNS.contains(&name.as_str()))
    {
        return Err(ChurnError::ReservedColumn { name: name.clone() }.into());
    }

    let features = table.align_to(&bundle.feature_names)?;
    if features.names != table.names {
        tracing::debug!("reordered input columns to training order");
    }

    let probabilities = bundle.predict_proba(features.values.view())?;
    let dates = join_dates(metadata.end_date, features.nrows());

    let records = probabilities
        .iter()
        .zip(dates)
        .enumerate()
        .map(|(i, (&proba, join_date))| PredictionRecord {
            customer_id: format!("{}{}", metadata.id_prefix, i + 1),
            pred_churn_proba: proba,
            anomaly_flag: is_anomaly(proba, metadata.anomaly_threshold),
            cohort: metadata.cohort.clone(),
            join_date,
        })
        .collect();

    Ok(PredictionTable { features, records })
}

/// Load the bundle and input table, score, and write the predictions file
pub fn run_scoring(config: &ScoreConfig) -> crate::Result<PredictionTable> {
    let bundle = ModelBundle::load(&config.bundle)?;
    tracing::debug!(
        features = bundle.feature_names.len(),
        c = bundle.classifier.c,
        trained_at = %bundle.created_at,
        "model bundle loaded"
    );

    let table = data::load_feature_table(&config.input)?;
    let predictions = score_table(&bundle, &table, &config.metadata)?;

    let flagged = predictions.records.iter().filter(|r| r.anomaly_flag).count();
    tracing::info!(rows = predictions.len(), flagged, "scored feature table");

    predictions.write(&config.output)?;
    tracing::info!(path = %config.output.display(), "predictions written");

    Ok(predictions)
}
