//! Dashboard computations: load the predictions once, filter, and derive the
//! summary and chart data as pure functions of (table, filter)

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{float_column, read_csv};
use crate::score::{PredictionRecord, DATE_FORMAT};

/// Number of equal-width histogram bins over [0, 1]
pub const HISTOGRAM_BINS: usize = 30;

/// Slider step for the minimum probability filter
pub const PROBABILITY_STEP: f64 = 0.01;

/// User-selected filters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DashboardFilter {
    /// Selected cohorts; `None` selects every cohort
    pub cohorts: Option<BTreeSet<String>>,
    /// Keep rows with probability at or above this value
    pub min_proba: f64,
}

impl DashboardFilter {
    pub fn matches(&self, record: &PredictionRecord) -> bool {
        let cohort_selected = self
            .cohorts
            .as_ref()
            .map_or(true, |selected| selected.contains(&record.cohort));
        cohort_selected && record.pred_churn_proba >= self.min_proba
    }

    pub fn apply(&self, records: &[PredictionRecord]) -> Vec<PredictionRecord> {
        records.iter().filter(|r| self.matches(r)).cloned().collect()
    }
}

/// KPI cards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Mean churn probability, absent for an empty selection
    pub mean_proba: Option<f64>,
    pub anomalies: usize,
    pub total: usize,
}

impl Summary {
    pub fn from_records(records: &[PredictionRecord]) -> Self {
        let total = records.len();
        let mean_proba = if total == 0 {
            None
        } else {
            Some(records.iter().map(|r| r.pred_churn_proba).sum::<f64>() / total as f64)
        };
        Self {
            mean_proba,
            anomalies: records.iter().filter(|r| r.anomaly_flag).count(),
            total,
        }
    }

    /// Mean probability as a percentage with two decimals
    pub fn mean_label(&self) -> String {
        self.mean_proba
            .map(format_percent)
            .unwrap_or_else(|| "n/a".to_string())
    }
}

pub fn format_percent(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub start: f64,
    pub end: f64,
    pub count: usize,
}

/// Equal-width bins over [0, 1]; the last bin is closed on both ends
pub fn histogram(records: &[PredictionRecord], bins: usize) -> Vec<HistogramBin> {
    let bins = bins.max(1);
    let width = 1.0 / bins as f64;
    let mut counts = vec![0usize; bins];
    for record in records {
        let p = record.pred_churn_proba.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            start: i as f64 * width,
            end: (i + 1) as f64 * width,
            count,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterPoint {
    pub customer_id: String,
    pub pred_churn_proba: f64,
    pub cohort: String,
    pub anomaly_flag: bool,
}

pub fn scatter(records: &[PredictionRecord]) -> Vec<ScatterPoint> {
    records
        .iter()
        .map(|r| ScatterPoint {
            customer_id: r.customer_id.clone(),
            pred_churn_proba: r.pred_churn_proba,
            cohort: r.cohort.clone(),
            anomaly_flag: r.anomaly_flag,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMean {
    pub cohort: String,
    pub mean_proba: f64,
    pub count: usize,
}

/// Mean probability per cohort, ordered by cohort label
pub fn cohort_means(records: &[PredictionRecord]) -> Vec<CohortMean> {
    let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(record.cohort.as_str()).or_insert((0.0, 0));
        entry.0 += record.pred_churn_proba;
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|(cohort, (sum, count))| CohortMean {
            cohort: cohort.to_string(),
            mean_proba: sum / count as f64,
            count,
        })
        .collect()
}

/// Everything rendered for one filter state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardView {
    pub filter: DashboardFilter,
    pub summary: Summary,
    pub histogram: Vec<HistogramBin>,
    pub scatter: Vec<ScatterPoint>,
    pub heatmap: Vec<CohortMean>,
}

impl DashboardView {
    pub fn compute(records: &[PredictionRecord], filter: &DashboardFilter) -> Self {
        let selected = filter.apply(records);
        Self {
            filter: filter.clone(),
            summary: Summary::from_records(&selected),
            histogram: histogram(&selected, HISTOGRAM_BINS),
            scatter: scatter(&selected),
            heatmap: cohort_means(&selected),
        }
    }
}

/// Predictions loaded once and shared read-only between requests
#[derive(Debug, Clone)]
pub struct Dashboard {
    records: Arc<Vec<PredictionRecord>>,
    cohorts: Vec<String>,
    max_proba: f64,
}

impl Dashboard {
    pub fn new(records: Vec<PredictionRecord>) -> Self {
        let cohorts: BTreeSet<String> = records.iter().map(|r| r.cohort.clone()).collect();
        let max_proba = records
            .iter()
            .map(|r| r.pred_churn_proba)
            .fold(0.0, f64::max);
        Self {
            records: Arc::new(records),
            cohorts: cohorts.into_iter().collect(),
            max_proba,
        }
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let records = load_predictions(path)?;
        tracing::info!(rows = records.len(), path = %path.display(), "predictions loaded");
        Ok(Self::new(records))
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    /// Sorted distinct cohorts offered by the multi-select
    pub fn cohorts(&self) -> &[String] {
        &self.cohorts
    }

    /// Upper bound of the probability slider
    pub fn max_proba(&self) -> f64 {
        self.max_proba
    }

    /// Clamp the filter to the slider range
    pub fn normalize(&self, mut filter: DashboardFilter) -> DashboardFilter {
        filter.min_proba = filter.min_proba.clamp(0.0, self.max_proba);
        filter
    }

    pub fn view(&self, filter: &DashboardFilter) -> DashboardView {
        DashboardView::compute(&self.records, filter)
    }
}

/// Read the predictions artifact written by the batch scorer
pub fn load_predictions(path: &Path) -> crate::Result<Vec<PredictionRecord>> {
    let df = read_csv(path)?;
    records_from_frame(&df).with_context(|| format!("Invalid predictions file {}", path.display()))
}

fn string_column(df: &DataFrame, name: &str) -> crate::Result<Vec<String>> {
    let series = df.column(name)?.cast(&DataType::String)?;
    series
        .str()?
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            value
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Column '{}' is empty at row {}", name, i + 1))
        })
        .collect()
}

fn records_from_frame(df: &DataFrame) -> crate::Result<Vec<PredictionRecord>> {
    let ids = string_column(df, "customer_id")?;
    let probabilities = float_column(df, "pred_churn_proba")?;
    let flags = float_column(df, "anomaly_flag")?;
    let cohorts = string_column(df, "cohort")?;
    let dates = string_column(df, "join_date")?;

    ids.into_iter()
        .zip(probabilities)
        .zip(flags)
        .zip(cohorts)
        .zip(dates)
        .enumerate()
        .map(|(i, ((((customer_id, proba), flag), cohort), date))| -> crate::Result<_> {
            if !(0.0..=1.0).contains(&proba) {
                anyhow::bail!("Probability {} at row {} is outside [0, 1]", proba, i + 1);
            }
            // tolerate timestamps by keeping the date part
            let day = date.get(..10).unwrap_or(&date);
            let join_date = NaiveDate::parse_from_str(day, DATE_FORMAT)
                .with_context(|| format!("Invalid join_date '{}' at row {}", date, i + 1))?;
            Ok(PredictionRecord {
                customer_id,
                pred_churn_proba: proba,
                anomaly_flag: flag != 0.0,
                cohort,
                join_date,
            })
        })
        .collect()
}
