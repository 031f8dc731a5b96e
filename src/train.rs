//! Trainer stage: scale, grid-search the classifier, persist the bundle and
//! the evaluation outputs

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::Context;
use linfa::Dataset;
use ndarray::Array1;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::data::{self, ensure_parent_dir, FeatureTable, StandardScaler};
use crate::error::ChurnError;
use crate::metrics::{roc_auc, threshold_metrics, ThresholdMetrics};
use crate::model::{CvReport, GridSearch, ModelBundle};

/// Test-split predictions of the trained model
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationTable {
    pub y_true: Array1<usize>,
    pub y_pred: Array1<usize>,
    pub y_proba: Array1<f64>,
}

impl EvaluationTable {
    pub fn write(&self, path: &Path) -> crate::Result<()> {
        let to_i64 = |values: &Array1<usize>| values.iter().map(|&v| v as i64).collect::<Vec<_>>();
        let mut df = DataFrame::new(vec![
            Series::new("y_true", to_i64(&self.y_true)),
            Series::new("y_pred", to_i64(&self.y_pred)),
            Series::new("y_proba", self.y_proba.to_vec()),
        ])?;
        data::write_csv(&mut df, path)
    }
}

/// Test-split metrics written next to the evaluation table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub roc_auc: f64,
    #[serde(flatten)]
    pub threshold: ThresholdMetrics,
    pub n_train: usize,
    pub n_test: usize,
    pub cv: CvReport,
}

/// Everything the trainer produces
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub bundle: ModelBundle,
    pub evaluation: EvaluationTable,
    pub metrics: TrainingMetrics,
}

fn check_alignment(table: &FeatureTable, labels: &Array1<usize>) -> Result<(), ChurnError> {
    if table.nrows() != labels.len() {
        return Err(ChurnError::LabelMismatch {
            rows: table.nrows(),
            labels: labels.len(),
        });
    }
    Ok(())
}

/// Fit the scaler and classifier on the training split and evaluate on the test split
///
/// # Arguments
/// * `train` / `y_train` - Training features and aligned 0/1 labels
/// * `test` / `y_test` - Test features (same columns, same order) and labels
/// * `search` - Grid and fold settings
///
/// # Returns
/// * The bundle with the evaluation table and metrics
pub fn train_model(
    train: &FeatureTable,
    y_train: &Array1<usize>,
    test: &FeatureTable,
    y_test: &Array1<usize>,
    search: &GridSearch,
) -> crate::Result<TrainingOutcome> {
    check_alignment(train, y_train).context("Training split is misaligned")?;
    check_alignment(test, y_test).context("Test split is misaligned")?;
    if test.names != train.names {
        // test columns must be the training columns in the training order
        let aligned = test.align_to(&train.names)?;
        if aligned.names != test.names {
            anyhow::bail!(
                "Test feature columns {:?} are not in training order {:?}",
                test.names,
                train.names
            );
        }
    }

    let scaler = StandardScaler::fit(&train.values)?;
    let train_scaled = scaler.transform(train.values.view())?;
    let test_scaled = scaler.transform(test.values.view())?;
    tracing::debug!(
        rows = train.nrows(),
        features = train.ncols(),
        "scaler fitted on training split"
    );

    let dataset = Dataset::new(train_scaled, y_train.clone());
    let (classifier, cv) = search.fit(&dataset)?;
    for candidate in &cv.candidates {
        tracing::info!(
            c = candidate.c,
            mean_roc_auc = candidate.mean_score,
            "cross-validation"
        );
    }
    tracing::info!(best_c = cv.best_c, iterations = classifier.n_iter, "selected model");

    let y_proba = classifier.predict_proba(test_scaled.view())?;
    let y_pred = classifier.predict(test_scaled.view())?;
    let auc = roc_auc(&y_test.to_vec(), &y_proba.to_vec()).context("Cannot score the test split")?;
    let threshold = threshold_metrics(&y_test.to_vec(), &y_pred.to_vec());

    let metrics = TrainingMetrics {
        roc_auc: auc,
        threshold,
        n_train: train.nrows(),
        n_test: test.nrows(),
        cv: cv.clone(),
    };
    let bundle = ModelBundle::new(train.names.clone(), scaler, classifier, cv)?;
    let evaluation = EvaluationTable {
        y_true: y_test.clone(),
        y_pred,
        y_proba,
    };

    Ok(TrainingOutcome {
        bundle,
        evaluation,
        metrics,
    })
}

/// Load the four input tables, train, and persist every artifact
pub fn run_training(config: &TrainConfig) -> crate::Result<TrainingOutcome> {
    let train = data::load_feature_table(&config.x_train)?;
    let y_train = data::load_labels(&config.y_train)?;
    let test = data::load_feature_table(&config.x_test)?;
    let y_test = data::load_labels(&config.y_test)?;
    tracing::info!(
        train_rows = train.nrows(),
        test_rows = test.nrows(),
        features = train.ncols(),
        "loaded training data"
    );

    let outcome = train_model(&train, &y_train, &test, &y_test, &config.search)?;

    outcome.bundle.save(&config.bundle)?;
    tracing::info!(path = %config.bundle.display(), "model bundle written");

    outcome.evaluation.write(&config.evaluation)?;
    tracing::info!(path = %config.evaluation.display(), "evaluation predictions written");

    write_metrics(&outcome.metrics, &config.metrics)?;
    tracing::debug!(path = %config.metrics.display(), "metrics written");

    Ok(outcome)
}

fn write_metrics(metrics: &TrainingMetrics, path: &Path) -> crate::Result<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), metrics)
        .with_context(|| format!("Failed to write metrics {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn table(names: &[&str], values: Array2<f64>) -> FeatureTable {
        FeatureTable::new(names.iter().map(|n| n.to_string()).collect(), values).unwrap()
    }

    fn training_split() -> (FeatureTable, Array1<usize>) {
        let mut values = Vec::new();
        let mut labels = Vec::new();
        for i in 0..30 {
            let tenure = (i * 7 % 40) as f64;
            let calls = (i % 5) as f64;
            values.extend_from_slice(&[tenure, calls]);
            labels.push(usize::from(tenure < 15.0 || calls >= 4.0));
        }
        (
            table(&["tenure", "support_calls"], Array2::from_shape_vec((30, 2), values).unwrap()),
            Array1::from(labels),
        )
    }

    #[test]
    fn test_train_model() {
        let (train, y_train) = training_split();
        let test = table(
            &["tenure", "support_calls"],
            array![[2.0, 4.0], [35.0, 0.0], [5.0, 3.0], [30.0, 1.0]],
        );
        let y_test = array![1, 0, 1, 0];

        let outcome = train_model(&train, &y_train, &test, &y_test, &GridSearch::default()).unwrap();

        assert_eq!(outcome.evaluation.y_proba.len(), 4);
        assert!(outcome.evaluation.y_proba.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(outcome.metrics.n_train, 30);
        assert_eq!(outcome.bundle.feature_names, vec!["tenure", "support_calls"]);
        assert!(outcome.metrics.roc_auc > 0.5);
    }

    #[test]
    fn test_scaler_is_fit_on_training_split_only() {
        let mut values = Vec::new();
        let mut labels = Vec::new();
        for i in 0..40 {
            values.extend_from_slice(&[i as f64, (i % 11) as f64]);
            labels.push(usize::from(i % 4 == 0 || i < 8));
        }
        let train = table(&["a", "b"], Array2::from_shape_vec((40, 2), values).unwrap());
        let y_train = Array1::from(labels);
        // far outside the training range, so any leakage moves the statistics
        let test = table(&["a", "b"], array![[100.0, 50.0], [200.0, 60.0], [300.0, 70.0]]);
        let y_test = array![1, 0, 1];

        let outcome = train_model(&train, &y_train, &test, &y_test, &GridSearch::default()).unwrap();
        let scaler = &outcome.bundle.scaler;

        let b: Vec<f64> = (0..40).map(|i| (i % 11) as f64).collect();
        let b_mean = b.iter().sum::<f64>() / 40.0;
        let b_std = (b.iter().map(|v| (v - b_mean).powi(2)).sum::<f64>() / 40.0).sqrt();

        assert!((scaler.mean[0] - 19.5).abs() < 1e-12);
        assert!((scaler.mean[1] - b_mean).abs() < 1e-12);
        // population std of 0..39 is sqrt((40^2 - 1) / 12)
        assert!((scaler.scale[0] - (1599.0_f64 / 12.0).sqrt()).abs() < 1e-9);
        assert!((scaler.scale[1] - b_std).abs() < 1e-9);
    }

    #[test]
    fn test_misaligned_labels() {
        let (train, _) = training_split();
        let short = Array1::from(vec![0usize, 1, 0]);
        let result = train_model(&train, &short, &train, &short, &GridSearch::default());

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Label count mismatch"));
    }

    #[test]
    fn test_test_columns_must_match_training() {
        let (train, y_train) = training_split();
        let test = table(&["support_calls", "tenure"], array![[1.0, 2.0], [0.0, 30.0]]);
        let y_test = array![1, 0];

        let result = train_model(&train, &y_train, &test, &y_test, &GridSearch::default());
        assert!(result.is_err());
    }
}
