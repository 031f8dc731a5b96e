//! Typed stage configuration and the default on-disk layout

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::model::GridSearch;

/// Default file layout shared by the stages, relative to a project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a path against the root unless it is already absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn features_dir(&self) -> PathBuf {
        self.root.join("data").join("features")
    }

    pub fn bundle(&self) -> PathBuf {
        self.root.join("models").join("churn_bundle.json")
    }

    pub fn evaluation_dir(&self) -> PathBuf {
        self.root.join("data").join("evaluation")
    }

    pub fn predictions(&self) -> PathBuf {
        self.root.join("data").join("predictions").join("predictions.csv")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Inputs, outputs and search settings for the trainer
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub x_train: PathBuf,
    pub y_train: PathBuf,
    pub x_test: PathBuf,
    pub y_test: PathBuf,
    pub bundle: PathBuf,
    pub evaluation: PathBuf,
    pub metrics: PathBuf,
    pub search: GridSearch,
}

impl TrainConfig {
    pub fn from_layout(layout: &Layout) -> Self {
        let features = layout.features_dir();
        let evaluation = layout.evaluation_dir();
        Self {
            x_train: features.join("X_train.csv"),
            y_train: features.join("y_train.csv"),
            x_test: features.join("X_test.csv"),
            y_test: features.join("y_test.csv"),
            bundle: layout.bundle(),
            evaluation: evaluation.join("test_predictions.csv"),
            metrics: evaluation.join("metrics.json"),
            search: GridSearch::default(),
        }
    }
}

/// Synthetic demo metadata attached by the batch scorer
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataConfig {
    /// Probabilities strictly above this are flagged
    pub anomaly_threshold: f64,
    /// Constant cohort label
    pub cohort: String,
    pub id_prefix: String,
    /// Join date of the last row; earlier rows step back one day each
    pub end_date: NaiveDate,
}

impl MetadataConfig {
    pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 0.8;
    pub const DEFAULT_COHORT: &'static str = "2024-Q4";

    pub fn ending_on(end_date: NaiveDate) -> Self {
        Self {
            anomaly_threshold: Self::DEFAULT_ANOMALY_THRESHOLD,
            cohort: Self::DEFAULT_COHORT.to_string(),
            id_prefix: "CUST".to_string(),
            end_date,
        }
    }
}

/// Inputs and outputs for the batch scorer
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    pub bundle: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub metadata: MetadataConfig,
}

impl ScoreConfig {
    pub fn from_layout(layout: &Layout, end_date: NaiveDate) -> Self {
        Self {
            bundle: layout.bundle(),
            input: layout.features_dir().join("X_test.csv"),
            output: layout.predictions(),
            metadata: MetadataConfig::ending_on(end_date),
        }
    }
}

/// Dashboard server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub predictions: PathBuf,
    pub addr: SocketAddr,
}
