//! ChurnLens: churn classifier training, batch scoring and an interactive dashboard
//!
//! The trainer fits a standard scaler and a class-balanced logistic regression
//! chosen by cross-validated ROC-AUC, the scorer applies the persisted bundle to
//! a feature table, and the dashboard filters and charts the scored customers.

pub mod cli;
pub mod config;
pub mod dashboard;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod score;
pub mod server;
pub mod train;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::{Layout, MetadataConfig, ScoreConfig, ServerConfig, TrainConfig};
pub use dashboard::{Dashboard, DashboardFilter, DashboardView, Summary};
pub use data::{load_feature_table, load_labels, FeatureTable, StandardScaler};
pub use error::ChurnError;
pub use model::{ChurnClassifier, GridSearch, LogisticParams, ModelBundle};
pub use score::{run_scoring, score_table, PredictionRecord, PredictionTable};
pub use train::{run_training, train_model, TrainingOutcome};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
