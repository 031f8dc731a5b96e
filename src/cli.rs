//! Command-line interface definitions and argument parsing

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::{Layout, MetadataConfig, ScoreConfig, ServerConfig, TrainConfig};
use crate::dashboard::DashboardFilter;
use crate::model::{GridSearch, DEFAULT_C_GRID};

/// Churn model training, batch scoring and dashboard
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Project root holding data/, models/ and reports/
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit the scaler and classifier, write the bundle and evaluation outputs
    Train(TrainArgs),
    /// Score a feature table and write the predictions file
    Score(ScoreArgs),
    /// Serve the interactive dashboard over the predictions file
    Dashboard(DashboardArgs),
    /// Render the dashboard charts for one filter state to files
    Report(ReportArgs),
}

#[derive(ClapArgs, Debug)]
pub struct TrainArgs {
    /// Training features (default: data/features/X_train.csv)
    #[arg(long)]
    pub x_train: Option<PathBuf>,

    /// Training labels (default: data/features/y_train.csv)
    #[arg(long)]
    pub y_train: Option<PathBuf>,

    /// Test features (default: data/features/X_test.csv)
    #[arg(long)]
    pub x_test: Option<PathBuf>,

    /// Test labels (default: data/features/y_test.csv)
    #[arg(long)]
    pub y_test: Option<PathBuf>,

    /// Model bundle output (default: models/churn_bundle.json)
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Test-split predictions output (default: data/evaluation/test_predictions.csv)
    #[arg(long)]
    pub evaluation: Option<PathBuf>,

    /// Metrics output (default: data/evaluation/metrics.json)
    #[arg(long)]
    pub metrics: Option<PathBuf>,

    /// Candidate inverse regularization strengths
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_C_GRID.to_vec())]
    pub grid: Vec<f64>,

    /// Number of stratified cross-validation folds
    #[arg(long, default_value = "5")]
    pub folds: usize,

    /// Maximum solver iterations per fit
    #[arg(long, default_value = "1000")]
    pub max_iter: usize,
}

#[derive(ClapArgs, Debug)]
pub struct ScoreArgs {
    /// Features to score (default: data/features/X_test.csv)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Model bundle (default: models/churn_bundle.json)
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Predictions output (default: data/predictions/predictions.csv)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Cohort label attached to every row
    #[arg(long, default_value = MetadataConfig::DEFAULT_COHORT)]
    pub cohort: String,

    /// Probabilities strictly above this are flagged as anomalies
    #[arg(long, default_value = "0.8")]
    pub anomaly_threshold: f64,

    /// Join date of the last row, YYYY-MM-DD (default: today)
    #[arg(long)]
    pub end_date: Option<NaiveDate>,
}

#[derive(ClapArgs, Debug)]
pub struct DashboardArgs {
    /// Predictions file (default: data/predictions/predictions.csv)
    #[arg(short, long)]
    pub predictions: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, default_value = "8501")]
    pub port: u16,
}

#[derive(ClapArgs, Debug)]
pub struct ReportArgs {
    /// Predictions file (default: data/predictions/predictions.csv)
    #[arg(short, long)]
    pub predictions: Option<PathBuf>,

    /// Output directory (default: reports/)
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,

    /// Restrict to these cohorts; repeat for several (default: all)
    #[arg(long = "cohort")]
    pub cohorts: Vec<String>,

    /// Minimum churn probability
    #[arg(long, default_value = "0.0")]
    pub min_proba: f64,
}

impl Args {
    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }
}

impl TrainArgs {
    pub fn to_config(&self, layout: &Layout) -> TrainConfig {
        let mut config = TrainConfig::from_layout(layout);
        override_path(layout, &mut config.x_train, &self.x_train);
        override_path(layout, &mut config.y_train, &self.y_train);
        override_path(layout, &mut config.x_test, &self.x_test);
        override_path(layout, &mut config.y_test, &self.y_test);
        override_path(layout, &mut config.bundle, &self.bundle);
        override_path(layout, &mut config.evaluation, &self.evaluation);
        override_path(layout, &mut config.metrics, &self.metrics);

        let defaults = GridSearch::default();
        config.search = GridSearch {
            grid: self.grid.clone(),
            folds: self.folds,
            base: defaults.base.with_max_iter(self.max_iter),
        };
        config
    }
}

impl ScoreArgs {
    /// `today` is used when no end date was given
    pub fn to_config(&self, layout: &Layout, today: NaiveDate) -> crate::Result<ScoreConfig> {
        if !(0.0..=1.0).contains(&self.anomaly_threshold) {
            anyhow::bail!(
                "Anomaly threshold must be within [0, 1], got {}",
                self.anomaly_threshold
            );
        }

        let mut config = ScoreConfig::from_layout(layout, self.end_date.unwrap_or(today));
        override_path(layout, &mut config.bundle, &self.bundle);
        override_path(layout, &mut config.input, &self.input);
        override_path(layout, &mut config.output, &self.output);
        config.metadata.cohort = self.cohort.clone();
        config.metadata.anomaly_threshold = self.anomaly_threshold;
        Ok(config)
    }
}

impl DashboardArgs {
    pub fn to_config(&self, layout: &Layout) -> ServerConfig {
        let mut predictions = layout.predictions();
        override_path(layout, &mut predictions, &self.predictions);
        ServerConfig {
            predictions,
            addr: SocketAddr::new(self.host, self.port),
        }
    }
}

impl ReportArgs {
    pub fn predictions(&self, layout: &Layout) -> PathBuf {
        let mut path = layout.predictions();
        override_path(layout, &mut path, &self.predictions);
        path
    }

    pub fn out_dir(&self, layout: &Layout) -> PathBuf {
        let mut path = layout.reports_dir();
        override_path(layout, &mut path, &self.out_dir);
        path
    }

    pub fn filter(&self) -> DashboardFilter {
        DashboardFilter {
            cohorts: if self.cohorts.is_empty() {
                None
            } else {
                Some(self.cohorts.iter().cloned().collect())
            },
            min_proba: self.min_proba,
        }
    }
}

fn override_path(layout: &Layout, target: &mut PathBuf, value: &Option<PathBuf>) {
    if let Some(path) = value {
        *target = layout.resolve(path);
    }
}
