//! ChurnLens: churn model training, batch scoring and dashboard CLI
//!
//! This is the main entrypoint that dispatches the pipeline stages.

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use churnlens::cli::{Command, DashboardArgs, ReportArgs, ScoreArgs, TrainArgs};
use churnlens::metrics::round3;
use churnlens::{run_scoring, run_training, server, viz, Args, Dashboard, Layout};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let layout = args.layout();
    match &args.command {
        Command::Train(train) => run_train(train, &layout),
        Command::Score(score) => run_score(score, &layout),
        Command::Dashboard(dashboard) => run_dashboard(dashboard, &layout),
        Command::Report(report) => run_report(report, &layout),
    }
}

/// `RUST_LOG` wins over the verbosity flag
fn init_tracing(verbose: bool) {
    let default = if verbose { "churnlens=debug" } else { "churnlens=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_train(args: &TrainArgs, layout: &Layout) -> Result<()> {
    let start_time = Instant::now();
    let config = args.to_config(layout);

    let outcome = run_training(&config)?;

    println!(
        "✔ Training complete – ROC-AUC: {}",
        round3(outcome.metrics.roc_auc)
    );
    println!("  Best C: {}", outcome.metrics.cv.best_c);
    println!(
        "  Accuracy: {:.3}  Precision: {:.3}  Recall: {:.3}  F1: {:.3}",
        outcome.metrics.threshold.accuracy,
        outcome.metrics.threshold.precision,
        outcome.metrics.threshold.recall,
        outcome.metrics.threshold.f1
    );
    println!("  Bundle saved to: {}", config.bundle.display());
    println!("  Processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn run_score(args: &ScoreArgs, layout: &Layout) -> Result<()> {
    let today = chrono::Local::now().date_naive();
    let config = args.to_config(layout, today)?;

    let predictions = run_scoring(&config)?;

    println!("✔ Predictions written: {}", config.output.display());
    println!(
        "  Rows: {}  Anomalies: {}",
        predictions.len(),
        predictions.records.iter().filter(|r| r.anomaly_flag).count()
    );
    Ok(())
}

fn run_dashboard(args: &DashboardArgs, layout: &Layout) -> Result<()> {
    let config = args.to_config(layout);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::serve(&config))
}

fn run_report(args: &ReportArgs, layout: &Layout) -> Result<()> {
    let dashboard = Dashboard::load(&args.predictions(layout))?;
    let filter = dashboard.normalize(args.filter());
    let view = dashboard.view(&filter);

    let written = viz::write_report(&view, &args.out_dir(layout))?;

    println!("✔ Report generated: {} customers selected", view.summary.total);
    println!(
        "  Avg churn probability: {}  Anomalies: {}",
        view.summary.mean_label(),
        view.summary.anomalies
    );
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}
