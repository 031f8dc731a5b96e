//! Dashboard charts rendered to SVG with Plotters

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};

use crate::dashboard::{CohortMean, DashboardView, HistogramBin, ScatterPoint};

const HISTOGRAM_SIZE: (u32, u32) = (800, 300);
const SCATTER_SIZE: (u32, u32) = (800, 400);
const HEATMAP_SIZE: (u32, u32) = (800, 120);

/// Viridis control points, low to high
const VIRIDIS: [(f64, (u8, u8, u8)); 5] = [
    (0.0, (68, 1, 84)),
    (0.25, (59, 82, 139)),
    (0.5, (33, 145, 140)),
    (0.75, (94, 201, 98)),
    (1.0, (253, 231, 37)),
];

/// Linear interpolation on the viridis scale, `t` clamped to [0, 1]
pub fn viridis(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    for pair in VIRIDIS.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = (t - t0) / (t1 - t0);
            let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
            return RGBColor(lerp(c0.0, c1.0), lerp(c0.1, c1.1), lerp(c0.2, c1.2));
        }
    }
    let (_, c) = VIRIDIS[VIRIDIS.len() - 1];
    RGBColor(c.0, c.1, c.2)
}

/// Binned churn probability histogram
pub fn render_histogram(bins: &[HistogramBin]) -> crate::Result<String> {
    let max_count = bins.iter().map(|b| b.count).max().unwrap_or(0).max(1) as f64;

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, HISTOGRAM_SIZE).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Predicted Churn Probability", ("sans-serif", 22))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(0f64..1f64, 0f64..(max_count * 1.1))?;

        chart
            .configure_mesh()
            .x_desc("Churn Probability")
            .y_desc("Count")
            .axis_desc_style(("sans-serif", 15))
            .draw()?;

        chart.draw_series(bins.iter().filter(|b| b.count > 0).map(|b| {
            Rectangle::new(
                [(b.start, 0.0), (b.end, b.count as f64)],
                BLUE.mix(0.7).filled(),
            )
        }))?;

        root.present()?;
    }
    Ok(svg)
}

/// Per-customer probabilities by cohort, anomalies highlighted
pub fn render_scatter(points: &[ScatterPoint]) -> crate::Result<String> {
    let cohorts: Vec<String> = points
        .iter()
        .map(|p| p.cohort.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let n = cohorts.len() as i32;
    let row_of = |cohort: &str| cohorts.iter().position(|c| c == cohort).unwrap_or(0) as i32;

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, SCATTER_SIZE).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Anomaly Flags by Cohort", ("sans-serif", 22))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(90)
            .build_cartesian_2d(0f64..1f64, -1i32..n.max(1))?;

        let label = |y: &i32| {
            usize::try_from(*y)
                .ok()
                .and_then(|i| cohorts.get(i).cloned())
                .unwrap_or_default()
        };
        chart
            .configure_mesh()
            .x_desc("Churn Probability")
            .y_desc("Join Cohort")
            .y_labels((n + 2) as usize)
            .y_label_formatter(&label)
            .axis_desc_style(("sans-serif", 15))
            .draw()?;

        chart
            .draw_series(
                points
                    .iter()
                    .filter(|p| !p.anomaly_flag)
                    .map(|p| Circle::new((p.pred_churn_proba, row_of(&p.cohort)), 4, BLUE.filled())),
            )?
            .label("Normal")
            .legend(|(x, y)| Circle::new((x, y), 4, BLUE.filled()));

        chart
            .draw_series(
                points
                    .iter()
                    .filter(|p| p.anomaly_flag)
                    .map(|p| Circle::new((p.pred_churn_proba, row_of(&p.cohort)), 4, RED.filled())),
            )?
            .label("Anomaly")
            .legend(|(x, y)| Circle::new((x, y), 4, RED.filled()));

        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;

        root.present()?;
    }
    Ok(svg)
}

/// One-row heatmap of the mean probability per cohort
pub fn render_heatmap(means: &[CohortMean]) -> crate::Result<String> {
    let n = means.len().max(1) as f64;

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, HEATMAP_SIZE).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Average Churn by Cohort", ("sans-serif", 22))
            .margin(10)
            .build_cartesian_2d(0f64..n, 0f64..1f64)?;

        chart.draw_series(means.iter().enumerate().map(|(i, m)| {
            Rectangle::new(
                [(i as f64, 0.0), (i as f64 + 1.0, 1.0)],
                viridis(m.mean_proba).filled(),
            )
        }))?;

        chart.draw_series(means.iter().enumerate().map(|(i, m)| {
            let color = if m.mean_proba < 0.6 { WHITE } else { BLACK };
            let style = ("sans-serif", 14)
                .into_font()
                .color(&color)
                .pos(Pos::new(HPos::Center, VPos::Center));
            Text::new(
                format!("{}: {:.1}%", m.cohort, m.mean_proba * 100.0),
                (i as f64 + 0.5, 0.5),
                style,
            )
        }))?;

        root.present()?;
    }
    Ok(svg)
}

/// Write the three charts and the view as JSON into `out_dir`
pub fn write_report(view: &DashboardView, out_dir: &Path) -> crate::Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory {}", out_dir.display()))?;

    let outputs = [
        ("histogram.svg", render_histogram(&view.histogram)?),
        ("scatter.svg", render_scatter(&view.scatter)?),
        ("heatmap.svg", render_heatmap(&view.heatmap)?),
        ("view.json", serde_json::to_string_pretty(view)?),
    ];

    let mut written = Vec::with_capacity(outputs.len());
    for (name, contents) in outputs {
        let path = out_dir.join(name);
        fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "chart written");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::{DashboardFilter, DashboardView};
    use crate::score::PredictionRecord;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn create_test_view() -> DashboardView {
        let records: Vec<PredictionRecord> = [(0.15, "2024-Q3"), (0.55, "2024-Q4"), (0.92, "2024-Q4")]
            .iter()
            .enumerate()
            .map(|(i, &(proba, cohort))| PredictionRecord {
                customer_id: format!("CUST{}", i + 1),
                pred_churn_proba: proba,
                anomaly_flag: proba > 0.8,
                cohort: cohort.to_string(),
                join_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            })
            .collect();
        DashboardView::compute(&records, &DashboardFilter::default())
    }

    #[test]
    fn test_viridis_endpoints() {
        assert_eq!(viridis(0.0), RGBColor(68, 1, 84));
        assert_eq!(viridis(1.0), RGBColor(253, 231, 37));
        assert_eq!(viridis(2.0), RGBColor(253, 231, 37));
        assert_eq!(viridis(f64::NAN), RGBColor(68, 1, 84));
    }

    #[test]
    fn test_render_histogram() {
        let view = create_test_view();
        let svg = render_histogram(&view.histogram).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Predicted Churn Probability"));
    }

    #[test]
    fn test_render_scatter() {
        let view = create_test_view();
        let svg = render_scatter(&view.scatter).unwrap();
        assert!(svg.contains("<circle"));
        assert!(svg.contains("2024-Q4"));
    }

    #[test]
    fn test_render_heatmap() {
        let view = create_test_view();
        let svg = render_heatmap(&view.heatmap).unwrap();
        assert!(svg.contains("2024-Q3"));
    }

    #[test]
    fn test_render_empty_view() {
        let view = DashboardView::compute(&[], &DashboardFilter::default());
        assert!(render_histogram(&view.histogram).is_ok());
        assert!(render_scatter(&view.scatter).is_ok());
        assert!(render_heatmap(&view.heatmap).is_ok());
    }

    #[test]
    fn test_write_report() {
        let view = create_test_view();
        let dir = tempdir().unwrap();
        let out_dir = dir.path().join("reports");

        let written = write_report(&view, &out_dir).unwrap();
        assert_eq!(written.len(), 4);
        for path in written {
            assert!(path.exists());
        }
    }
}
