//! HTTP dashboard: filter form, KPI cards and inline SVG charts served over
//! the predictions loaded at startup

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::dashboard::{Dashboard, DashboardFilter, DashboardView, PROBABILITY_STEP};
use crate::error::ChurnError;
use crate::viz;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    dashboard: Arc<Dashboard>,
}

/// Error response with a JSON body
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ChurnError> for AppError {
    fn from(err: ChurnError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

/// Build a filter from query pairs.
///
/// `cohort` may repeat. Any `cohort` key, or the form marker `filtered`,
/// makes the cohort selection explicit, so submitting the form with every
/// box unchecked selects nothing.
pub fn parse_filter(pairs: &[(String, String)]) -> Result<DashboardFilter, ChurnError> {
    let mut cohorts = BTreeSet::new();
    let mut explicit = false;
    let mut min_proba = 0.0;

    for (key, value) in pairs {
        match key.as_str() {
            "cohort" => {
                explicit = true;
                cohorts.insert(value.clone());
            }
            "filtered" => explicit = true,
            "min_proba" => {
                min_proba = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| {
                        ChurnError::invalid_parameter("min_proba", format!("not a number: {}", value))
                    })?;
            }
            _ => {}
        }
    }

    Ok(DashboardFilter {
        cohorts: explicit.then_some(cohorts),
        min_proba,
    })
}

fn current_view(state: &AppState, pairs: &[(String, String)]) -> Result<DashboardView, AppError> {
    let filter = state.dashboard.normalize(parse_filter(pairs)?);
    Ok(state.dashboard.view(&filter))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
        "rows": state.dashboard.records().len(),
    }))
}

async fn view_json(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<DashboardView>, AppError> {
    Ok(Json(current_view(&state, &pairs)?))
}

async fn chart(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    let view = current_view(&state, &pairs)?;
    let svg = match name.as_str() {
        "histogram.svg" => viz::render_histogram(&view.histogram)?,
        "scatter.svg" => viz::render_scatter(&view.scatter)?,
        "heatmap.svg" => viz::render_heatmap(&view.heatmap)?,
        _ => {
            return Err(AppError {
                status: StatusCode::NOT_FOUND,
                message: format!("unknown chart '{}'", name),
            })
        }
    };
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
}

async fn index(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Html<String>, AppError> {
    let view = current_view(&state, &pairs)?;
    Ok(Html(render_page(&state.dashboard, &view)?))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn render_page(dashboard: &Dashboard, view: &DashboardView) -> crate::Result<String> {
    let mut html = String::new();
    writeln!(html, "<!DOCTYPE html><html><head><meta charset=\"utf-8\">")?;
    writeln!(html, "<title>ChurnLens Dashboard</title>")?;
    writeln!(
        html,
        "<style>body{{font-family:sans-serif;margin:0;display:flex}}\
         aside{{width:240px;padding:16px;background:#f0f2f6;min-height:100vh}}\
         main{{flex:1;padding:16px}}.cards{{display:flex;gap:16px}}\
         .card{{flex:1;padding:12px;border:1px solid #ddd;border-radius:6px}}\
         .card b{{display:block;font-size:28px}}</style></head><body>"
    )?;

    writeln!(html, "<aside><h2>Filters</h2><form method=\"get\" action=\"/\">")?;
    writeln!(html, "<input type=\"hidden\" name=\"filtered\" value=\"1\">")?;
    writeln!(html, "<p>Select Cohorts</p>")?;
    for cohort in dashboard.cohorts() {
        let checked = view
            .filter
            .cohorts
            .as_ref()
            .map_or(true, |selected| selected.contains(cohort));
        writeln!(
            html,
            "<label><input type=\"checkbox\" name=\"cohort\" value=\"{0}\"{1}> {0}</label><br>",
            escape_html(cohort),
            if checked { " checked" } else { "" }
        )?;
    }
    writeln!(
        html,
        "<p>Min Churn Probability: {:.2}</p>\
         <input type=\"range\" name=\"min_proba\" min=\"0\" max=\"{}\" step=\"{}\" value=\"{}\">",
        view.filter.min_proba,
        dashboard.max_proba(),
        PROBABILITY_STEP,
        view.filter.min_proba
    )?;
    writeln!(html, "<p><button type=\"submit\">Apply</button></p></form></aside>")?;

    writeln!(html, "<main><h1>ChurnLens Dashboard</h1><div class=\"cards\">")?;
    for (title, value) in [
        ("Avg Churn Prob", view.summary.mean_label()),
        ("Anomalies Flagged", view.summary.anomalies.to_string()),
        ("Total Customers", view.summary.total.to_string()),
    ] {
        writeln!(html, "<div class=\"card\">{}<b>{}</b></div>", title, value)?;
    }
    writeln!(html, "</div>")?;

    writeln!(html, "<h3>Predicted Churn Probability</h3>")?;
    html.push_str(&viz::render_histogram(&view.histogram)?);
    writeln!(html, "<h3>Anomaly Flags by Cohort</h3>")?;
    html.push_str(&viz::render_scatter(&view.scatter)?);
    writeln!(html, "<h3>Average Churn by Cohort</h3>")?;
    html.push_str(&viz::render_heatmap(&view.heatmap)?);
    writeln!(html, "</main></body></html>")?;

    Ok(html)
}

/// Router over an already loaded dashboard
pub fn router(dashboard: Dashboard) -> Router {
    let state = AppState {
        dashboard: Arc::new(dashboard),
    };

    Router::new()
        .route("/", get(index))
        .route("/api/view", get(view_json))
        .route("/charts/:name", get(chart))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load the predictions once and serve the dashboard until shutdown
pub async fn serve(config: &ServerConfig) -> crate::Result<()> {
    let dashboard = Dashboard::load(&config.predictions)?;
    let app = router(dashboard);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!("churnlens dashboard v{} listening on http://{}", env!("CARGO_PKG_VERSION"), config.addr);
    axum::serve(listener, app).await?;
    Ok(())
}
