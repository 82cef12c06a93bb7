use axum::{extract::State, http::header, response::Html, response::IntoResponse};
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

const INDEX_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Nvidia SMI Exporter</title>
</head>
<body>
<h1>Nvidia SMI Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

pub async fn index() -> Html<&'static str> {
    info!("Serving /index");
    Html(INDEX_PAGE)
}

/// Renders the registry as it stands; never waits on the collector.
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state.metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
