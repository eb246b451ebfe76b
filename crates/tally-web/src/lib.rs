//! Axum read API over the synchronized counters and boundaries.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tally_adapters::boundary_feature;
use tally_core::OrgId;
use tally_storage::Store;
use tally_sync::{boundaries_at_level, counter_values};
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct AppState<St> {
    pub store: Arc<St>,
}

pub fn app<St: Store>(store: Arc<St>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/orgs/{org}/counts", get(counts_handler::<St>))
        .route("/orgs/{org}/boundaries", get(boundaries_handler::<St>))
        .with_state(Arc::new(AppState { store }))
}

/// Serves [`app`] on `0.0.0.0:port` until the process is stopped.
pub async fn serve<St: Store>(store: Arc<St>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving counter API");
    axum::serve(listener, app(store)).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct CountsQuery {
    prefix: Option<String>,
}

#[derive(Debug, Serialize)]
struct CountsResponse {
    org: OrgId,
    counts: BTreeMap<String, i64>,
}

#[derive(Debug, Default, Deserialize)]
struct BoundariesQuery {
    level: Option<i32>,
}

async fn healthz_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn counts_handler<St: Store>(
    State(state): State<Arc<AppState<St>>>,
    AxumPath(org): AxumPath<i64>,
    Query(query): Query<CountsQuery>,
) -> Response {
    let org = OrgId(org);
    match counter_values(&*state.store, org, query.prefix.as_deref()).await {
        Ok(counts) => Json(CountsResponse { org, counts }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn boundaries_handler<St: Store>(
    State(state): State<Arc<AppState<St>>>,
    AxumPath(org): AxumPath<i64>,
    Query(query): Query<BoundariesQuery>,
) -> Response {
    match boundaries_at_level(&*state.store, OrgId(org), query.level).await {
        Ok(boundaries) => {
            let features: Vec<JsonValue> = boundaries.iter().map(boundary_feature).collect();
            Json(json!({ "type": "FeatureCollection", "features": features })).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
