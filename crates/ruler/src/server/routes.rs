use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::orchestrator::RuleFilter;
use crate::server::Server;
use crate::TENANT_ID_HEADER;

pub async fn health() -> &'static str {
    "OK"
}

pub async fn metrics() -> String {
    crate::metrics::gather_metrics()
}

fn tenant_from_headers(headers: &HeaderMap) -> Result<String, Response> {
    match headers.get(TENANT_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(tenant) if !tenant.is_empty() => Ok(tenant.to_string()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            format!("missing {TENANT_ID_HEADER} header"),
        )
            .into_response()),
    }
}

/// Query surface: the tenant's rule groups with live state, merged
/// across all owning instances.
pub async fn list_rules(
    State(server): State<Arc<Server>>,
    Query(filter): Query<RuleFilter>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };
    let response = server.ruler().list_rules(&tenant, &filter).await;
    Json(response).into_response()
}

/// Peer-internal variant answering only from this instance's schedulers.
pub async fn list_local_rules(
    State(server): State<Arc<Server>>,
    Query(filter): Query<RuleFilter>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };
    let groups = server.ruler().list_local_rules(&tenant, &filter).await;
    Json(crate::orchestrator::RulesResponse {
        groups,
        partial: false,
    })
    .into_response()
}

/// Read-only debug view of the membership ring.
pub async fn ring(State(server): State<Arc<Server>>) -> Response {
    Json(server.ruler().ring_snapshot()).into_response()
}
