//! HTTP surface for the flow controller
//!
//! Small axum router exposing rule inspection, rule installation and
//! round-robin selection to external collaborators.

use crate::flow::{FlowController, FlowError, FlowRule};
use crate::vnf::{Instance, InstancePool, VnfType};
use crate::{FlowId, InstanceId};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state behind the flow API.
#[derive(Clone)]
pub struct FlowApiState {
    /// Rule table and balancer
    pub flow: Arc<FlowController>,
    /// Instance table, for the listing endpoints
    pub pool: Arc<InstancePool>,
}

/// Body of `POST /flows`.
#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    /// Traffic class
    pub vnf_type: VnfType,
    /// Target instance
    pub instance_id: InstanceId,
    /// Rule priority
    pub priority: u16,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for FlowError {
    fn into_response(self) -> Response {
        let status = match &self {
            FlowError::Conflict { .. } => StatusCode::CONFLICT,
            FlowError::NotFound { .. } => StatusCode::NOT_FOUND,
            FlowError::LastRule { .. } => StatusCode::CONFLICT,
            FlowError::InstanceNotActive { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the flow API router.
pub fn router(state: FlowApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/flows", get(list_flows).post(create_flow))
        .route("/flows/:flow_id", delete(remove_flow))
        .route("/vnf/:vnf_type/instances", get(list_instances))
        .route("/load-balance/:vnf_type", get(load_balance))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

async fn list_flows(State(state): State<FlowApiState>) -> Json<Vec<FlowRule>> {
    Json(state.flow.list_rules(None))
}

async fn create_flow(
    State(state): State<FlowApiState>,
    Json(body): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<FlowRule>), FlowError> {
    let rule = state
        .flow
        .add_rule(body.vnf_type, body.instance_id, body.priority, None)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn remove_flow(
    State(state): State<FlowApiState>,
    Path(flow_id): Path<FlowId>,
) -> Result<StatusCode, FlowError> {
    state.flow.remove_rule(flow_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instances(
    State(state): State<FlowApiState>,
    Path(vnf_type): Path<String>,
) -> Result<Json<Vec<Instance>>, StatusCode> {
    let vnf_type: VnfType = vnf_type.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(state.pool.list(vnf_type)))
}

async fn load_balance(
    State(state): State<FlowApiState>,
    Path(vnf_type): Path<String>,
) -> Result<Json<Instance>, Response> {
    let vnf_type: VnfType = vnf_type
        .parse()
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    state
        .flow
        .next_instance(vnf_type)
        .map(Json)
        .ok_or_else(|| FlowError::NoHealthyInstance { vnf_type }.into_response())
}

/// Bind and serve the flow API in the background, returning the bound
/// address.
pub async fn serve(state: FlowApiState, port: u16) -> std::io::Result<SocketAddr> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "flow API listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "flow API terminated");
        }
    });
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnf::{HealthState, Instance, PoolLimits};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state() -> FlowApiState {
        let pool = Arc::new(InstancePool::new(PoolLimits { min: 1, max: 8 }, 8));
        let flow = Arc::new(FlowController::new(Arc::clone(&pool)));
        FlowApiState { flow, pool }
    }

    fn active_instance(pool: &InstancePool, vnf_type: VnfType) -> InstanceId {
        let id = Uuid::new_v4();
        pool.insert(Instance::launched(id, vnf_type, format!("ctr-{id}")))
            .unwrap();
        pool.transition(id, HealthState::Active).unwrap();
        id
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(state());
        let res = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_conflict_is_409() {
        let state = state();
        let id = active_instance(&state.pool, VnfType::Firewall);
        let body = serde_json::to_string(&json!({
            "vnf_type": "firewall",
            "instance_id": id,
            "priority": 5,
        }))
        .unwrap();
        let request = || {
            Request::post("/flows")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap()
        };
        let app = router(state.clone());
        let res = app.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let app = router(state);
        let res = app.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_unknown_is_404() {
        let app = router(state());
        let res = app
            .oneshot(
                Request::delete(&format!("/flows/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn load_balance_empty_is_503() {
        let app = router(state());
        let res = app
            .oneshot(
                Request::get("/load-balance/spamfilter")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn instances_listed_per_type() {
        let state = state();
        active_instance(&state.pool, VnfType::Mail);
        let app = router(state);
        let res = app
            .oneshot(
                Request::get("/vnf/mail/instances")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let instances: Vec<Instance> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(instances.len(), 1);
    }
}
