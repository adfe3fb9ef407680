/*
* CTF Range Manager HTTP API
* --------------------------
* @project: ctf-range-manager
*
* Thin axum layer over ContestOrchestrator. Every handler is a one-liner
* into the orchestrator plus a status code; all the interesting stuff lives
* in provisioning/ and teardown/.
*
* Endpoints (under server.api_prefix, /api/v1 by default):
* -------------------------------------------------------
* POST   /contests/{contest_id}/start     provision every team x question pair
* POST   /contests/{contest_id}/stop      shut down + delete the contest's VMs
* POST   /contests/{contest_id}/cancel    stop a running start/stop from taking new pairs
* GET    /contests/{c}/teams/{t}/questions/{q}/connection
*                                         credential + live guest IPs
* DELETE /vms                             sweep every {c}-{t}-{q} VM on the cluster
* GET    /cluster                         nodes and guests as Proxmox sees them
* POST   /templates/{vmid}                turn a prepared VM into a question template
* GET    /health                          (outside the prefix)
*
* Start/stop/sweep run as tracked tasks: a client that hangs up halfway
* through a 40-team start does not leave half-configured clones behind, and
* the server drains them before exiting.
* Mutating routes share one governor bucket.
*/

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::error::ErrorResponse;
use crate::api::middleware::rate_limit::{rate_limit, SharedLimiter};
use crate::cluster::ClusterSnapshot;
use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId, VmId};
use crate::errors::RangeResult;
use crate::orchestrator::{ContestOrchestrator, StartReport, TeardownReport};
use crate::store::ProvisioningRecord;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ContestOrchestrator>,
    pub limiter: SharedLimiter,
    tasks: TaskTracker,
}

impl AppState {
    pub fn new(orchestrator: Arc<ContestOrchestrator>, limiter: SharedLimiter) -> Self {
        Self {
            orchestrator,
            limiter,
            tasks: TaskTracker::new(),
        }
    }

    /// Runs `task` detached from the request so a dropped connection does not
    /// cancel it mid-pair.
    async fn detached<T, F>(&self, task: F) -> ApiResult<T>
    where
        F: std::future::Future<Output = RangeResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.tasks
            .spawn(task)
            .await
            .map_err(|e| ErrorResponse::internal(format!("task failed: {e}")))?
            .map_err(ErrorResponse::from)
    }

    /// Waits for every detached task, including those whose client is gone.
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(tasks = self.tasks.len(), "Waiting for running contest operations");
        }
        self.tasks.wait().await;
    }
}

type ApiResult<T> = Result<T, ErrorResponse>;

pub fn create_router(state: Arc<AppState>, api_prefix: &str) -> Router {
    let mutating = Router::new()
        .route("/contests/{contest_id}/start", post(start_contest))
        .route("/contests/{contest_id}/stop", post(stop_contest))
        .route("/vms", delete(delete_all_vms))
        .route("/templates/{vmid}", post(templatize))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit,
        ));

    let api = Router::new()
        .route("/contests/{contest_id}/cancel", post(cancel_run))
        .route(
            "/contests/{contest_id}/teams/{team_id}/questions/{question_id}/connection",
            get(connection_info),
        )
        .route("/cluster", get(cluster))
        .merge(mutating);

    let prefix = api_prefix.trim_end_matches('/');
    let router = Router::new().route("/health", get(health));
    let router = if prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(prefix, api)
    };

    router
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn start_contest(
    State(state): State<Arc<AppState>>,
    Path(contest_id): Path<ContestId>,
) -> ApiResult<(StatusCode, Json<StartReport>)> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let report = state.detached(async move { orchestrator.start_contest(contest_id).await }).await?;
    let status = if report.failed() > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

async fn stop_contest(
    State(state): State<Arc<AppState>>,
    Path(contest_id): Path<ContestId>,
) -> ApiResult<(StatusCode, Json<TeardownReport>)> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let report = state.detached(async move { orchestrator.stop_contest(contest_id).await }).await?;
    let status = if report.failed() > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(contest_id): Path<ContestId>,
) -> StatusCode {
    if state.orchestrator.cancel(contest_id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn connection_info(
    State(state): State<Arc<AppState>>,
    Path((contest_id, team_id, question_id)): Path<(ContestId, TeamId, QuestionId)>,
) -> ApiResult<Json<ProvisioningRecord>> {
    let key = ProvisioningKey::new(contest_id, team_id, question_id);
    let record = state.orchestrator.connection_info(&key).await?;
    Ok(Json(record))
}

async fn delete_all_vms(State(state): State<Arc<AppState>>) -> ApiResult<Json<TeardownReport>> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let report = state.detached(async move { orchestrator.delete_all_vms().await }).await?;
    Ok(Json(report))
}

async fn cluster(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClusterSnapshot>> {
    Ok(Json(state.orchestrator.cluster_snapshot().await?))
}

async fn templatize(
    State(state): State<Arc<AppState>>,
    Path(vmid): Path<VmId>,
) -> ApiResult<StatusCode> {
    let orchestrator = Arc::clone(&state.orchestrator);
    state.detached(async move { orchestrator.templatize(vmid).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}
