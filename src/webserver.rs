use crate::secret_string::SecretString;
use crate::workload::{AssignError, FIELD_MANAGER, ImageAssignment, Workload, WorkloadKind};
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, http::StatusCode, routing::get};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::Api;
use kube::api::PostParams;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

static API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone)]
pub struct AppState {
    pub(crate) kube_client: kube::Client,
    pub(crate) api_key: Option<SecretString>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API key")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_kube(e: kube::Error, what: String) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound(format!("{} not found", what)),
            e => ApiError::Internal(format!("{}: {}", what, e)),
        }
    }
}

impl From<AssignError> for ApiError {
    fn from(e: AssignError) -> Self {
        match e {
            AssignError::ContainerNotFound { .. } => ApiError::NotFound(e.to_string()),
            AssignError::NoContainers { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (code, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateQuery {
    #[serde(default)]
    namespace: String,
    #[serde(default, alias = "service")]
    name: String,
    #[serde(default)]
    container: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    image: String,
}

#[derive(Debug, PartialEq)]
struct UpdateRequest {
    namespace: String,
    name: String,
    container: Option<String>,
    kind: WorkloadKind,
    image: String,
}

impl UpdateQuery {
    fn validate(self) -> Result<UpdateRequest, ApiError> {
        let (namespace, name, image) = (
            self.namespace.trim().to_string(),
            self.name.trim().to_string(),
            self.image.trim().to_string(),
        );
        if namespace.is_empty() || name.is_empty() || image.is_empty() {
            return Err(ApiError::BadRequest(
                "namespace, name, and image are required".to_string(),
            ));
        }
        let kind = match self.kind.trim() {
            "" => WorkloadKind::default(),
            kind => kind.parse().map_err(ApiError::BadRequest)?,
        };
        let container = Some(self.container.trim().to_string()).filter(|c| !c.is_empty());

        Ok(UpdateRequest {
            namespace,
            name,
            container,
            kind,
            image,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    message: String,
    details: String,
}

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn authorized(expected: Option<&SecretString>, provided: Option<&str>) -> bool {
    let provided = provided.unwrap_or_default();
    match expected {
        Some(key) => key.matches(provided),
        None => provided.is_empty(),
    }
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if !authorized(state.api_key.as_ref(), provided) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

pub async fn update_image(
    State(state): State<AppState>,
    Query(query): Query<UpdateQuery>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let request = query.validate()?;
    let assignment = match request.kind {
        WorkloadKind::Deployment => assign::<Deployment>(&state.kube_client, &request).await?,
        WorkloadKind::StatefulSet => assign::<StatefulSet>(&state.kube_client, &request).await?,
        WorkloadKind::DaemonSet => assign::<DaemonSet>(&state.kube_client, &request).await?,
    };

    let message = match &assignment {
        ImageAssignment::Updated { container } => {
            format!("Updated image of container {}", container)
        }
        ImageAssignment::Restarted { container } => {
            format!("Restarted container {} to pull the image again", container)
        }
        ImageAssignment::UpToDate { container } => {
            format!("Container {} is already up to date", container)
        }
    };
    Ok(Json(UpdateResponse {
        message,
        details: format!(
            "Updated {} {}/{} with image {}",
            request.kind, request.namespace, request.name, request.image
        ),
    }))
}

async fn assign<W: Workload>(
    client: &kube::Client,
    request: &UpdateRequest,
) -> Result<ImageAssignment, ApiError> {
    let what = format!("{} {}/{}", request.kind, request.namespace, request.name);
    let api: Api<W> = Api::namespaced(client.clone(), &request.namespace);
    let mut workload = api
        .get(&request.name)
        .await
        .map_err(|e| ApiError::from_kube(e, what.clone()))?;

    let assignment = workload.assign_image(request.container.as_deref(), &request.image)?;
    if assignment.changed() {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&request.name, &pp, &workload)
            .await
            .map_err(|e| ApiError::from_kube(e, what.clone()))?;
        info!("Manually assigned image {} to {}", request.image, what);
    }
    Ok(assignment)
}

pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/update", get(update_image))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .merge(api)
        .with_state(state)
}
