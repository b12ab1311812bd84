//! Management REST surface.

use crate::error::ConsoleError;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mediator_core::Project;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

fn error_response(err: &ConsoleError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        ConsoleError::InvalidName(_) => StatusCode::BAD_REQUEST,
        ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
        ConsoleError::AlreadyExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

pub async fn health(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let project = app.active.read().await;
    Json(json!({
        "status": "ok",
        "project": project.name,
        "captures": project.requests.len(),
        "browserRunning": app.driver.is_running(),
        "operatorConnected": app.router.is_connected(),
    }))
}

pub async fn list_projects(
    State(app): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<serde_json::Value>)> {
    app.store
        .list()
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

pub async fn create_project(
    State(app): State<Arc<AppState>>,
    Json(body): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), (StatusCode, Json<serde_json::Value>)> {
    app.store
        .create(&body.name)
        .await
        .map(|p| (StatusCode::CREATED, Json(p)))
        .map_err(|e| error_response(&e))
}

/// Load a project and make it the open one; the capture log and rule
/// lists switch with it.
pub async fn load_project(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Project>, (StatusCode, Json<serde_json::Value>)> {
    let project = app
        .store
        .load(&name)
        .await
        .map_err(|e| error_response(&e))?;
    app.activate(project.clone()).await;
    Ok(Json(project))
}

/// Replace a project document wholesale. If it is the open project, the
/// in-memory state is replaced as well.
pub async fn replace_project(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut project): Json<Project>,
) -> Result<Json<Project>, (StatusCode, Json<serde_json::Value>)> {
    project.name = name.clone();
    project.touch();
    app.store
        .save(&project)
        .await
        .map_err(|e| error_response(&e))?;

    let is_open = app.active.read().await.name == name;
    if is_open {
        app.activate(project.clone()).await;
    }
    Ok(Json(project))
}
