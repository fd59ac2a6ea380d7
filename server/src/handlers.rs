//! RPC surface handlers: four JSON-over-HTTP routes (Get, Put, CPut, Delete)
//! fronting the engine.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chunkkv_engine::{EngineError, Key};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use chunkkv_engine::Engine;

pub type SharedEngine = Arc<Mutex<Engine>>;

pub enum RpcError {
    NotFound,
    Mismatch,
    Internal(String),
}

impl From<EngineError> for RpcError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound => RpcError::NotFound,
            EngineError::Mismatch => RpcError::Mismatch,
            other => RpcError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            RpcError::NotFound => (StatusCode::NOT_FOUND, "key not found".to_string()),
            RpcError::Mismatch => (StatusCode::CONFLICT, "mismatch".to_string()),
            RpcError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    pub row: String,
    pub col: String,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub val: String,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub row: String,
    pub col: String,
    pub val: String,
}

#[derive(Debug, Deserialize)]
pub struct CPutRequest {
    pub row: String,
    pub col: String,
    pub val1: String,
    pub val2: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub row: String,
    pub col: String,
}

pub async fn get(
    State(engine): State<SharedEngine>,
    Json(req): Json<GetRequest>,
) -> Result<Json<GetResponse>, RpcError> {
    info!("Get {}/{}", req.row, req.col);
    let key = Key::new(req.row, req.col);
    let mut engine = engine.lock().unwrap();
    let val = engine.get(&key)?;
    Ok(Json(GetResponse { val }))
}

pub async fn put(
    State(engine): State<SharedEngine>,
    Json(req): Json<PutRequest>,
) -> Result<StatusCode, RpcError> {
    info!("Put {}/{}", req.row, req.col);
    let key = Key::new(req.row, req.col);
    let mut engine = engine.lock().unwrap();
    engine.put(&key, req.val)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cput(
    State(engine): State<SharedEngine>,
    Json(req): Json<CPutRequest>,
) -> Result<StatusCode, RpcError> {
    info!("CPut {}/{}", req.row, req.col);
    let key = Key::new(req.row, req.col);
    let mut engine = engine.lock().unwrap();
    match engine.cput(&key, &req.val1, req.val2) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(EngineError::Mismatch) => {
            warn!("CPut {}/{} mismatch", key.row, key.col);
            Err(RpcError::Mismatch)
        }
        Err(other) => Err(other.into()),
    }
}

pub async fn delete(
    State(engine): State<SharedEngine>,
    Json(req): Json<DeleteRequest>,
) -> Result<StatusCode, RpcError> {
    info!("Delete {}/{}", req.row, req.col);
    let key = Key::new(req.row, req.col);
    let mut engine = engine.lock().unwrap();
    match engine.remove(&key) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(EngineError::Mismatch) => {
            warn!("Delete {}/{} mismatch (absent)", key.row, key.col);
            Err(RpcError::Mismatch)
        }
        Err(other) => Err(other.into()),
    }
}
