use crate::coordination::{now_ms, CollectionAdmin, ShardStatus};
use crate::routing::ShardIndex;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ENDPOINT_STATUS: &str = "/status";
pub const ENDPOINT_SHARD_STATUS: &str = "/status/:shard";

/// Which collection the status endpoints describe.
#[derive(Clone)]
pub struct StatusContext {
    pub admin: CollectionAdmin,
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardReport {
    pub index: ShardIndex,
    /// Bit in the collection's availability bitmap.
    pub up: bool,
    pub address: Option<String>,
    pub size: Option<u64>,
    pub loading: Option<bool>,
    pub generation: Option<u64>,
    pub heartbeat_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionStatus {
    pub name: String,
    pub kind: String,
    pub shard_count: usize,
    pub replication: usize,
    pub up: usize,
    pub source_generation: Option<u64>,
    pub shards: Vec<ShardReport>,
}

#[derive(Debug, Serialize)]
pub struct StatusError {
    pub error: String,
}

pub fn router(context: StatusContext) -> Router {
    Router::new()
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(ENDPOINT_SHARD_STATUS, get(handle_shard_status))
        .layer(Extension(Arc::new(context)))
}

async fn shard_report(context: &StatusContext, index: ShardIndex, up: bool) -> ShardReport {
    let path = context.admin.shard_path(&context.collection, index);
    let status = match context.admin.coordinator().get(&path).await {
        Ok((data, _)) => ShardStatus::from_bytes(&data).ok(),
        Err(_) => None,
    };

    ShardReport {
        index,
        up,
        address: status.as_ref().map(|s| s.address.clone()),
        size: status.as_ref().map(|s| s.size),
        loading: status.as_ref().map(|s| s.loading),
        generation: status.as_ref().map(|s| s.generation),
        heartbeat_age_ms: status.map(|s| now_ms().saturating_sub(s.heartbeat_ms)),
    }
}

pub async fn collect_status(context: &StatusContext) -> anyhow::Result<CollectionStatus> {
    let info = context.admin.info(&context.collection).await?;

    let mut shards = Vec::with_capacity(info.shard_count);
    for index in 0..info.shard_count {
        shards.push(shard_report(context, index, info.availability.is_up(index)).await);
    }

    Ok(CollectionStatus {
        name: info.name.clone(),
        kind: info.kind.to_string(),
        shard_count: info.shard_count,
        replication: info.replication,
        up: info.availability.up_count(),
        source_generation: info.source.as_ref().map(|s| s.generation),
        shards,
    })
}

pub async fn handle_status(
    Extension(context): Extension<Arc<StatusContext>>,
) -> Result<Json<CollectionStatus>, (StatusCode, Json<StatusError>)> {
    match collect_status(&context).await {
        Ok(status) => Ok(Json(status)),
        Err(e) => {
            tracing::error!("Status of {} unavailable: {}", context.collection, e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StatusError {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

pub async fn handle_shard_status(
    Extension(context): Extension<Arc<StatusContext>>,
    Path(shard): Path<ShardIndex>,
) -> Result<Json<ShardReport>, (StatusCode, Json<StatusError>)> {
    let info = match context.admin.info(&context.collection).await {
        Ok(info) => info,
        Err(e) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StatusError {
                    error: e.to_string(),
                }),
            ));
        }
    };

    if shard >= info.shard_count {
        return Err((
            StatusCode::NOT_FOUND,
            Json(StatusError {
                error: format!("shard {} out of range 0..{}", shard, info.shard_count),
            }),
        ));
    }

    Ok(Json(
        shard_report(&context, shard, info.availability.is_up(shard)).await,
    ))
}
