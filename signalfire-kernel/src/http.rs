/**
 * API REST SIGNALFIRE - Lecture de l'inventaire agrégé
 *
 * RÔLE :
 * Expose en lecture seule le cache (par director) et la vue collationnée
 * (par groupe). Ne modifie jamais ni l'un ni l'autre.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, middleware x-api-key si server.api_key est configuré
 * - Routes : /health, /v1/status, /v1/targets, /v1/targets/{id}, /v1/groups, /v1/groups/{key}
 * - Un director injoignable garde ses dernières données, marquées stale
 */

use crate::cache::{Cache, CacheEntry};
use crate::collator::{Collator, Group, HealthSummary};
use crate::models::{Deployment, TargetId};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Seuil de fraîcheur quand l'intervalle de la cible est inconnu
const DEFAULT_STALE_AFTER_SECS: i64 = 90;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub collator: Arc<Collator>,
    pub poll_intervals: Arc<HashMap<TargetId, std::time::Duration>>,
    pub api_key: Option<String>,
}

impl AppState {
    /// Stale au-delà de deux intervalles de polling manqués
    fn stale_after_secs(&self, target: &str) -> i64 {
        self.poll_intervals
            .get(target)
            .map(|d| (d.as_secs() as i64).saturating_mul(2).max(1))
            .unwrap_or(DEFAULT_STALE_AFTER_SECS)
    }
}

#[derive(serde::Serialize)]
struct TargetView {
    target: TargetId,
    last_updated: String,    // RFC3339
    stale: bool,
    stale_for_seconds: i64,  // âge en secondes
    deployments: usize,
    health: HealthSummary,
}

#[derive(serde::Serialize)]
struct TargetDetail {
    #[serde(flatten)]
    summary: TargetView,
    inventory: Vec<Deployment>,
}

#[derive(serde::Serialize)]
struct GroupSummary {
    key: String,
    deployments: usize,
    targets: Vec<TargetId>,
    healthy: bool,           // toutes les VMs running
    health: HealthSummary,
}

#[derive(serde::Serialize)]
struct StatusView {
    warming_up: bool,        // aucun poll réussi pour l'instant
    cached_targets: usize,
    targets: Vec<TargetId>,
    subscribers: usize,
    rules: Vec<String>,
    groups: usize,
}

#[derive(serde::Serialize)]
struct GroupsView {
    generated_at: String,
    groups: Vec<GroupSummary>,
}

fn to_view(app: &AppState, entry: &CacheEntry) -> TargetView {
    let age = OffsetDateTime::now_utc() - entry.updated_at;
    let secs = age.whole_seconds().max(0);
    let mut health = HealthSummary::default();
    for dep in &entry.snapshot.deployments {
        health.merge(&HealthSummary::of(&dep.vms));
    }
    TargetView {
        target: entry.target.clone(),
        last_updated: entry.updated_at.format(&Rfc3339).unwrap_or_default(),
        stale: secs > app.stale_after_secs(&entry.target),
        stale_for_seconds: secs,
        deployments: entry.snapshot.deployments.len(),
        health,
    }
}

fn to_summary(group: &Group) -> GroupSummary {
    let mut targets: Vec<TargetId> = group.members.iter().map(|m| m.target.clone()).collect();
    targets.dedup();
    GroupSummary {
        key: group.key.clone(),
        deployments: group.members.len(),
        targets,
        healthy: group.health.is_healthy(),
        health: group.health.clone(),
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        tracing::warn!(path = %req.uri().path(), "rejected request without valid x-api-key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/status", get(status))
        .route("/v1/targets", get(list_targets))
        .route("/v1/targets/{*id}", get(get_target))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/{key}", get(get_group))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /v1/status
async fn status(State(app): State<AppState>) -> Json<StatusView> {
    Json(StatusView {
        warming_up: app.cache.is_empty(),
        cached_targets: app.cache.len(),
        targets: app.cache.targets(),
        subscribers: app.cache.subscriber_count(),
        rules: app.collator.rule_patterns(),
        groups: app.collator.snapshot().groups.len(),
    })
}

// GET /v1/targets (liste)
async fn list_targets(State(app): State<AppState>) -> Json<Vec<TargetView>> {
    let entries = app.cache.snapshot();
    let mut list: Vec<TargetView> = entries.values().map(|e| to_view(&app, e)).collect();
    list.sort_by(|a, b| a.target.cmp(&b.target));
    Json(list)
}

// GET /v1/targets/{id} (détail, 404 si jamais pollé)
async fn get_target(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TargetDetail>, StatusCode> {
    let Some(entry) = app.cache.get(&id) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(TargetDetail {
        summary: to_view(&app, &entry),
        inventory: entry.snapshot.deployments.clone(),
    }))
}

// GET /v1/groups (vue collationnée résumée)
async fn list_groups(State(app): State<AppState>) -> Json<GroupsView> {
    let view = app.collator.snapshot();
    Json(GroupsView {
        generated_at: view.generated_at.format(&Rfc3339).unwrap_or_default(),
        groups: view.groups.values().map(to_summary).collect(),
    })
}

// GET /v1/groups/{key} (membres + santé des VMs)
async fn get_group(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Group>, StatusCode> {
    app.collator.group(&key).map(Json).ok_or(StatusCode::NOT_FOUND)
}
