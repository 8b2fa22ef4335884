use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use banter_core::registry::ModelRegistry;
use banter_db::DbPool;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    registry: Arc<ModelRegistry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub registry: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, registry: Arc<ModelRegistry>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, registry })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    registry: Arc<ModelRegistry>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        conversation_id = "unknown",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, registry)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                conversation_id = "unknown",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let registry = registry_check(&state.registry);
    let ready = database.status == "ready" && registry.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "banter-server runtime initialized".to_string(),
        },
        database,
        registry,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn registry_check(registry: &ModelRegistry) -> HealthCheck {
    if registry.is_empty() {
        return HealthCheck { status: "degraded", detail: "no models registered".to_string() };
    }

    HealthCheck {
        status: "ready",
        detail: format!("{} model(s) registered", registry.len()),
    }
}
