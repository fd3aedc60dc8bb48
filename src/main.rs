//! Tag Compliance Engine
//!
//! One-shot scans from the command line, or an HTTP API for repeated scans
//! that share the credential, client and result caches.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tag_compliance_engine::agents::compliance_scan::{
    ScanEngine, ScanError, ScanRequest, TargetSelection,
};
use tag_compliance_engine::config::EngineArgs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scan and print the result as JSON
    Scan {
        /// Scan parameters, e.g. '{"regions": "all", "severity": "errors_only"}'
        #[arg(long, default_value = "{}")]
        params: String,

        /// Skip the result cache
        #[arg(long)]
        force_refresh: bool,
    },
    /// Print the targets a discovery scan would cover
    Targets,
    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "COMPLIANCE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = cli.engine.into_config()?;
    let engine = Arc::new(ScanEngine::from_config(&config).await?);

    match cli.command {
        Command::Scan {
            params,
            force_refresh,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let mut request = ScanRequest::from_params(&params)?;
            request.force_refresh |= force_refresh;
            if request.targets.is_none() && config.targets.is_configured() {
                request.targets = Some(TargetSelection::Configured);
            }

            let response = engine.scan_compliance(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Targets => {
            let targets = engine.list_targets().await;
            println!("{}", serde_json::to_string_pretty(&targets)?);
        }
        Command::Serve { addr } => serve(engine, addr).await?,
    }

    Ok(())
}

async fn serve(engine: Arc<ScanEngine>, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/targets", get(list_targets))
        .route("/api/compliance/scan", post(scan_compliance))
        .route("/api/cache/invalidate", post(invalidate_cache))
        .route("/api/credentials/refresh", post(refresh_permissions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine);

    info!(addr = %addr, "Compliance engine listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check(State(engine): State<Arc<ScanEngine>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "tag-compliance-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "account_id": engine.local().account_id,
        "region": engine.local().region,
    }))
}

// --- Error mapping ---

struct ApiError(ScanError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ScanError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ScanError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status != StatusCode::BAD_REQUEST {
            error!(error = %self.0, "Compliance scan failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        Self(err)
    }
}

// --- Handlers ---

async fn list_targets(State(engine): State<Arc<ScanEngine>>) -> impl IntoResponse {
    Json(engine.list_targets().await)
}

async fn scan_compliance(
    State(engine): State<Arc<ScanEngine>>,
    Json(params): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let request = ScanRequest::from_params(&params)?;
    let response = engine.scan_compliance(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    prefix: Option<String>,
}

async fn invalidate_cache(
    State(engine): State<Arc<ScanEngine>>,
    body: Option<Json<InvalidateRequest>>,
) -> impl IntoResponse {
    let Json(input) = body.unwrap_or_default();
    let removed = engine.invalidate_cache(input.prefix.as_deref()).await;
    Json(json!({ "removed": removed }))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    account_id: Option<String>,
}

async fn refresh_permissions(
    State(engine): State<Arc<ScanEngine>>,
    body: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let Json(input) = body.unwrap_or_default();
    engine.refresh_permissions(input.account_id.as_deref()).await;
    info!(account = ?input.account_id, "Permissions refreshed");
    (StatusCode::ACCEPTED, Json(json!({ "status": "refreshed" })))
}
