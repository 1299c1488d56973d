//! The cloude backend: sets up guest networking, then serves the control
//! API.

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::Diagnostic;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backend::ip_pool::{IpPool, IpPoolError};
use backend::network::{self, NetworkConfig, NetworkError};

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_POOL_START: Ipv4Addr = Ipv4Addr::new(192, 168, 39, 50);
const DEFAULT_POOL_END: Ipv4Addr = Ipv4Addr::new(192, 168, 39, 200);

#[derive(Debug, Error, Diagnostic)]
enum BackendError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    IpPool(#[from] IpPoolError),

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run().await.map_err(Into::into)
}

async fn run() -> Result<(), BackendError> {
    let server_addr =
        env::var("BACKEND_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_SERVER_ADDR.to_string());

    let network_config = NetworkConfig::from_env()?;
    network::setup_bridge(&network_config).await?;
    network::setup_nat(&network_config)?;

    let pool = Arc::new(IpPool::new(
        state_dir().join("ips.json"),
        DEFAULT_POOL_START,
        DEFAULT_POOL_END,
    )?);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ips/{vm_id}", post(allocate_ip).delete(release_ip))
        .with_state(pool);

    info!(addr = %server_addr, "starting backend server");
    let listener = TcpListener::bind(&server_addr)
        .await
        .map_err(|source| BackendError::Bind {
            addr: server_addr,
            source,
        })?;
    axum::serve(listener, app).await.map_err(BackendError::Serve)?;

    Ok(())
}

/// Where the backend keeps its state: `~/.local/share/cloude/`, creating it
/// on first use.
fn state_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloude");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(error = %e, dir = %dir.display(), "failed to create state dir");
    }
    dir
}

async fn root() -> &'static str {
    "Welcome to the cloude backend!"
}

async fn health_check() -> &'static str {
    "Backend server is healthy!"
}

#[derive(serde::Serialize)]
struct IpResponse {
    vm_id: String,
    ip: String,
}

async fn allocate_ip(
    State(pool): State<Arc<IpPool>>,
    Path(vm_id): Path<String>,
) -> Result<Json<IpResponse>, StatusCode> {
    match pool.allocate(&vm_id) {
        Ok(ip) => Ok(Json(IpResponse { vm_id, ip })),
        Err(IpPoolError::PoolExhausted) => Err(StatusCode::CONFLICT),
        Err(e) => {
            warn!(error = %e, vm_id = %vm_id, "ip allocation failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn release_ip(
    State(pool): State<Arc<IpPool>>,
    Path(vm_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match pool.release(&vm_id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(error = %e, vm_id = %vm_id, "ip release failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
