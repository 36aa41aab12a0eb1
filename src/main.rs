//! Server binary: wires the sample workload into a runtime and serves the
//! HTTP gateway.
//!
//! Configuration comes from the environment:
//! - `MINIDUR_ADDR`  bind address (default `127.0.0.1:8080`)
//! - `MINIDUR_STATE_DIR`  when set, persist history to this directory via the
//!   filesystem store; otherwise state is in-memory
//! - `RUST_LOG`  tracing filter (default `info`)
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use minidur::gateway::build_router;
use minidur::hello;
use minidur::providers::fs::FsStore;
use minidur::providers::in_memory::InMemoryStore;
use minidur::providers::InstanceStore;
use minidur::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let activities = Arc::new(hello::register_activities(ActivityRegistry::builder()).build());
    let orchestrations =
        hello::register_orchestrations(OrchestrationRegistry::builder()).build();

    let store: Arc<dyn InstanceStore> = match std::env::var("MINIDUR_STATE_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            info!(dir = %dir, "using filesystem store");
            Arc::new(FsStore::new(dir, false))
        }
        _ => {
            info!("using in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let runtime = Runtime::start_with_store(store, activities, orchestrations).await;
    let router = build_router(runtime.clone());

    let addr = std::env::var("MINIDUR_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router).await?;

    runtime.shutdown().await;
    Ok(())
}
