//! `covenant serve`: HTTP surface plus the background projector and
//! evaluator loops.

use anyhow::Context as _;
use covenant_engine::Engine;
use covenant_store_sqlite::SqliteStore;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use crate::config::ServerConfig;

pub async fn run(engine: Engine<SqliteStore>, cfg: &ServerConfig) -> anyhow::Result<()> {
  let (stop, shutdown) = watch::channel(false);

  let projector = engine.projector();
  let projector_task = {
    let shutdown = shutdown.clone();
    let poll = cfg.projector_poll();
    tokio::spawn(async move { projector.run(shutdown, poll).await })
  };

  let evaluator = engine.evaluator();
  let evaluator_task = {
    let shutdown = shutdown.clone();
    let interval = cfg.evaluator_interval();
    tokio::spawn(async move { evaluator.run(shutdown, interval).await })
  };

  let app = covenant_api::api_router(engine);
  let address = cfg.address();
  info!("listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  let served = axum::serve(listener, app)
    .with_graceful_shutdown(ctrl_c())
    .await
    .context("server error");

  stop.send_replace(true);
  for (name, task) in [("projector", projector_task), ("evaluator", evaluator_task)] {
    if let Err(e) = task.await {
      warn!(task = name, error = %e, "background task panicked");
    }
  }
  info!("shut down");
  served
}

async fn ctrl_c() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!("shutdown requested");
}
