use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{load_engine, Dispatcher};
use kiln_server::{router, serve, AppState, Args};
use tokio::{net::TcpListener, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_core=info,kiln_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = Arc::new(AppState::new(args.defaults()));
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_for_signals(shutdown.clone()));

    // Bind first so health checks can report "loading" while weights come in.
    let listener = TcpListener::bind(args.bind_address()).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    let mut server = tokio::spawn(serve(listener, router(state.clone()), shutdown.clone()));

    let api = Api::new()?;
    let engine = tokio::select! {
        loaded = load_engine(&args.model, api, args.device_map(), args.precision) => loaded,
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested while loading the model");
            return server.await?.map_err(Into::into);
        }
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %err, "failed to load model");
            shutdown.cancel();
            let _ = server.await;
            return Err(err.into());
        }
    };

    let (dispatcher, worker) = Dispatcher::new(engine, args.dispatcher_config());
    let mut worker = tokio::spawn(worker.run(shutdown.clone()));
    state.set_ready(dispatcher);
    tracing::info!(model = %args.model, "model loaded, accepting requests");

    tokio::select! {
        _ = shutdown.cancelled() => {}
        served = &mut server => {
            shutdown.cancel();
            served??;
        }
    }

    // Queued jobs are abandoned; the running one gets until the deadline.
    let deadline = Instant::now() + args.shutdown_grace();
    match tokio::time::timeout_at(deadline, &mut worker).await {
        Ok(Ok(summary)) => tracing::info!(?summary, "dispatcher stopped"),
        Ok(Err(err)) => tracing::error!(error = %err, "dispatcher worker failed"),
        Err(_) => tracing::warn!("generation still running after grace period, exiting anyway"),
    }
    if !server.is_finished() {
        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(served) => served??,
            Err(_) => tracing::warn!("open connections did not drain before the grace period"),
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn watch_for_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal");
    shutdown.cancel();
}
