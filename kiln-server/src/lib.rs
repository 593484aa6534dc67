//! OpenAI-compatible HTTP front end for a single-flight image engine.

pub mod config;
pub mod error;
pub mod routes;
pub mod schemas;
pub mod state;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use config::Args;
pub use routes::router;
pub use state::{AppState, GenerationDefaults};

/// Serves `app` until `shutdown` fires, then drains open connections.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
