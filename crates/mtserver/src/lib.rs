//! Share server for mountaintools.
//!
//! Exposes collections of key/value records and content-addressed blobs
//! over HTTP so that clients on different machines can share results and
//! coordinate claims. Each write is applied under the same per-key lock a
//! local client would take, so `set_if_absent` stays a claim primitive
//! when many clients race through the server.

pub mod error;
pub mod routes;
pub mod state;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

pub use error::ApiError;
pub use routes::router;
pub use state::ServerState;

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(root = %state.root().display(), "serving collections on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}
