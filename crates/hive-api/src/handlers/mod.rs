//! HTTP API handlers: mesh status, batch submission and results.

pub mod batch;
pub mod results;
pub mod status;

use axum::http::StatusCode;
use tokio::sync::{broadcast, mpsc, oneshot};

use hive_services::{ControlCommand, ResultStore};

#[derive(Clone)]
pub struct ApiState {
    /// Requests into the mesh loop.
    pub control_tx: mpsc::Sender<ControlCommand>,
    /// Results of the current batch, shared with the mesh loop.
    pub results: ResultStore,
    /// Fires once to begin graceful daemon shutdown.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Send a command to the mesh loop and wait for its reply.
pub(crate) async fn ask<T>(
    state: &ApiState,
    make: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
) -> Result<T, (StatusCode, String)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state.control_tx.send(make(reply_tx)).await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "mesh loop not running".to_string(),
        )
    })?;
    reply_rx.await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "mesh loop dropped the request".to_string(),
        )
    })
}

pub use batch::handle_submit_batch;
pub use results::{handle_result_download, handle_results};
pub use status::{handle_shutdown, handle_status};
