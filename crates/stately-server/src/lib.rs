//! HTTP surface for Stately.
//!
//! Exposes a single StartExecution endpoint in the shape of the Step
//! Functions API: `POST /` with a `stateMachineArn` and a JSON-encoded
//! `input` starts a run in the background and answers immediately with its
//! `executionArn` and `startDate`.
//!
//! # Example
//!
//! ```ignore
//! use stately_server::{AppState, Server, ServerConfig};
//!
//! let state = AppState::new(executor, definitions, ServerConfig::new());
//! Server::from_state(state).run().await?;
//! ```

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::{ErrorResponse, Result, ServerError};
pub use routes::{HealthResponse, StartExecutionRequest, StartExecutionResponse};
pub use state::AppState;

use std::net::SocketAddr;

use axum::{Router, routing::post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The Stately HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a server from a pre-built application state.
    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(routes::health_routes())
            .route("/", post(routes::start_execution_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the server on the configured address.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.bind_address;
        self.run_on(addr).await
    }

    /// Run the server on a specific address.
    pub async fn run_on(self, addr: SocketAddr) -> Result<()> {
        let router = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind {addr}: {e}")))?;

        info!(
            address = %addr,
            machines = self.state.machines.keys().len(),
            "Starting server"
        );

        axum::serve(listener, router)
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {e}")))?;

        Ok(())
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}
