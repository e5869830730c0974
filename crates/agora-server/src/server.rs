use std::net::SocketAddr;
use std::sync::Arc;

use agora_node::Node;
use tokio::net::TcpListener;

use crate::error::{ServerError, ServerResult};
use crate::router::build_router;

/// Local HTTP API in front of one node.
pub struct AgoraServer {
    node: Arc<Node>,
    bind_addr: SocketAddr,
}

impl AgoraServer {
    /// Serve `node` on the address from its configuration.
    pub fn new(node: Arc<Node>) -> Self {
        let bind_addr = node.config().server.bind_addr;
        Self { node, bind_addr }
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(Arc::clone(&self.node))
    }

    /// Serve requests until `shutdown` completes.
    pub async fn serve<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("agora API listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}
