use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::fetch_service::rpc_client::HttpBatchRpcClient;

pub struct AppState {
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    /// Backs the `/block` routes; they answer 503 when unset.
    pub rpc: Option<Arc<HttpBatchRpcClient>>,
}

impl AppState {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            rpc: None,
        }
    }

    pub fn with_rpc(mut self, client: Arc<HttpBatchRpcClient>) -> Self {
        self.rpc = Some(client);
        self
    }
}
