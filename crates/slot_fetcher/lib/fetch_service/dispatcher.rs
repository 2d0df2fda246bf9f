use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::build_info;
use crate::config::DispatchConfig;

use super::types::{BlockPayload, Slot};

/// One element of the downstream parse request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    #[serde(rename = "blockNum")]
    pub block_num: String,
    #[serde(rename = "blockData")]
    pub block_data: BlockPayload,
}

impl DispatchRecord {
    pub fn new(slot: Slot, block: BlockPayload) -> Self {
        Self {
            block_num: slot.to_string(),
            block_data: block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no downstream endpoints configured")]
    NoEndpoints,
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("{endpoint} answered HTTP {status}")]
    Status { endpoint: String, status: u16 },
}

/// Destination for fetched blocks.
pub trait BlockSink: Send + Sync {
    fn deliver<'a>(&'a self, records: Vec<DispatchRecord>) -> BoxFuture<'a, Result<(), DispatchError>>;
}

impl<T> BlockSink for Arc<T>
where
    T: BlockSink + ?Sized,
{
    fn deliver<'a>(&'a self, records: Vec<DispatchRecord>) -> BoxFuture<'a, Result<(), DispatchError>> {
        (**self).deliver(records)
    }
}

/// `http://<host>:<port><path>` for each port in `[port_start, port_start + port_count)`.
pub fn endpoints_for_ports(host: &str, port_start: u16, port_count: u16, path: &str) -> Vec<String> {
    (0..port_count)
        .filter_map(|offset| port_start.checked_add(offset))
        .map(|port| format!("http://{host}:{port}{path}"))
        .collect()
}

/// POSTs block payloads to local parse servers in strict round-robin order.
///
/// The endpoint list is fixed at construction. Failed posts are returned to the caller as-is.
pub struct ResultDispatcher {
    http: reqwest::Client,
    endpoints: Vec<String>,
    next_index: Mutex<usize>,
}

impl ResultDispatcher {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(build_info::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoints,
            next_index: Mutex::new(0),
        })
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            endpoints_for_ports(&config.host, config.port_start, config.port_count, &config.path),
            config.timeout,
        )
    }

    /// Endpoint for the next call. The k-th call returns endpoint `k mod N`.
    pub fn next_endpoint(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let index = {
            let mut next = self.next_index.lock().unwrap_or_else(PoisonError::into_inner);
            let index = *next;
            *next = (index + 1) % self.endpoints.len();
            index
        };
        Some(self.endpoints[index].as_str())
    }

    pub async fn send(&self, records: &[DispatchRecord]) -> Result<(), DispatchError> {
        let endpoint = self.next_endpoint().ok_or(DispatchError::NoEndpoints)?;
        let response = self
            .http
            .post(endpoint)
            .json(records)
            .send()
            .await
            .map_err(|err| DispatchError::Request {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(
            event = "blocks_dispatched",
            endpoint,
            blocks = records.len(),
            "forwarded blocks downstream"
        );
        Ok(())
    }
}

impl BlockSink for ResultDispatcher {
    fn deliver<'a>(&'a self, records: Vec<DispatchRecord>) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move { self.send(&records).await })
    }
}

#[cfg(test)]
mod tests {
    use super::{endpoints_for_ports, DispatchRecord, ResultDispatcher};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher(count: u16) -> ResultDispatcher {
        ResultDispatcher::new(
            endpoints_for_ports("localhost", 8000, count, "/api/parse-blockdata"),
            Duration::from_secs(1),
        )
        .expect("client builds")
    }

    #[test]
    fn endpoints_follow_port_range() {
        assert_eq!(
            endpoints_for_ports("localhost", 8000, 3, "/api/parse-blockdata"),
            vec![
                "http://localhost:8000/api/parse-blockdata",
                "http://localhost:8001/api/parse-blockdata",
                "http://localhost:8002/api/parse-blockdata",
            ]
        );
        assert_eq!(endpoints_for_ports("localhost", u16::MAX, 3, "/").len(), 1);
    }

    #[test]
    fn rotation_wraps_in_order() {
        let dispatcher = dispatcher(3);
        let picked: Vec<String> = (0..7)
            .filter_map(|_| dispatcher.next_endpoint().map(str::to_string))
            .collect();
        let ports: Vec<&str> = picked
            .iter()
            .map(|url| &url["http://localhost:".len().."http://localhost:".len() + 4])
            .collect();
        assert_eq!(ports, vec!["8000", "8001", "8002", "8000", "8001", "8002", "8000"]);
    }

    #[tokio::test]
    async fn concurrent_callers_see_fair_rotation() {
        let dispatcher = Arc::new(dispatcher(6));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                (0..100)
                    .filter_map(|_| dispatcher.next_endpoint().map(str::to_string))
                    .collect::<Vec<_>>()
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for endpoint in handle.await.expect("rotation task panicked") {
                *counts.entry(endpoint).or_insert(0) += 1;
            }
        }

        // 1000 calls over 6 endpoints: each gets floor or ceil of 1000/6.
        assert_eq!(counts.len(), 6);
        assert!(counts.values().all(|count| *count == 166 || *count == 167));
        assert_eq!(counts.values().sum::<usize>(), 1_000);
    }

    #[tokio::test]
    async fn empty_endpoint_list_is_an_error() {
        let dispatcher = ResultDispatcher::new(Vec::new(), Duration::from_secs(1)).expect("client builds");
        assert!(dispatcher.next_endpoint().is_none());
        assert_eq!(
            dispatcher.send(&[]).await,
            Err(super::DispatchError::NoEndpoints)
        );
    }

    #[test]
    fn record_serializes_with_downstream_field_names() {
        let record = DispatchRecord::new(42, json!({ "blockhash": "abc" }));
        assert_eq!(
            serde_json::to_value(&record).expect("serializable"),
            json!({ "blockNum": "42", "blockData": { "blockhash": "abc" } })
        );
    }
}
