pub mod envelope;
pub mod error_mapping;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;

use crate::build_info;

use super::types::{
    BlockPayload, FailureReason, FetchOutcome, Slot, TransportError, TransportErrorKind,
};
use envelope::{
    decode_batch, encode_batch, match_responses, GetBlockOptions, RequestId, RpcRequest,
    RpcResponse, SINGLE_REQUEST_ID,
};
use error_mapping::{map_envelope_error, map_reqwest_error, map_status};

/// Executes one multi-request `getBlock` call for a batch of slots.
///
/// `Ok` always carries exactly one outcome per requested slot. `Err` means the batch as a whole
/// failed in transport and may be retried.
pub trait BatchRpcClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        slots: &'a [Slot],
    ) -> BoxFuture<'a, Result<BTreeMap<Slot, FetchOutcome>, TransportError>>;
}

impl<T> BatchRpcClient for Arc<T>
where
    T: BatchRpcClient + ?Sized,
{
    fn execute<'a>(
        &'a self,
        slots: &'a [Slot],
    ) -> BoxFuture<'a, Result<BTreeMap<Slot, FetchOutcome>, TransportError>> {
        (**self).execute(slots)
    }
}

/// Connection settings for [`HttpBatchRpcClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientSettings {
    pub rpc_url: String,
    /// Whole-call timeout for batch envelopes.
    pub batch_timeout: Duration,
    /// Timeout for single `getBlock` calls.
    pub request_timeout: Duration,
    pub pool_size: usize,
    pub include_rewards: bool,
}

/// Failure of a single-slot `getBlock` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockFetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("RPC error: code={code}, message={message}")]
    Provider { code: i64, message: String },
}

/// reqwest-backed client. Holds one connection pool for the lifetime of the engine.
pub struct HttpBatchRpcClient {
    http: reqwest::Client,
    rpc_url: String,
    options: GetBlockOptions,
    request_timeout: Duration,
}

impl HttpBatchRpcClient {
    pub fn new(settings: &RpcClientSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(build_info::user_agent())
            .timeout(settings.batch_timeout)
            .pool_max_idle_per_host((settings.pool_size / 2).max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            rpc_url: settings.rpc_url.clone(),
            options: GetBlockOptions::full(settings.include_rewards),
            request_timeout: settings.request_timeout,
        })
    }

    /// Fetches one block with a standalone request. `Ok(None)` when the slot has no block.
    pub async fn fetch_block(&self, slot: Slot) -> Result<Option<BlockPayload>, BlockFetchError> {
        let request = RpcRequest::get_block(RequestId::Number(SINGLE_REQUEST_ID), slot, self.options);
        let response = self
            .http
            .post(&self.rpc_url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()).into());
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        let decoded: RpcResponse = serde_json::from_slice(&body).map_err(|err| {
            TransportError::new(
                TransportErrorKind::Envelope,
                format!("invalid getBlock response for slot {slot}: {err}"),
            )
        })?;

        match decoded.into_outcome() {
            FetchOutcome::Fetched(block) => Ok(Some(block)),
            FetchOutcome::Failed(FailureReason::ProviderError { code, message }) => {
                Err(BlockFetchError::Provider { code, message })
            }
            FetchOutcome::Failed(_) => Ok(None),
        }
    }
}

impl BatchRpcClient for HttpBatchRpcClient {
    fn execute<'a>(
        &'a self,
        slots: &'a [Slot],
    ) -> BoxFuture<'a, Result<BTreeMap<Slot, FetchOutcome>, TransportError>> {
        Box::pin(async move {
            let body = encode_batch(slots, self.options).map_err(|err| {
                TransportError::new(
                    TransportErrorKind::Request,
                    format!("failed to encode batch envelope: {err}"),
                )
            })?;

            let response = self
                .http
                .post(&self.rpc_url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(map_status(status.as_u16()));
            }

            let body = response.bytes().await.map_err(map_reqwest_error)?;
            let responses = decode_batch(&body).map_err(map_envelope_error)?;
            Ok(match_responses(slots, responses))
        })
    }
}
