use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::super::types::{BlockPayload, FailureReason, FetchOutcome, Slot};

pub const JSONRPC_VERSION: &str = "2.0";
pub const GET_BLOCK_METHOD: &str = "getBlock";
/// Id used for standalone (non-batched) `getBlock` calls.
pub const SINGLE_REQUEST_ID: u64 = 1;

/// JSON-RPC id. Batches use text ids, single calls use a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

/// Correlation id for one slot inside a batch envelope.
pub fn correlation_id(slot: Slot) -> RequestId {
    RequestId::Text(format!("block-{slot}"))
}

/// Second `getBlock` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBlockOptions {
    pub encoding: &'static str,
    pub transaction_details: &'static str,
    pub rewards: bool,
    pub max_supported_transaction_version: u8,
}

impl GetBlockOptions {
    pub fn full(rewards: bool) -> Self {
        Self {
            encoding: "json",
            transaction_details: "full",
            rewards,
            max_supported_transaction_version: 0,
        }
    }
}

impl Default for GetBlockOptions {
    fn default() -> Self {
        Self::full(true)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: &'static str,
    pub params: (Slot, GetBlockOptions),
}

impl RpcRequest {
    pub fn get_block(id: RequestId, slot: Slot, options: GetBlockOptions) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: GET_BLOCK_METHOD,
            params: (slot, options),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One JSON-RPC response. `result: null` and a missing `result` both decode to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub result: Option<BlockPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: BlockPayload) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn null_result(id: RequestId) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: None,
            error: None,
        }
    }

    /// Per-slot outcome of this response. An `error` object wins over any `result`.
    pub fn into_outcome(self) -> FetchOutcome {
        match (self.error, self.result) {
            (Some(error), _) => FetchOutcome::Failed(FailureReason::ProviderError {
                code: error.code,
                message: error.message,
            }),
            (None, Some(block)) if !block.is_null() => FetchOutcome::Fetched(block),
            (None, _) => FetchOutcome::Failed(FailureReason::NotFound),
        }
    }
}

/// Serializes one `getBlock` sub-request per slot into a JSON array.
pub fn encode_batch(slots: &[Slot], options: GetBlockOptions) -> Result<Vec<u8>, serde_json::Error> {
    let requests: Vec<RpcRequest> = slots
        .iter()
        .map(|slot| RpcRequest::get_block(correlation_id(*slot), *slot, options))
        .collect();
    serde_json::to_vec(&requests)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Batch(Vec<RpcResponse>),
    Single(RpcResponse),
}

/// Why a body could not be read as a multi-response envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON-RPC envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// Providers reply with one object (usually an error) when they reject the whole batch.
    #[error("expected a batch response array, got a single response{}", describe_single(.0))]
    NotABatch(Box<RpcResponse>),
}

fn describe_single(response: &RpcResponse) -> String {
    match &response.error {
        Some(error) => format!(" (code={}, message={})", error.code, error.message),
        None => String::new(),
    }
}

pub fn decode_batch(body: &[u8]) -> Result<Vec<RpcResponse>, EnvelopeError> {
    match serde_json::from_slice::<Envelope>(body)? {
        Envelope::Batch(responses) => Ok(responses),
        Envelope::Single(response) => Err(EnvelopeError::NotABatch(Box::new(response))),
    }
}

/// Associates responses with `slots` by correlation id, ignoring response order.
///
/// Every requested slot gets exactly one outcome. Slots whose id is absent from `responses`
/// are `NoResponse`; unknown ids are dropped; a duplicated id keeps its first response.
pub fn match_responses(slots: &[Slot], responses: Vec<RpcResponse>) -> BTreeMap<Slot, FetchOutcome> {
    let mut by_id: HashMap<RequestId, RpcResponse> = HashMap::with_capacity(responses.len());
    for response in responses {
        let Some(id) = response.id.clone() else {
            continue;
        };
        if by_id.contains_key(&id) {
            tracing::debug!(event = "rpc_duplicate_response_id", id = ?id, "ignoring duplicate response id");
            continue;
        }
        by_id.insert(id, response);
    }

    slots
        .iter()
        .map(|slot| {
            let outcome = match by_id.remove(&correlation_id(*slot)) {
                Some(response) => response.into_outcome(),
                None => FetchOutcome::Failed(FailureReason::NoResponse),
            };
            (*slot, outcome)
        })
        .collect()
}
