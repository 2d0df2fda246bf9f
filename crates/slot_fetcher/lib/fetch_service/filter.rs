use serde_json::Value;

use super::types::BlockPayload;

/// SPL Token program; the usual `--require-account` value for trade extraction.
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

pub fn transaction_count(block: &BlockPayload) -> u64 {
    block
        .get("transactions")
        .and_then(Value::as_array)
        .map_or(0, |transactions| transactions.len() as u64)
}

/// Decides what part of a fetched block is forwarded downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFilter {
    required_account: Option<String>,
}

impl BlockFilter {
    pub fn new(required_account: Option<String>) -> Self {
        Self { required_account }
    }

    /// Drops transactions that do not reference the required account, if one is set.
    /// Returns `None` when no transactions remain.
    pub fn apply(&self, mut block: BlockPayload) -> Option<BlockPayload> {
        if let Some(account) = self.required_account.as_deref() {
            if let Some(transactions) = block.get_mut("transactions").and_then(Value::as_array_mut) {
                transactions.retain(|transaction| references_account(transaction, account));
            }
        }
        (transaction_count(&block) > 0).then_some(block)
    }
}

/// Account keys are plain strings for `json` encoding and `{ "pubkey": .. }` objects for
/// `jsonParsed`.
fn references_account(transaction: &Value, account: &str) -> bool {
    transaction
        .pointer("/transaction/message/accountKeys")
        .and_then(Value::as_array)
        .is_some_and(|keys| {
            keys.iter().any(|key| match key {
                Value::String(key) => key == account,
                Value::Object(fields) => fields.get("pubkey").and_then(Value::as_str) == Some(account),
                _ => false,
            })
        })
}
