use std::error::Error as StdError;

use super::super::types::{TransportError, TransportErrorKind};
use super::envelope::EnvelopeError;

/// Maps a reqwest failure for a batch POST into a typed transport error.
pub fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    log_reqwest_diagnostics(&error);

    if let Some(status) = error.status() {
        return map_status(status.as_u16());
    }
    if error.is_timeout() {
        return TransportError::new(
            TransportErrorKind::Timeout,
            format!("RPC request timed out: {error}"),
        );
    }
    if error.is_connect() {
        return TransportError::new(
            TransportErrorKind::Connect,
            format!("failed to connect to RPC provider: {}", render_error_chain(&error)),
        );
    }
    if error.is_decode() || error.is_body() {
        return TransportError::new(
            TransportErrorKind::Envelope,
            format!("failed to read RPC response body: {error}"),
        );
    }
    TransportError::new(
        TransportErrorKind::Request,
        format!("RPC request failed: {}", render_error_chain(&error)),
    )
}

pub fn map_status(status: u16) -> TransportError {
    let message = match status {
        429 => "RPC provider rate limited the batch (HTTP 429)".to_string(),
        400..=499 => format!("RPC provider rejected the batch with HTTP {status}"),
        500..=599 => format!("RPC provider server error HTTP {status}"),
        _ => format!("unexpected HTTP status {status} from RPC provider"),
    };
    TransportError::http_status(status, message)
}

pub fn map_envelope_error(error: EnvelopeError) -> TransportError {
    TransportError::new(TransportErrorKind::Envelope, error.to_string())
}

fn render_error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(next) = source {
        parts.push(next.to_string());
        source = next.source();
    }
    parts.join(" | caused_by: ")
}

fn log_reqwest_diagnostics(error: &reqwest::Error) {
    tracing::debug!(
        event = "rpc_request_error_diagnostics",
        reqwest_status = ?error.status().map(|status| status.as_u16()),
        reqwest_url = ?error.url().map(|url| url.as_str()),
        reqwest_is_timeout = error.is_timeout(),
        reqwest_is_connect = error.is_connect(),
        reqwest_is_decode = error.is_decode(),
        reqwest_is_body = error.is_body(),
        reqwest_is_request = error.is_request(),
        reqwest_error_chain = %render_error_chain(error),
        "captured reqwest diagnostics for RPC request"
    );
}

#[cfg(test)]
mod tests {
    use super::{map_envelope_error, map_status};
    use crate::fetch_service::rpc_client::envelope::decode_batch;
    use crate::fetch_service::types::{
        TransportErrorKind, FAILURE_CLASS_DECODE, FAILURE_CLASS_HTTP_5XX,
        FAILURE_CLASS_RATE_LIMITED,
    };

    #[test]
    fn statuses_map_to_http_status_kind() {
        let rate_limited = map_status(429);
        assert_eq!(rate_limited.kind, TransportErrorKind::HttpStatus);
        assert_eq!(rate_limited.status, Some(429));
        assert_eq!(rate_limited.failure_class, FAILURE_CLASS_RATE_LIMITED);

        let unavailable = map_status(503);
        assert_eq!(unavailable.failure_class, FAILURE_CLASS_HTTP_5XX);
        assert!(unavailable.message.contains("503"));
    }

    #[test]
    fn envelope_errors_are_retryable_decode_failures() {
        let err = decode_batch(b"not json").expect_err("invalid body");
        let mapped = map_envelope_error(err);
        assert_eq!(mapped.kind, TransportErrorKind::Envelope);
        assert_eq!(mapped.failure_class, FAILURE_CLASS_DECODE);
        assert!(mapped.is_retryable());
    }
}
