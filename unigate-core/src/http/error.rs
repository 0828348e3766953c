//! HTTP error mapping utilities

use crate::adaptor::AdaptorError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

/// Longest upstream error message carried into an error value
const MAX_MESSAGE_LEN: usize = 512;

/// Map a non-success status and its body to an [`AdaptorError`]
pub fn map_http_error(
    status: StatusCode,
    headers: Option<&HeaderMap>,
    body: Option<String>,
) -> AdaptorError {
    let error_details = body
        .as_ref()
        .and_then(|b| serde_json::from_str::<Value>(b).ok())
        .and_then(|v| extract_error_details(&v));

    let message = error_details
        .as_ref()
        .map(|d| d.message.clone())
        .or_else(|| body.clone().filter(|b| !b.trim().is_empty()))
        .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));
    let message = truncate(message);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdaptorError::Authentication {
            status: status.as_u16(),
            message,
        },

        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .and_then(|h| h.get(RETRY_AFTER))
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .or_else(|| {
                    error_details
                        .and_then(|d| d.retry_after_seconds)
                        .map(Duration::from_secs)
                });
            AdaptorError::RateLimited { retry_after }
        }

        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => AdaptorError::InvalidRequest {
            message,
            status: Some(status.as_u16()),
        },

        // Anything else (5xx, gateway timeouts, 404 for a model this channel
        // lacks) stays channel-local so another channel gets a chance.
        status => AdaptorError::Upstream {
            status: status.as_u16(),
            message,
        },
    }
}

/// Error details extracted from response body
struct ErrorDetails {
    message: String,
    retry_after_seconds: Option<u64>,
}

/// Extract error details from the JSON error shapes upstreams use
fn extract_error_details(json: &Value) -> Option<ErrorDetails> {
    // OpenAI and Anthropic: { "error": { "message": "...", "type": "..." } }
    // Gemini:               { "error": { "code": 400, "message": "...", "status": "..." } }
    if let Some(error) = json.get("error") {
        if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
            return Some(ErrorDetails {
                message: message.to_string(),
                retry_after_seconds: error.get("retry_after").and_then(|v| v.as_u64()),
            });
        }
        if let Some(message) = error.as_str() {
            return Some(ErrorDetails {
                message: message.to_string(),
                retry_after_seconds: None,
            });
        }
    }

    // Gemini returns an array wrapping the error object for some endpoints
    if let Some(first) = json.as_array().and_then(|a| a.first()) {
        return extract_error_details(first);
    }

    json.get("message")
        .and_then(|v| v.as_str())
        .map(|message| ErrorDetails {
            message: message.to_string(),
            retry_after_seconds: json.get("retry_after").and_then(|v| v.as_u64()),
        })
}

/// Parse a Retry-After header value given in seconds
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    header_value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
        message.push_str("...");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use test_case::test_case;

    #[test_case(401, "auth" ; "unauthorized")]
    #[test_case(403, "auth" ; "forbidden")]
    #[test_case(429, "rate" ; "too many requests")]
    #[test_case(400, "invalid" ; "bad request")]
    #[test_case(422, "invalid" ; "unprocessable")]
    #[test_case(404, "upstream" ; "not found")]
    #[test_case(500, "upstream" ; "internal")]
    #[test_case(503, "upstream" ; "unavailable")]
    #[test_case(504, "upstream" ; "gateway timeout")]
    fn test_status_classification(status: u16, expected: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        let error = map_http_error(status, None, None);
        let kind = match error {
            AdaptorError::Authentication { .. } => "auth",
            AdaptorError::RateLimited { .. } => "rate",
            AdaptorError::InvalidRequest { .. } => "invalid",
            AdaptorError::Upstream { .. } => "upstream",
            other => panic!("unexpected mapping {:?}", other),
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_retry_after_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let body = r#"{"error":{"message":"slow down","retry_after":30}}"#.to_string();
        let error = map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(&headers), Some(body));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_from_body() {
        let body = r#"{"error":{"message":"slow down","retry_after":30}}"#.to_string();
        let error = map_http_error(StatusCode::TOO_MANY_REQUESTS, None, Some(body));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_message_extraction_shapes() {
        let openai = r#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        let gemini = r#"[{"error":{"code":503,"message":"backend busy","status":"UNAVAILABLE"}}]"#;
        for (body, expected) in [(openai, "model overloaded"), (gemini, "backend busy")] {
            match map_http_error(StatusCode::SERVICE_UNAVAILABLE, None, Some(body.to_string())) {
                AdaptorError::Upstream { message, status } => {
                    assert_eq!(message, expected);
                    assert_eq!(status, 503);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_long_messages_truncated() {
        let error = map_http_error(StatusCode::BAD_GATEWAY, None, Some("x".repeat(2000)));
        match error {
            AdaptorError::Upstream { message, .. } => assert!(message.len() <= MAX_MESSAGE_LEN + 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
