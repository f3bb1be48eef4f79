//! Line Protocol v1: the Worker stream contract.
//!
//! Wire format for Executor <-> Worker communication over the child
//! process's standard streams.
//!
//! # Protocol Specification
//!
//! - One complete JSON object per line, `\n`-terminated, UTF-8.
//! - No pretty-printing; no embedded literal newlines in string values
//!   (escaped `\n` only).
//! - Request shape: `{"id": "<opaque>", "command": "<verb>", ...payload}`.
//! - Response shape: `{"id": "<same opaque>", "success": true|false, ...}`.
//! - The Worker flushes after every response line.
//! - Stderr is opaque diagnostic output, never protocol.

pub mod config;
pub mod defaults;
pub mod http_types;
pub mod naming;
pub mod types;

pub use config::PylonConfig;
pub use types::{
    Command, CompletionItem, ErrorKind, ExecFailure, ExecOutput, SecurityMode, WorkerRequest,
    WorkerResponse,
};

use thiserror::Error;

/// Protocol version, reported by the bridge in its ping response.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced by line framing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame contains an embedded newline")]
    EmbeddedNewline,
    #[error("frame is empty")]
    Empty,
}

/// Encode a request as one newline-terminated JSON line.
pub fn encode_request(request: &WorkerRequest) -> Result<String, FrameError> {
    encode_line(request)
}

/// Encode a response as one newline-terminated JSON line.
pub fn encode_response(response: &WorkerResponse) -> Result<String, FrameError> {
    encode_line(response)
}

/// Decode one line (with or without its trailing newline) into a response.
pub fn decode_response(line: &str) -> Result<WorkerResponse, FrameError> {
    decode_line(line)
}

/// Decode one line into a request. Used by tests and protocol tooling; the
/// production decoder lives in the Python bridge.
pub fn decode_request(line: &str) -> Result<WorkerRequest, FrameError> {
    decode_line(line)
}

fn encode_line<T: serde::Serialize>(value: &T) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(value)?;
    // serde_json's compact encoder never emits literal newlines, but the
    // framing invariant is load-bearing for the stream parser on the other
    // side, so it is checked rather than assumed.
    if line.contains('\n') {
        return Err(FrameError::EmbeddedNewline);
    }
    line.push('\n');
    Ok(line)
}

fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, FrameError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_single_line() {
        let req = WorkerRequest::new(
            SecurityMode::Restricted,
            Command::Execute {
                code: "x = 1\nresult = x + 1".to_string(),
                variables: Default::default(),
            },
        );
        let line = encode_request(&req).unwrap();
        assert!(line.ends_with('\n'));
        // Exactly one newline: the terminator. Code newlines are escaped.
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = WorkerResponse::ok("req-1", json!(4), "hi\n".to_string());
        let line = encode_response(&resp).unwrap();
        let back = decode_response(&line).unwrap();
        assert_eq!(back.id, "req-1");
        assert!(back.success);
        assert_eq!(back.result, json!(4));
        assert_eq!(back.stdout, "hi\n");
    }

    #[test]
    fn test_decode_empty_line() {
        assert!(matches!(decode_response("\n"), Err(FrameError::Empty)));
        assert!(matches!(decode_response(""), Err(FrameError::Empty)));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_response("not json at all\n"),
            Err(FrameError::Json(_))
        ));
    }
}
