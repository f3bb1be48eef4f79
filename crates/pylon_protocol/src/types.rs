//! Protocol payload types shared by the Executor, the Pool, and the HTTP
//! layer. These mirror the JSON shapes the Python bridge produces and
//! consumes, so every field name here is wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Security mode
// ============================================================================

/// Execution security mode. RESTRICTED is the default for every request;
/// ADMIN is granted only by a valid admin credential at the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Restricted,
    Admin,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Restricted => "restricted",
            SecurityMode::Admin => "admin",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Stable error taxonomy across all layers. The first block is produced by
/// the bridge inside the Worker; the second block is host-side only and
/// never crosses the stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Produced inside the Worker.
    SyntaxError,
    NameError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    SandboxViolation,
    InternalError,

    // Host-side.
    PoolExhausted,
    WorkerUnavailable,
    SignatureInvalid,
    RateLimited,
    Unauthorized,
    Forbidden,
    InvalidInput,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::NameError => "name_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::SandboxViolation => "sandbox_violation",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::WorkerUnavailable => "worker_unavailable",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Variables seeded into the execution namespace. BTreeMap keeps the wire
/// encoding deterministic, which the code-hash audit path relies on.
pub type Variables = BTreeMap<String, Value>;

/// The command verbs the bridge understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Run a statement block; the conventional `result` binding (if any)
    /// becomes the response result.
    Execute {
        code: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        variables: Variables,
    },
    /// Evaluate a single expression; its value becomes the result.
    Evaluate {
        expression: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        variables: Variables,
    },
    /// Import a whitelisted module and call one of its attributes.
    CallModule {
        module: String,
        function: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
    },
    /// Run a saved script. The host resolves the script name to code before
    /// dispatch; the bridge never sees the script store.
    CallScript {
        code: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        kwargs: Variables,
    },
    /// Parse-only syntax validation.
    CheckSyntax { code: String },
    /// Code completion at a cursor position (1-based line, 0-based column).
    Completions { code: String, line: u32, column: u32 },
    /// Liveness probe.
    Ping,
    /// Orderly worker exit; acknowledged before the process terminates.
    Shutdown,
}

impl Command {
    /// Verb name as it appears on the wire.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Execute { .. } => "execute",
            Command::Evaluate { .. } => "evaluate",
            Command::CallModule { .. } => "call_module",
            Command::CallScript { .. } => "call_script",
            Command::CheckSyntax { .. } => "check_syntax",
            Command::Completions { .. } => "completions",
            Command::Ping => "ping",
            Command::Shutdown => "shutdown",
        }
    }
}

/// One framed request line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRequest {
    /// Opaque correlation id; echoed verbatim in the response.
    pub id: String,
    /// Security mode for this request only.
    #[serde(default)]
    pub mode: SecurityMode,
    #[serde(flatten)]
    pub command: Command,
}

impl WorkerRequest {
    /// Build a request with a fresh v4 correlation id.
    pub fn new(mode: SecurityMode, command: Command) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            command,
        }
    }

    pub fn ping() -> Self {
        Self::new(SecurityMode::Restricted, Command::Ping)
    }

    pub fn shutdown() -> Self {
        Self::new(SecurityMode::Restricted, Command::Shutdown)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One framed response line. `success` selects which of the optional field
/// groups is populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, result: Value, stdout: String) -> Self {
        Self {
            id: id.into(),
            success: true,
            result,
            stdout,
            error: None,
            kind: None,
            traceback: None,
        }
    }

    pub fn err(id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: Value::Null,
            stdout: String::new(),
            error: Some(message.into()),
            kind: Some(kind),
            traceback: None,
        }
    }

    /// Split into the host-side result type. A failure response with no
    /// `kind` is a protocol defect and maps to `InternalError`.
    pub fn into_result(self) -> Result<ExecOutput, ExecFailure> {
        if self.success {
            Ok(ExecOutput {
                result: self.result,
                stdout: self.stdout,
            })
        } else {
            Err(ExecFailure {
                kind: self.kind.unwrap_or(ErrorKind::InternalError),
                message: self.error.unwrap_or_else(|| "unspecified error".to_string()),
                traceback: self.traceback,
            })
        }
    }
}

/// Successful execution payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub result: Value,
    pub stdout: String,
}

/// Failed execution payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

// ============================================================================
// Completions
// ============================================================================

/// One completion candidate returned by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionItem {
    pub text: String,
    /// Candidate category: "function", "module", "keyword", "name", ...
    #[serde(default)]
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = WorkerRequest {
            id: "abc".to_string(),
            mode: SecurityMode::Restricted,
            command: Command::Evaluate {
                expression: "2+2".to_string(),
                variables: BTreeMap::new(),
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"id": "abc", "mode": "restricted", "command": "evaluate", "expression": "2+2"})
        );
    }

    #[test]
    fn test_call_module_wire_shape() {
        let req = WorkerRequest {
            id: "1".to_string(),
            mode: SecurityMode::Admin,
            command: Command::CallModule {
                module: "math".to_string(),
                function: "sqrt".to_string(),
                args: vec![json!(16)],
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["command"], "call_module");
        assert_eq!(value["mode"], "admin");
        assert_eq!(value["args"], json!([16]));
    }

    #[test]
    fn test_mode_defaults_to_restricted() {
        let req: WorkerRequest =
            serde_json::from_str(r#"{"id":"x","command":"ping"}"#).unwrap();
        assert_eq!(req.mode, SecurityMode::Restricted);
        assert_eq!(req.command, Command::Ping);
    }

    #[test]
    fn test_error_response_parses() {
        let line = r#"{"id":"x","success":false,"error":"blocked module 'os'","kind":"sandbox_violation"}"#;
        let resp: WorkerResponse = serde_json::from_str(line).unwrap();
        let failure = resp.into_result().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SandboxViolation);
        assert!(failure.message.contains("os"));
    }

    #[test]
    fn test_failure_without_kind_maps_to_internal() {
        let resp: WorkerResponse =
            serde_json::from_str(r#"{"id":"x","success":false,"error":"boom"}"#).unwrap();
        assert_eq!(resp.into_result().unwrap_err().kind, ErrorKind::InternalError);
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorKind::SandboxViolation).unwrap(),
            json!("sandbox_violation")
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::PoolExhausted).unwrap(),
            json!("pool_exhausted")
        );
    }

    #[test]
    fn test_verb_names() {
        assert_eq!(Command::Ping.verb(), "ping");
        assert_eq!(
            Command::CheckSyntax { code: String::new() }.verb(),
            "check_syntax"
        );
    }
}
