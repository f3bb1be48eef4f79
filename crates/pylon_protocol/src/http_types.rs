//! HTTP API types for the `/api/v1` surface.
//!
//! Request bodies use `deny_unknown_fields`: an unrecognized field is a
//! client error, not something to silently drop. Response types are shared
//! with clients (IDE, CLI) and use strict snake_case field names.

use crate::types::{CompletionItem, ErrorKind, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Execution requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequest {
    pub code: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalRequest {
    pub expression: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallModuleRequest {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallScriptRequest {
    /// Saved script name; resolved through the script store.
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Variables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSyntaxRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionsRequest {
    pub code: String,
    pub line: u32,
    pub column: u32,
}

// ============================================================================
// Execution responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub success: bool,
    pub result: Value,
    pub stdout: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSyntaxResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionsResponse {
    pub completions: Vec<CompletionItem>,
}

/// Error body for every non-2xx response. `message` is safe for display;
/// diagnostics stay in the server log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

// ============================================================================
// Pool & metrics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatsResponse {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub healthy: usize,
    pub replacing: usize,
    pub waiters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub total_executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_kind: std::collections::BTreeMap<String, u64>,
    pub latency: LatencyStats,
    pub per_script: Vec<ScriptUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencyStats {
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptUsage {
    pub script_name: String,
    pub executions: u64,
    pub failures: u64,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
}

/// One per-minute snapshot in the historical ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub in_use: usize,
    pub available: usize,
    pub healthy: usize,
    pub success_rate_1m: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalMetricsResponse {
    pub snapshots: Vec<MetricSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
}

// ============================================================================
// Script store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveScriptRequest {
    pub name: String,
    #[serde(default)]
    pub folder: String,
    pub code: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameScriptRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveScriptRequest {
    pub folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSummary {
    pub name: String,
    pub folder: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub modified_at: chrono::DateTime<chrono::Utc>,
    pub legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListScriptsResponse {
    pub scripts: Vec<ScriptSummary>,
    /// Folder paths reconstructed from the stored scripts.
    pub folders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResponse {
    #[serde(flatten)]
    pub summary: ScriptSummary,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
