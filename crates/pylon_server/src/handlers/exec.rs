//! Execution handlers: the request pipeline from HTTP body to worker
//! command and back.
//!
//! Pipeline per request: parse and validate the body, consult the rate
//! limiter, audit a begin record (code hash only, never the code), borrow
//! an executor, dispatch, return the executor (the lease's drop handles
//! every exit path), update metrics, audit the end record.

use crate::error::ApiError;
use crate::state::{AppState, RequestContext};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{Extension, Json};
use pylon_protocol::http_types::{
    CallModuleRequest, CallScriptRequest, CheckSyntaxRequest, CheckSyntaxResponse,
    CompletionsRequest, CompletionsResponse, EvalRequest, ExecRequest, ExecResponse,
};
use pylon_protocol::{Command, ErrorKind, SecurityMode, WorkerRequest};
use pylon_security::gatekeeper::is_module_allowed;
use pylon_security::sha256_hex;
use std::time::Instant;
use tracing::debug;

type Body<T> = Result<Json<T>, JsonRejection>;

fn parse_body<T>(payload: Body<T>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::invalid_input(rejection.body_text())),
    }
}

fn check_code_size(state: &AppState, code: &str) -> Result<(), ApiError> {
    let cap = state.config().code_bytes;
    if code.len() > cap {
        return Err(ApiError::invalid_input(format!(
            "code is {} bytes; the limit is {} bytes",
            code.len(),
            cap
        )));
    }
    Ok(())
}

/// Host-side sandbox pre-check: syntax first, then the import whitelist
/// for the caller's mode. Obvious violations fail here without costing a
/// pool borrow; the bridge enforces the same policy at runtime.
fn check_sandbox(state: &AppState, code: &str, mode: SecurityMode) -> Result<(), ApiError> {
    let blocked = state
        .gatekeeper()
        .blocked_imports(code, mode)
        .map_err(|issue| {
            ApiError::new(
                ErrorKind::SyntaxError,
                format!("{} (line {}, column {})", issue.message, issue.line, issue.column),
            )
        })?;
    if !blocked.is_empty() {
        return Err(ApiError::new(
            ErrorKind::SandboxViolation,
            format!("blocked module(s): {}", blocked.join(", ")),
        ));
    }
    Ok(())
}

/// The shared dispatch tail: rate limit, audit, borrow, execute, record.
///
/// Everything from borrow to the audit end record runs in a spawned task,
/// not in the handler future. A client disconnect drops the handler, but
/// the in-flight execution still completes (its result is discarded) and
/// the executor is only returned to the pool once the worker is idle
/// again.
async fn run_on_pool(
    state: &AppState,
    ctx: &RequestContext,
    action: &str,
    script_name: Option<&str>,
    code_hash: Option<String>,
    command: Command,
) -> Result<ExecResponse, ApiError> {
    if !state.limiter().check(&ctx.identity.user_id).is_allowed() {
        state
            .audit()
            .end(&ctx.identity.user_id, action, "rate_limited", &ctx.client_ip);
        return Err(ApiError::new(
            ErrorKind::RateLimited,
            "request rate limit exceeded",
        ));
    }

    state
        .audit()
        .begin(&ctx.identity.user_id, action, code_hash, &ctx.client_ip);

    let task_state = state.clone();
    let task_ctx = ctx.clone();
    let task_action = action.to_string();
    let task_script = script_name.map(str::to_string);
    let outcome = tokio::spawn(async move {
        let started = Instant::now();
        let exchange = async {
            let mut lease = task_state.pool().borrow().await?;
            let request = WorkerRequest::new(task_ctx.identity.mode, command);
            let response = lease
                .execute(&request, task_state.pool().request_timeout())
                .await?;
            Ok::<_, ApiError>(response)
        }
        .await;
        let duration = started.elapsed();
        let script = task_script.as_deref();

        match exchange {
            Ok(response) => match response.into_result() {
                Ok(output) => {
                    task_state.metrics().record(script, duration, None);
                    task_state.audit().end(
                        &task_ctx.identity.user_id,
                        &task_action,
                        "success",
                        &task_ctx.client_ip,
                    );
                    Ok(ExecResponse {
                        success: true,
                        result: output.result,
                        stdout: output.stdout,
                        duration_ms: duration.as_millis() as u64,
                    })
                }
                Err(failure) => {
                    task_state.metrics().record(script, duration, Some(failure.kind));
                    task_state.audit().end(
                        &task_ctx.identity.user_id,
                        &task_action,
                        failure.kind.as_str(),
                        &task_ctx.client_ip,
                    );
                    if let Some(traceback) = &failure.traceback {
                        debug!("worker traceback for {}: {}", task_action, traceback);
                    }
                    Err(ApiError::new(failure.kind, failure.message))
                }
            },
            Err(error) => {
                task_state.metrics().record(script, duration, Some(error.kind));
                task_state.audit().end(
                    &task_ctx.identity.user_id,
                    &task_action,
                    error.kind.as_str(),
                    &task_ctx.client_ip,
                );
                Err(error)
            }
        }
    });

    match outcome.await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!("dispatch task failed: {}", join_error);
            Err(ApiError::internal())
        }
    }
}

pub async fn exec(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let body = parse_body(payload)?;
    check_code_size(&state, &body.code)?;
    check_sandbox(&state, &body.code, ctx.identity.mode)?;

    let code_hash = sha256_hex(body.code.as_bytes());
    let command = Command::Execute {
        code: body.code,
        variables: body.variables,
    };
    run_on_pool(&state, &ctx, "exec", None, Some(code_hash), command)
        .await
        .map(Json)
}

pub async fn eval(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<EvalRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let body = parse_body(payload)?;
    check_code_size(&state, &body.expression)?;
    check_sandbox(&state, &body.expression, ctx.identity.mode)?;

    let code_hash = sha256_hex(body.expression.as_bytes());
    let command = Command::Evaluate {
        expression: body.expression,
        variables: body.variables,
    };
    run_on_pool(&state, &ctx, "eval", None, Some(code_hash), command)
        .await
        .map(Json)
}

pub async fn call_module(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<CallModuleRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let body = parse_body(payload)?;
    if body.module.is_empty() || body.function.is_empty() {
        return Err(ApiError::invalid_input("module and function are required"));
    }
    if !is_module_allowed(&body.module, ctx.identity.mode) {
        return Err(ApiError::new(
            ErrorKind::SandboxViolation,
            format!("blocked module(s): {}", body.module),
        ));
    }

    let code_hash = sha256_hex(format!("{}.{}", body.module, body.function).as_bytes());
    let command = Command::CallModule {
        module: body.module,
        function: body.function,
        args: body.args,
    };
    run_on_pool(&state, &ctx, "call-module", None, Some(code_hash), command)
        .await
        .map(Json)
}

pub async fn call_script(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<CallScriptRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let body = parse_body(payload)?;
    // Resolve the saved script host-side; the worker never sees the store.
    let script = state.store().load(&body.name)?;
    check_code_size(&state, &script.code)?;
    check_sandbox(&state, &script.code, ctx.identity.mode)?;

    let code_hash = sha256_hex(script.code.as_bytes());
    let command = Command::CallScript {
        code: script.code,
        args: body.args,
        kwargs: body.kwargs,
    };
    run_on_pool(
        &state,
        &ctx,
        "call-script",
        Some(&body.name),
        Some(code_hash),
        command,
    )
    .await
    .map(Json)
}

/// Syntax checking is answered from the host-side AST pass; it costs no
/// pool borrow.
pub async fn check_syntax(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<CheckSyntaxRequest>,
) -> Result<Json<CheckSyntaxResponse>, ApiError> {
    let body = parse_body(payload)?;
    check_code_size(&state, &body.code)?;

    if !state.limiter().check(&ctx.identity.user_id).is_allowed() {
        state
            .audit()
            .end(&ctx.identity.user_id, "check-syntax", "rate_limited", &ctx.client_ip);
        return Err(ApiError::new(
            ErrorKind::RateLimited,
            "request rate limit exceeded",
        ));
    }

    let response = match state.gatekeeper().check_syntax(&body.code) {
        Ok(()) => CheckSyntaxResponse {
            valid: true,
            message: None,
            line: None,
            column: None,
        },
        Err(issue) => CheckSyntaxResponse {
            valid: false,
            message: Some(issue.message),
            line: Some(issue.line),
            column: Some(issue.column),
        },
    };
    let outcome = if response.valid { "valid" } else { "invalid" };
    state
        .audit()
        .end(&ctx.identity.user_id, "check-syntax", outcome, &ctx.client_ip);
    Ok(Json(response))
}

pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<CompletionsRequest>,
) -> Result<Json<CompletionsResponse>, ApiError> {
    let body = parse_body(payload)?;
    check_code_size(&state, &body.code)?;

    let command = Command::Completions {
        code: body.code,
        line: body.line,
        column: body.column,
    };
    let response = run_on_pool(&state, &ctx, "completions", None, None, command).await?;
    let completions = serde_json::from_value(response.result)
        .map_err(|_| ApiError::internal())?;
    Ok(Json(CompletionsResponse { completions }))
}
