//! Script store CRUD handlers.

use crate::error::ApiError;
use crate::state::{AppState, RequestContext};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use pylon_protocol::http_types::{
    ListScriptsResponse, MoveScriptRequest, RenameScriptRequest, SaveScriptRequest,
    ScriptResponse, ScriptSummary,
};
use pylon_security::sha256_hex;
use pylon_store::SavedScript;

type Body<T> = Result<Json<T>, JsonRejection>;

fn parse_body<T>(payload: Body<T>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::invalid_input(rejection.body_text())),
    }
}

fn summarize(script: &SavedScript) -> ScriptSummary {
    ScriptSummary {
        name: script.name.clone(),
        folder: script.folder.clone(),
        author: script.metadata.author.clone(),
        description: script.metadata.description.clone(),
        version: script.metadata.version.clone(),
        created_at: script.metadata.created_at,
        modified_at: script.metadata.modified_at,
        legacy: script.legacy,
    }
}

pub async fn list_scripts(
    State(state): State<AppState>,
) -> Result<Json<ListScriptsResponse>, ApiError> {
    let scripts = state.store().list()?;
    let folders = state.store().folders()?;
    Ok(Json(ListScriptsResponse {
        scripts: scripts.iter().map(summarize).collect(),
        folders,
    }))
}

pub async fn get_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ScriptResponse>, ApiError> {
    let script = state.store().load(&name)?;
    Ok(Json(ScriptResponse {
        summary: summarize(&script),
        code: script.code,
    }))
}

pub async fn save_script(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Body<SaveScriptRequest>,
) -> Result<Json<ScriptResponse>, ApiError> {
    let body = parse_body(payload)?;
    if body.code.len() > state.config().code_bytes {
        return Err(ApiError::invalid_input(format!(
            "code is {} bytes; the limit is {} bytes",
            body.code.len(),
            state.config().code_bytes
        )));
    }

    let code_hash = sha256_hex(body.code.as_bytes());
    state
        .audit()
        .begin(&ctx.identity.user_id, "script-save", Some(code_hash), &ctx.client_ip);
    let result = state.store().save(
        &body.name,
        &body.folder,
        &body.code,
        body.author.or_else(|| Some(ctx.identity.user_id.clone())),
        body.description,
        body.version,
    );
    let outcome = match &result {
        Ok(_) => "success".to_string(),
        Err(e) => e.kind().as_str().to_string(),
    };
    state
        .audit()
        .end(&ctx.identity.user_id, "script-save", &outcome, &ctx.client_ip);
    let saved = result?;

    Ok(Json(ScriptResponse {
        summary: summarize(&saved),
        code: saved.code,
    }))
}

pub async fn delete_script(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store().delete(&name)?;
    state
        .audit()
        .end(&ctx.identity.user_id, "script-delete", "success", &ctx.client_ip);
    Ok(Json(serde_json::json!({"deleted": name})))
}

pub async fn rename_script(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    payload: Body<RenameScriptRequest>,
) -> Result<Json<ScriptResponse>, ApiError> {
    let body = parse_body(payload)?;
    let renamed = state.store().rename(&name, &body.new_name)?;
    state
        .audit()
        .end(&ctx.identity.user_id, "script-rename", "success", &ctx.client_ip);
    Ok(Json(ScriptResponse {
        summary: summarize(&renamed),
        code: renamed.code,
    }))
}

pub async fn move_script(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    payload: Body<MoveScriptRequest>,
) -> Result<Json<ScriptResponse>, ApiError> {
    let body = parse_body(payload)?;
    let moved = state.store().move_to_folder(&name, &body.folder)?;
    state
        .audit()
        .end(&ctx.identity.user_id, "script-move", "success", &ctx.client_ip);
    Ok(Json(ScriptResponse {
        summary: summarize(&moved),
        code: moved.code,
    }))
}
