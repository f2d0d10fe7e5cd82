use std::collections::HashMap;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use companion_core::cron::CronJob;
use companion_core::ids::new_id;
use companion_core::policy::PolicyConfig;
use companion_core::run::{clip_text, RunState, RunType};
use companion_core::time::now_ms;
use companion_core::PermissionPolicy;
use companion_runtime::{
    run_command, ExecRequest, ExecResult, SessionRequest, SessionSnapshot, SessionStatus,
    StreamSelector,
};
use companion_scheduler::is_schedulable;
use companion_skills::SkillBundle;
use companion_store::{CreateRun, NewApproval, Resolution, RunFilter, UpdateRun};

use crate::auth::require_auth;
use crate::error::ApiError;
use crate::state::AppState;

const BODY_LIMIT: usize = 1024 * 1024;
const SKILL_BODY_LIMIT: usize = 6 * 1024 * 1024;
const COMMAND_MAX_CHARS: usize = 10_000;
const TIMEOUT_MIN_MS: u64 = 1_000;
const TIMEOUT_MAX_MS: u64 = 300_000;
const TIMEOUT_DEFAULT_MS: u64 = 60_000;
const LOG_LIMIT_DEFAULT: usize = 10_000;
const EVENTS_LIMIT_DEFAULT: usize = 100;

/// Full route table. `/api/local-runtime` is a legacy alias for
/// `/api/runtime` and routes through the same handlers.
pub fn build_router(state: AppState) -> Router {
    let runtime = Router::new()
        .route("/exec", post(exec))
        .route("/session/start", post(session_start))
        .route("/session/{id}", get(session_get))
        .route("/session/{id}/stop", post(session_stop))
        .route("/session/{id}/write", post(session_write))
        .route("/session/{id}/send-keys", post(session_send_keys))
        .route("/sessions", get(sessions_list))
        .route("/sessions/{id}/log", get(session_log))
        .route("/session-events", get(session_events))
        .route("/runs", get(runs_list))
        .route("/runs/diagnostics", get(runs_diagnostics))
        .route("/runs/{id}", get(runs_get))
        .route("/approvals", post(approval_create))
        .route("/approvals/pending", get(approvals_pending))
        .route("/approvals/{id}", get(approval_get))
        .route("/approvals/{id}/resolve", post(approval_resolve));

    let skills = Router::new()
        .route("/extract", post(skill_extract))
        .route("/{name}", delete(skill_delete))
        .layer(DefaultBodyLimit::max(SKILL_BODY_LIMIT));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/runtime", runtime.clone())
        .nest("/api/local-runtime", runtime)
        .route("/api/mcp/servers", get(mcp_servers))
        .route("/api/mcp/servers/{name}/restart", post(mcp_restart))
        .route("/api/mcp/tools", get(mcp_tools))
        .route("/api/mcp/tools/call", post(mcp_call))
        .route("/api/security/policy", get(policy_get).post(policy_set))
        .nest("/api/skills", skills)
        .route("/api/cron/jobs", get(cron_jobs).post(cron_upsert))
        .route("/api/cron/jobs/{id}", delete(cron_delete))
        .route("/api/cron/pending", get(cron_pending))
        .route("/api/cron/pending/ack", post(cron_ack))
        .layer(middleware::map_response(normalize_body_rejections))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Body-shape failures from the framework (oversize, wrong media type,
/// schema mismatch) all surface as plain 400 validation errors.
async fn normalize_body_rejections(response: Response) -> Response {
    match response.status() {
        StatusCode::PAYLOAD_TOO_LARGE => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "request body too large" })),
        )
            .into_response(),
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid request body" })),
        )
            .into_response(),
        _ => response,
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let (servers, tools) = state.supervisor.counts().await;
    let policy = state.policy.read().await.to_config();
    Json(serde_json::json!({
        "ok": true,
        "ts": now_ms(),
        "pid": std::process::id(),
        "version": state.version,
        "mcpServers": servers,
        "mcpTools": tools,
        "permissionPolicy": policy,
    }))
}

// ---------------------------------------------------------------------------
// Exec & sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
}

struct AdmittedCommand {
    command: String,
    cwd: std::path::PathBuf,
    timeout_ms: u64,
    env: HashMap<String, String>,
}

/// Shared validation + policy gate for exec and session start.
async fn admit_command(
    state: &AppState,
    body: CommandBody,
) -> Result<AdmittedCommand, ApiError> {
    let command = body.command;
    if command.trim().is_empty() {
        return Err(ApiError::validation("command is required"));
    }
    if command.chars().count() > COMMAND_MAX_CHARS {
        return Err(ApiError::validation(format!(
            "command exceeds {COMMAND_MAX_CHARS} characters"
        )));
    }
    let timeout_ms = body
        .timeout_ms
        .unwrap_or(TIMEOUT_DEFAULT_MS)
        .clamp(TIMEOUT_MIN_MS, TIMEOUT_MAX_MS);

    let policy = state.policy.read().await.clone();
    let home = state.paths.home_dir().to_path_buf();
    let cwd = policy.resolve_cwd(body.cwd.as_deref(), &home)?;
    policy.enforce_command(&command, &cwd, &home)?;

    Ok(AdmittedCommand {
        command,
        cwd,
        timeout_ms,
        env: body.env.unwrap_or_default(),
    })
}

fn command_meta(command: &str) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("command".into(), Value::String(clip_text(command)));
    meta
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    run_id: String,
    #[serde(flatten)]
    result: ExecResult,
}

async fn exec(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<ExecResponse>, ApiError> {
    let admitted = admit_command(&state, body).await?;
    let run = state
        .runs
        .create(CreateRun {
            run_type: RunType::Exec,
            state: Some(RunState::Running),
            meta: Some(command_meta(&admitted.command)),
            ..Default::default()
        })
        .await;

    let result = run_command(ExecRequest {
        command: admitted.command,
        cwd: admitted.cwd,
        timeout_ms: admitted.timeout_ms,
        env: admitted.env,
    })
    .await;

    let summary = if result.timed_out {
        format!("timed out after {}ms", result.duration_ms)
    } else {
        format!("exit {} in {}ms", result.exit_code, result.duration_ms)
    };
    state
        .runs
        .update(
            &run.run_id,
            UpdateRun {
                state: Some(if result.ok {
                    RunState::Done
                } else {
                    RunState::Failed
                }),
                summary: Some(summary),
                error: (!result.ok && !result.stderr.is_empty())
                    .then(|| result.stderr.clone()),
                meta: None,
            },
        )
        .await;

    Ok(Json(ExecResponse {
        run_id: run.run_id,
        result,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStartResponse {
    run_id: String,
    #[serde(flatten)]
    session: SessionSnapshot,
}

async fn session_start(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<SessionStartResponse>, ApiError> {
    let admitted = admit_command(&state, body).await?;
    let run = state
        .runs
        .create(CreateRun {
            run_type: RunType::Session,
            state: Some(RunState::Running),
            meta: Some(command_meta(&admitted.command)),
            ..Default::default()
        })
        .await;

    // Reserve the session id and index it before the child exists, so even a
    // session that exits immediately finds its run record.
    let session_id = new_id();
    state
        .run_index
        .lock()
        .await
        .insert(session_id.clone(), run.run_id.clone());

    let session = state
        .sessions
        .start_session(SessionRequest {
            id: Some(session_id),
            command: admitted.command,
            cwd: admitted.cwd,
            timeout_ms: admitted.timeout_ms,
            env: admitted.env,
        })
        .await;
    info!(session = %session.id, run = %run.run_id, "session started");

    Ok(Json(SessionStartResponse {
        run_id: run.run_id,
        session,
    }))
}

async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .sessions
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session '{id}' not found")))
}

#[derive(Debug, Deserialize, Default)]
struct StopBody {
    #[serde(default)]
    force: bool,
}

async fn session_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StopBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    // The body is optional; a missing or empty one means a polite stop.
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    state.sessions.stop_session(&id, force).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct WriteBody {
    text: String,
    #[serde(default)]
    submit: bool,
}

async fn session_write(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .sessions
        .write_to_session(&id, &body.text, body.submit)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct SendKeysBody {
    keys: String,
}

async fn session_send_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendKeysBody>,
) -> Result<Json<Value>, ApiError> {
    state.sessions.send_keys(&id, &body.keys).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct SessionListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn sessions_list(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let page = state
        .sessions
        .list_sessions(status, query.offset.unwrap_or(0), query.limit)
        .await;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn session_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let stream_raw = query.stream.as_deref().unwrap_or("stdout");
    let stream = StreamSelector::parse(stream_raw)
        .ok_or_else(|| ApiError::validation(format!("unknown stream '{stream_raw}'")))?;
    let offset = query.offset.unwrap_or(0);
    let limit = query
        .limit
        .unwrap_or(LOG_LIMIT_DEFAULT)
        .clamp(1, companion_runtime::ring::OUTPUT_LIMIT_CHARS);

    match state.sessions.session_log(&id, stream, offset, limit).await? {
        companion_runtime::SessionLog::Single(slice) => {
            Ok(Json(serde_json::to_value(slice).map_err(|err| {
                ApiError::Internal(err.to_string())
            })?))
        }
        companion_runtime::SessionLog::Both { stdout, stderr } => Ok(Json(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn session_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(EVENTS_LIMIT_DEFAULT).clamp(1, 500);
    let events = state
        .sessions
        .events_after(query.after.unwrap_or(0), limit)
        .await;
    let latest = state.sessions.latest_event_cursor().await;
    Json(serde_json::json!({ "events": events, "latestCursor": latest }))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunsQuery {
    #[serde(rename = "type", default)]
    run_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn runs_list(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let run_type = match query.run_type.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            RunType::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown run type '{raw}'")))?,
        ),
        None => None,
    };
    let run_state = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            RunState::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown run state '{raw}'")))?,
        ),
        None => None,
    };
    let page = state
        .runs
        .list(RunFilter {
            run_type,
            state: run_state,
            offset: query.offset.unwrap_or(0),
            limit: query.limit,
        })
        .await;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn runs_diagnostics(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> impl IntoResponse {
    Json(state.runs.diagnostics(query.limit).await)
}

async fn runs_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .runs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run '{id}' not found")))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateApprovalBody {
    #[serde(default)]
    request_id: Option<String>,
    conversation_id: String,
    tool_name: String,
    #[serde(default)]
    tool_preview: String,
    #[serde(default)]
    risk_level: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    ttl_ms: Option<i64>,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
}

async fn approval_create(
    State(state): State<AppState>,
    Json(body): Json<CreateApprovalBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.conversation_id.trim().is_empty() {
        return Err(ApiError::validation("conversationId is required"));
    }
    if body.tool_name.trim().is_empty() {
        return Err(ApiError::validation("toolName is required"));
    }
    let expires_at = body
        .expires_at
        .or_else(|| body.ttl_ms.map(|ttl| now_ms() + ttl.max(0)));
    let record = state
        .approvals
        .create(NewApproval {
            request_id: body.request_id,
            conversation_id: body.conversation_id,
            tool_name: body.tool_name,
            tool_preview: body.tool_preview,
            risk_level: body.risk_level,
            channels: body.channels,
            expires_at,
            meta: body.meta,
        })
        .await;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn approvals_pending(State(state): State<AppState>) -> Json<Value> {
    let approvals = state.approvals.list_pending().await;
    Json(serde_json::json!({ "approvals": approvals }))
}

async fn approval_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .approvals
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("approval '{id}' not found")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    resolution: String,
    #[serde(default)]
    resolved_by: Option<String>,
}

async fn approval_resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolution = Resolution::parse(&body.resolution)
        .ok_or_else(|| ApiError::validation(format!("unknown resolution '{}'", body.resolution)))?;
    state
        .approvals
        .resolve(&id, resolution, body.resolved_by)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("approval '{id}' not found")))
}

// ---------------------------------------------------------------------------
// Tool servers
// ---------------------------------------------------------------------------

async fn mcp_servers(State(state): State<AppState>) -> Json<Value> {
    let servers = state.supervisor.list_servers().await;
    Json(serde_json::json!({ "servers": servers }))
}

async fn mcp_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.restart_server(&name).await?;
    Ok(Json(serde_json::json!({ "ok": true, "server": name })))
}

async fn mcp_tools(State(state): State<AppState>) -> Json<Value> {
    let tools = state.supervisor.list_tools().await;
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
struct ToolCallBody {
    server: String,
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
}

async fn mcp_call(
    State(state): State<AppState>,
    Json(body): Json<ToolCallBody>,
) -> impl IntoResponse {
    let arguments = body.arguments.unwrap_or_else(|| Value::Object(Map::new()));
    let outcome = state
        .supervisor
        .call_tool(&body.server, &body.tool, arguments)
        .await;
    Json(outcome)
}

// ---------------------------------------------------------------------------
// Permission policy
// ---------------------------------------------------------------------------

async fn policy_get(State(state): State<AppState>) -> Json<PolicyConfig> {
    Json(state.policy.read().await.to_config())
}

async fn policy_set(
    State(state): State<AppState>,
    Json(body): Json<PolicyConfig>,
) -> Result<Json<PolicyConfig>, ApiError> {
    let normalized = PermissionPolicy::normalize(&body, true, state.paths.home_dir())?;
    let config = normalized.to_config();
    state
        .config
        .update(|file| file.permission_policy = config.clone())
        .await;
    *state.policy.write().await = normalized;
    info!(mode = %config.mode, roots = config.roots.len(), "permission policy updated");
    Ok(Json(config))
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

async fn cron_jobs(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.cron.list_jobs().await;
    Json(serde_json::json!({ "jobs": jobs }))
}

async fn cron_upsert(
    State(state): State<AppState>,
    Json(job): Json<CronJob>,
) -> Result<Json<CronJob>, ApiError> {
    if job.id.trim().is_empty() {
        return Err(ApiError::validation("job id is required"));
    }
    if !is_schedulable(&job.schedule) {
        return Err(ApiError::validation(
            "schedule cannot be armed (check hour, minute and tz)",
        ));
    }
    let stored = state.cron.upsert_job(job).await;
    state.scheduler.schedule_job(&stored).await;
    Ok(Json(stored))
}

async fn cron_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.cron.remove_job(&id).await {
        return Err(ApiError::not_found(format!("cron job '{id}' not found")));
    }
    state.scheduler.unschedule(&id).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn cron_pending(State(state): State<AppState>) -> Json<Value> {
    let pending = state.cron.pending_runs().await;
    Json(serde_json::json!({ "pending": pending }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    task_ids: Vec<String>,
}

async fn cron_ack(
    State(state): State<AppState>,
    Json(body): Json<AckBody>,
) -> Json<Value> {
    let removed = state.cron.ack_pending_runs(&body.task_ids).await;
    Json(serde_json::json!({ "removed": removed }))
}

// ---------------------------------------------------------------------------
// Skill assets
// ---------------------------------------------------------------------------

async fn skill_extract(
    State(state): State<AppState>,
    Json(bundle): Json<SkillBundle>,
) -> Result<Json<Value>, ApiError> {
    let written =
        companion_skills::extract_bundle(&state.paths.skills_dir(), &bundle).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "name": bundle.name,
        "files": written.len(),
    })))
}

async fn skill_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    companion_skills::delete_skill(&state.paths.skills_dir(), &name).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
