//! Registry and lifecycle owner for configured tool servers: spawn,
//! handshake, tool discovery, dispatch, restart, teardown.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use companion_core::config::ToolServerConfig;
use companion_core::time::now_ms;

use crate::protocol::{InitializeParams, ToolCallParams, ToolDescriptor};
use crate::transport::{StdioTransport, DEFAULT_REQUEST_TIMEOUT};
use crate::ToolServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Connected,
    Disconnected,
    Error,
}

struct ServerEntry {
    config: ToolServerConfig,
    status: ServerStatus,
    transport: Option<Arc<StdioTransport>>,
    tools: Vec<ToolDescriptor>,
    last_error: Option<String>,
    started_at: Option<i64>,
    capabilities: Option<Value>,
    starting: bool,
    // Bumped on every start/stop so stale exit watchers can tell they are
    // observing a previous incarnation.
    epoch: u64,
}

impl ServerEntry {
    fn new(config: ToolServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            transport: None,
            tools: Vec::new(),
            last_error: None,
            started_at: None,
            capabilities: None,
            starting: false,
            epoch: 0,
        }
    }
}

/// Snapshot of one server for listings and health output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// Tail of the child's stderr ring, for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

/// A discovered tool tagged with the server that owns it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedTool {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result object for `callTool`; transport and lookup failures land in
/// `error` rather than being raised.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: None,
            is_error: None,
            error: Some(error.into()),
        }
    }
}

pub struct ToolServerSupervisor {
    entries: Arc<RwLock<HashMap<String, ServerEntry>>>,
}

impl ToolServerSupervisor {
    pub fn new(configs: HashMap<String, ToolServerConfig>) -> Self {
        let entries = configs
            .into_iter()
            .map(|(name, config)| (name, ServerEntry::new(config)))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Spawn and handshake one server. A concurrent second call for the same
    /// name fails fast; an already-running server is stopped first.
    pub async fn start_server(&self, name: &str) -> Result<(), ToolServerError> {
        let (config, previous, epoch) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ToolServerError::ServerNotFound(name.to_string()))?;
            if entry.starting {
                return Err(ToolServerError::AlreadyStarting(name.to_string()));
            }
            entry.starting = true;
            entry.status = ServerStatus::Starting;
            entry.tools.clear();
            entry.epoch += 1;
            (entry.config.clone(), entry.transport.take(), entry.epoch)
        };

        if let Some(previous) = previous {
            previous.close().await;
        }

        match self.connect(name, &config).await {
            Ok((transport, capabilities, tools)) => {
                let installed = {
                    let mut entries = self.entries.write().await;
                    match entries.get_mut(name) {
                        // A stop that raced this start bumps the epoch; the
                        // superseded incarnation must not be installed.
                        Some(entry) if entry.epoch == epoch => {
                            entry.starting = false;
                            entry.status = ServerStatus::Connected;
                            entry.transport = Some(Arc::clone(&transport));
                            entry.tools = tools;
                            entry.capabilities = capabilities;
                            entry.started_at = Some(now_ms());
                            entry.last_error = None;
                            true
                        }
                        _ => false,
                    }
                };
                if !installed {
                    transport.close().await;
                    return Err(ToolServerError::Closed);
                }
                info!(server = %name, "tool server connected");
                self.watch_exit(name.to_string(), epoch, transport);
                Ok(())
            }
            Err(err) => {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(name) {
                    entry.starting = false;
                    entry.status = ServerStatus::Error;
                    entry.last_error = Some(err.to_string());
                }
                warn!(server = %name, error = %err, "tool server start failed");
                Err(err)
            }
        }
    }

    async fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<(Arc<StdioTransport>, Option<Value>, Vec<ToolDescriptor>), ToolServerError> {
        let transport = Arc::new(StdioTransport::spawn(
            name,
            config,
            DEFAULT_REQUEST_TIMEOUT,
            None,
        )?);

        let init = match transport
            .request(
                "initialize",
                Some(serde_json::to_value(InitializeParams::current())?),
            )
            .await
        {
            Ok(init) => init,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };
        let capabilities = init.get("capabilities").cloned();

        // Best effort: a failed write here must not fail the start.
        if let Err(err) = transport.notify("notifications/initialized", None).await {
            debug!(server = %name, error = %err, "initialized notification failed");
        }

        let mut tools = Vec::new();
        let advertises_tools = capabilities
            .as_ref()
            .is_some_and(|caps| caps.get("tools").is_some());
        if advertises_tools {
            match transport.request("tools/list", None).await {
                Ok(result) => {
                    let listed = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
                    match serde_json::from_value::<Vec<ToolDescriptor>>(listed) {
                        Ok(parsed) => tools = parsed,
                        Err(err) => {
                            warn!(server = %name, error = %err, "could not parse tools/list result")
                        }
                    }
                }
                Err(err) => warn!(server = %name, error = %err, "tools/list failed"),
            }
        }

        Ok((transport, capabilities, tools))
    }

    /// Flip the entry to disconnected when this incarnation's child exits
    /// outside of an explicit stop/restart.
    fn watch_exit(&self, name: String, epoch: u64, transport: Arc<StdioTransport>) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let code = transport.wait_exit().await;
            let mut entries = entries.write().await;
            let Some(entry) = entries.get_mut(&name) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.status = ServerStatus::Disconnected;
            entry.tools.clear();
            entry.transport = None;
            if code != 0 {
                entry.last_error = Some(format!("exited with code {code}"));
            }
            warn!(server = %name, code, "tool server exited unexpectedly");
        });
    }

    pub async fn stop_server(&self, name: &str) -> Result<(), ToolServerError> {
        let transport = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ToolServerError::ServerNotFound(name.to_string()))?;
            entry.status = ServerStatus::Stopped;
            entry.starting = false;
            entry.tools.clear();
            entry.capabilities = None;
            entry.epoch += 1;
            entry.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
            info!(server = %name, "tool server stopped");
        }
        Ok(())
    }

    pub async fn restart_server(&self, name: &str) -> Result<(), ToolServerError> {
        self.stop_server(name).await?;
        self.start_server(name).await
    }

    /// Start every configured server concurrently; one failure does not abort
    /// the others. Returns per-server outcomes.
    pub async fn start_all(self: &Arc<Self>) -> Vec<(String, Result<(), ToolServerError>)> {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut set = JoinSet::new();
        for name in names {
            let supervisor = Arc::clone(self);
            set.spawn(async move {
                let outcome = supervisor.start_server(&name).await;
                (name, outcome)
            });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.stop_server(&name).await {
                warn!(server = %name, error = %err, "failed to stop tool server");
            }
        }
    }

    /// Verify the server is connected and the tool exists, then dispatch
    /// `tools/call`. Failures come back as `{ok: false, error}`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> ToolCallOutcome {
        let transport = {
            let entries = self.entries.read().await;
            let Some(entry) = entries.get(server) else {
                return ToolCallOutcome::failure(format!("unknown tool server '{server}'"));
            };
            if entry.status != ServerStatus::Connected {
                return ToolCallOutcome::failure(format!("tool server '{server}' is not connected"));
            }
            if !entry.tools.iter().any(|t| t.name == tool) {
                return ToolCallOutcome::failure(format!(
                    "tool '{tool}' not found on server '{server}'"
                ));
            }
            match &entry.transport {
                Some(transport) => Arc::clone(transport),
                None => {
                    return ToolCallOutcome::failure(format!(
                        "tool server '{server}' is not connected"
                    ))
                }
            }
        };

        let params = ToolCallParams {
            name: tool.to_string(),
            arguments,
        };
        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(err) => return ToolCallOutcome::failure(err.to_string()),
        };
        match transport.request("tools/call", Some(params)).await {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                ToolCallOutcome {
                    ok: !is_error,
                    content: result.get("content").cloned(),
                    is_error: Some(is_error),
                    error: None,
                }
            }
            Err(err) => ToolCallOutcome::failure(err.to_string()),
        }
    }

    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let entries = self.entries.read().await;
        let mut summaries = Vec::with_capacity(entries.len());
        for (name, entry) in entries.iter() {
            let stderr_tail = match &entry.transport {
                Some(transport) => {
                    let tail = transport.stderr_tail().await;
                    (!tail.is_empty()).then_some(tail)
                }
                None => None,
            };
            summaries.push(ServerSummary {
                name: name.clone(),
                status: entry.status,
                tool_count: entry.tools.len(),
                error: entry.last_error.clone(),
                started_at: entry.started_at,
                stderr_tail,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn list_tools(&self) -> Vec<TaggedTool> {
        let entries = self.entries.read().await;
        let mut tools = Vec::new();
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        for name in names {
            if let Some(entry) = entries.get(name) {
                for tool in &entry.tools {
                    tools.push(TaggedTool {
                        server: name.clone(),
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.input_schema.clone(),
                    });
                }
            }
        }
        tools
    }

    /// `(server_count, connected_tool_count)` for the health endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let entries = self.entries.read().await;
        let servers = entries.len();
        let tools = entries.values().map(|e| e.tools.len()).sum();
        (servers, tools)
    }
}
