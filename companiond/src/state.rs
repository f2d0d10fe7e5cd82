use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use companion_core::config::ConfigFile;
use companion_core::paths::CompanionPaths;
use companion_core::run::RunState;
use companion_core::time::now_ms;
use companion_core::PermissionPolicy;
use companion_mcp::ToolServerSupervisor;
use companion_runtime::{SessionConfig, SessionManager};
use companion_scheduler::Scheduler;
use companion_store::{ApprovalStore, ConfigStore, CronStore, RunStore, UpdateRun};

use crate::auth::AuthGuard;

/// Everything the HTTP handlers can reach: the stores, the policy, the
/// supervisor, the session runtime and the scheduler, behind one cheaply
/// clonable handle. Constructed at startup, torn down at shutdown.
#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

pub struct AppStateInner {
    pub version: &'static str,
    pub started_at: i64,
    pub paths: CompanionPaths,
    pub config: ConfigStore,
    pub runs: RunStore,
    pub approvals: ApprovalStore,
    pub cron: CronStore,
    pub policy: RwLock<PermissionPolicy>,
    pub supervisor: Arc<ToolServerSupervisor>,
    pub sessions: SessionManager,
    pub scheduler: Scheduler,
    pub auth: AuthGuard,
    pub run_index: Arc<Mutex<HashMap<String, String>>>,
}

impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppState {
    /// Assemble the daemon state from a loaded config. The session exit
    /// listener that closes out run records is installed here, before any
    /// session can start.
    pub async fn build(
        paths: CompanionPaths,
        config_store: ConfigStore,
        config: &ConfigFile,
        token: String,
    ) -> Self {
        let policy = match PermissionPolicy::normalize(
            &config.permission_policy,
            false,
            paths.home_dir(),
        ) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(error = %err, "config policy unusable, falling back to workspace with no roots");
                PermissionPolicy::Workspace { roots: Vec::new() }
            }
        };

        let runs = RunStore::new(paths.runs_file());
        let approvals = ApprovalStore::new(paths.approvals_file());
        let cron = CronStore::new(paths.cron_file());
        let scheduler = Scheduler::new(cron.clone());

        let servers: HashMap<_, _> = config
            .runnable_servers()
            .map(|(name, server)| (name.clone(), server.clone()))
            .collect();
        let skipped = config.mcp_servers.len() - servers.len();
        if skipped > 0 {
            warn!(skipped, "ignoring tool server entries without a command");
        }
        let supervisor = Arc::new(ToolServerSupervisor::new(servers));

        let sessions = SessionManager::new(SessionConfig::default());
        let run_index: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

        install_exit_listener(&sessions, runs.clone(), Arc::clone(&run_index)).await;

        let state = Self(Arc::new(AppStateInner {
            version: env!("CARGO_PKG_VERSION"),
            started_at: now_ms(),
            paths,
            config: config_store,
            runs,
            approvals,
            cron,
            policy: RwLock::new(policy),
            supervisor,
            sessions,
            scheduler,
            auth: AuthGuard::new(token),
            run_index,
        }));
        state.sessions.start_pruner().await;
        state
    }

    /// Orderly teardown: detach the exit listener, stop the pruner and kill
    /// live sessions, cancel timers, close tool servers, flush every store.
    pub async fn shutdown(&self) {
        info!("daemon shutting down");
        self.sessions.clear_exit_listeners().await;
        self.sessions.shutdown().await;
        self.scheduler.shutdown().await;
        self.supervisor.shutdown_all().await;
        for (name, outcome) in [
            ("runs", self.runs.flush().await),
            ("approvals", self.approvals.flush().await),
            ("cron", self.cron.flush().await),
            ("config", self.config.flush().await),
        ] {
            if let Err(err) = outcome {
                warn!(store = name, error = %err, "store flush failed during shutdown");
            }
        }
    }
}

/// Mirror every session exit into its run record, looked up through the
/// `sessionId → runId` index the start handler populates.
async fn install_exit_listener(
    sessions: &SessionManager,
    runs: RunStore,
    run_index: Arc<Mutex<HashMap<String, String>>>,
) {
    sessions
        .add_exit_listener(move |snapshot| {
            let runs = runs.clone();
            let run_index = Arc::clone(&run_index);
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                let run_id = run_index.lock().await.remove(&snapshot.id);
                let Some(run_id) = run_id else {
                    return;
                };
                let succeeded = snapshot.exit_code == Some(0) && !snapshot.timed_out;
                let state = if succeeded {
                    RunState::Done
                } else {
                    RunState::Failed
                };
                let summary = if snapshot.timed_out {
                    format!("session timed out after {}ms", snapshot.duration_ms.unwrap_or(0))
                } else {
                    format!("session exited with code {}", snapshot.exit_code.unwrap_or(-1))
                };
                let error = (!succeeded).then(|| summary.clone());
                let updated = runs
                    .update(
                        &run_id,
                        UpdateRun {
                            state: Some(state),
                            summary: Some(summary),
                            error,
                            meta: None,
                        },
                    )
                    .await;
                if updated.is_none() {
                    warn!(run = %run_id, session = %snapshot.id, "run record missing on session exit");
                }
            });
        })
        .await;
}
