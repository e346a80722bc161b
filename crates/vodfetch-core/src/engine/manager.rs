//! Download Manager - schedules a batch of download tasks
//!
//! The manager owns the shared collaborators (HTTP client, one auth
//! session per provider, the rate controller and the resume store) and
//! injects them into every task it starts. It bounds how many tasks run
//! at once and never lets one task's failure stop its siblings.

use crate::config::state_dir;
use crate::engine::auth::{AuthSession, TokenPlacement, TokenProvider};
use crate::engine::chunk_fetcher::ChunkFetcher;
use crate::engine::download_task::{DownloadTask, TaskEnv, TaskRequest};
use crate::engine::rate_controller::{RateController, RateSettings};
use crate::engine::resume_store::ResumeStore;
use crate::error::EngineError;
use crate::naming;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use vodfetch_types::{
    BatchSummary, EngineConfig, EngineEvent, FailureCategory, PlaylistEntry, ProviderConfig,
    TaskError, TaskInfo, TaskState,
};

/// Build the HTTP client shared by every task
pub fn build_client(config: &EngineConfig) -> Result<Client, EngineError> {
    let idle_per_host = config.host_connection_limit.max(1) * 2;
    Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(idle_per_host)
        .build()
        .map_err(|e| EngineError::Unknown(format!("cannot build HTTP client: {}", e)))
}

struct ProviderSession {
    config: ProviderConfig,
    session: Arc<AuthSession>,
}

/// Tasks that are currently running, keyed by task id
type ActiveTasks = Arc<Mutex<HashMap<Uuid, TaskRequest>>>;

/// Removes a task from the active set when its future ends, panics included
struct ActiveGuard {
    active: ActiveTasks,
    idle: Arc<Notify>,
    id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        active.remove(&self.id);
        if active.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Top-level scheduler for a batch of downloads
pub struct DownloadManager {
    config: Arc<EngineConfig>,
    env: TaskEnv,
    providers: Vec<ProviderSession>,
    /// Tasks waiting for a slot, in enqueue order
    queue: Mutex<VecDeque<TaskInfo>>,
    active: ActiveTasks,
    idle: Arc<Notify>,
    /// Cancelled by `pause()`; replaced once every task has settled
    cancel: Mutex<CancellationToken>,
}

impl DownloadManager {
    /// Create a manager from config: opens the resume store and builds
    /// one auth session per configured provider
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let store = ResumeStore::new(state_dir(&config)).await?;
        let client = build_client(&config)?;
        let skew = Duration::from_secs(config.token_refresh_skew_secs);

        let providers = config
            .providers
            .iter()
            .map(|provider| ProviderSession {
                config: provider.clone(),
                session: Arc::new(AuthSession::for_portal(provider, client.clone(), skew)),
            })
            .collect();

        let config = Arc::new(config);
        let (events, _) = broadcast::channel(1024);
        let env = TaskEnv {
            fetcher: Arc::new(ChunkFetcher::new(client.clone(), &config)),
            rate: Arc::new(RateController::new(RateSettings::from(config.as_ref()))),
            store: Arc::new(store),
            config: Arc::clone(&config),
            client,
            events,
        };

        info!(
            "Download manager ready (state dir {:?}, {} provider(s))",
            env.store.dir(),
            config.providers.len()
        );

        Ok(Self {
            config,
            env,
            providers,
            queue: Mutex::new(VecDeque::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Serve URLs of `provider` with tokens from a custom source
    pub fn register_provider(&mut self, provider: ProviderConfig, tokens: Arc<dyn TokenProvider>) {
        let session = AuthSession::new(
            tokens,
            TokenPlacement::for_provider(&provider),
            Duration::from_secs(provider.token_ttl_secs.max(1)),
            Duration::from_secs(self.config.token_refresh_skew_secs),
        );
        self.providers.retain(|p| p.config.name != provider.name);
        self.providers.push(ProviderSession {
            config: provider,
            session: Arc::new(session),
        });
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.env.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResumeStore {
        &self.env.store
    }

    /// Auth session serving `url`, if any provider claims it
    pub fn session_for(&self, url: &str) -> Option<Arc<AuthSession>> {
        self.providers
            .iter()
            .find(|p| p.config.matches_url(url))
            .map(|p| Arc::clone(&p.session))
    }

    /// Number of tasks waiting for a slot
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queue downloads; a request whose URL and destination are already
    /// queued or running is skipped. Different sources asking for the same
    /// path each get their own file when they start.
    /// Returns the ids of the newly queued tasks.
    pub fn enqueue(
        &self,
        requests: impl IntoIterator<Item = TaskRequest>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let requests: Vec<TaskRequest> = requests.into_iter().collect();
        for request in &requests {
            url::Url::parse(&request.source_url)
                .map_err(|_| EngineError::InvalidUrl(request.source_url.clone()))?;
        }

        let mut ids = Vec::with_capacity(requests.len());
        let mut queue = self.queue.lock();
        let active = self.active.lock();

        for request in requests {
            let known = queue.iter().any(|t| {
                t.source_url == request.source_url && t.destination == request.destination
            }) || active.values().any(|r| *r == request);
            if known {
                warn!("{} is already queued for {:?}, skipping", request.source_url, request.destination);
                continue;
            }

            let info = TaskInfo::new(request.source_url, request.destination);
            let _ = self.env.events.send(EngineEvent::TaskAdded {
                task_id: info.id,
                destination: info.destination.clone(),
                source_url: info.source_url.clone(),
            });
            ids.push(info.id);
            queue.push_back(info);
        }

        info!("Queued {} task(s)", ids.len());
        Ok(ids)
    }

    /// Queue playlist entries under `output_dir`
    pub fn enqueue_entries(
        &self,
        entries: &[PlaylistEntry],
        output_dir: &Path,
    ) -> Result<Vec<Uuid>, EngineError> {
        self.enqueue(entries.iter().map(|entry| {
            TaskRequest::new(
                entry.source_url.clone(),
                naming::destination_for_entry(output_dir, entry),
            )
        }))
    }

    /// Re-queue every task that has a resume record
    pub async fn resume(&self) -> Result<Vec<Uuid>, EngineError> {
        let records = self.env.store.list().await?;
        info!("Found {} resumable task(s)", records.len());
        self.enqueue(
            records
                .into_iter()
                .map(|record| TaskRequest::new(record.source_url, record.destination)),
        )
    }

    /// Run queued tasks, at most `concurrency` at a time, until the queue
    /// drains or the manager is paused
    pub async fn run(&self, concurrency: usize) -> BatchSummary {
        let limit = concurrency.max(1);
        let cancel = self.cancel.lock().clone();
        let mut join_set: JoinSet<TaskInfo> = JoinSet::new();
        let mut summary = BatchSummary::default();
        let mut reported: HashSet<String> = HashSet::new();

        info!("Running {} queued task(s), {} at a time", self.queued(), limit);

        loop {
            while join_set.len() < limit {
                // pause() cancels under this lock, so a task is either never
                // popped or already visible in `active` when it looks
                let mut queue = self.queue.lock();
                if cancel.is_cancelled() {
                    break;
                }
                let Some(info) = queue.pop_front() else {
                    break;
                };
                let auth = self.session_for(&info.source_url);

                if let Some(session) = auth.as_ref().filter(|s| s.is_failed()) {
                    drop(queue);
                    // No new starts for a provider whose credentials were rejected
                    self.fail_unstarted(info, session, &mut reported);
                    summary.failed += 1;
                    continue;
                }

                self.active.lock().insert(
                    info.id,
                    TaskRequest::new(info.source_url.clone(), info.destination.clone()),
                );
                drop(queue);
                let guard = ActiveGuard {
                    active: Arc::clone(&self.active),
                    idle: Arc::clone(&self.idle),
                    id: info.id,
                };
                let task = DownloadTask::new(info, self.env.clone(), auth, cancel.child_token());
                join_set.spawn(async move {
                    let _guard = guard;
                    task.run().await
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok(info) => {
                    match info.state {
                        TaskState::Completed => summary.succeeded += 1,
                        TaskState::Paused => summary.paused += 1,
                        _ => summary.failed += 1,
                    }
                    if info.state == TaskState::Failed {
                        self.report_auth_failure(&info, &mut reported);
                    }
                }
                Err(e) => {
                    error!("Download task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Batch finished: {} succeeded, {} failed, {} paused",
            summary.succeeded, summary.failed, summary.paused
        );
        let _ = self.env.events.send(EngineEvent::BatchCompleted {
            succeeded: summary.succeeded,
            failed: summary.failed,
        });
        summary
    }

    /// Cancel every running task and wait until each has checkpointed and
    /// settled. Queued tasks stay queued for the next `run`.
    pub async fn pause(&self) {
        let cancel = self.cancel.lock().clone();
        {
            let _queue = self.queue.lock();
            cancel.cancel();
        }
        info!("Pausing {} active task(s)", self.active.lock().len());

        loop {
            let idle = self.idle.notified();
            if self.active.lock().is_empty() {
                break;
            }
            idle.await;
        }

        *self.cancel.lock() = CancellationToken::new();
        info!("All tasks settled");
    }

    fn fail_unstarted(
        &self,
        mut info: TaskInfo,
        session: &AuthSession,
        reported: &mut HashSet<String>,
    ) {
        let error = TaskError {
            category: FailureCategory::Auth,
            message: format!("provider {} rejected its credentials", session.provider_name()),
        };
        warn!(task_id = %info.id, "Not starting {:?}: {}", info.destination, error.message);
        info.state = TaskState::Failed;
        info.last_error = Some(error.clone());
        let _ = self.env.events.send(EngineEvent::TaskStateChanged {
            task_id: info.id,
            new_state: TaskState::Failed,
            error: Some(error.clone()),
        });
        self.announce_provider_failure(session, &error.message, reported);
    }

    fn report_auth_failure(&self, info: &TaskInfo, reported: &mut HashSet<String>) {
        let Some(error) = info.last_error.as_ref() else {
            return;
        };
        if error.category != FailureCategory::Auth {
            return;
        }
        if let Some(session) = self.session_for(&info.source_url).filter(|s| s.is_failed()) {
            self.announce_provider_failure(&session, &error.message, reported);
        }
    }

    /// One ProviderAuthFailed per provider and run
    fn announce_provider_failure(
        &self,
        session: &AuthSession,
        message: &str,
        reported: &mut HashSet<String>,
    ) {
        let provider = session.provider_name().to_string();
        if reported.insert(provider.clone()) {
            error!("Provider {} failed authentication: {}", provider, message);
            let _ = self.env.events.send(EngineEvent::ProviderAuthFailed {
                provider,
                message: message.to_string(),
            });
        }
    }
}
