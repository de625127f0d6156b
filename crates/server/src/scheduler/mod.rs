// Debounced analysis scheduler.
//
// One task owns the debouncer and the job queue; sockets talk to it over a
// command channel. `immediate` requests enqueue at once, `auto` requests
// arm the per-(connection, file) debounce entry and only the last snapshot
// in the window is submitted. Running jobs are capped; everything beyond
// the cap waits in FIFO order. Under sustained overload the queue drains
// strictly oldest-first, so fresh jobs can starve. Accepted limitation.

pub mod debounce;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use atelier_common::protocol::ServerMessage;
use atelier_common::types::{Capability, TriggerMode};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastFanout;
use crate::engine::AnalysisEngine;
use crate::error::ErrorCode;
use crate::registry::ConnectionRegistry;

pub use debounce::{AnalysisRequest, DebounceConfig, Debouncer};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: DebounceConfig,
    /// Ceiling on concurrently running jobs.
    pub max_running: usize,
    /// Per-job timeout for the engine call.
    pub engine_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            max_running: 3,
            engine_timeout: Duration::from_secs(180),
        }
    }
}

/// Forward-only job lifecycle: queued → running → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub workspace_id: Option<String>,
    pub file_path: String,
    pub content: String,
    pub capabilities: Vec<Capability>,
    pub mode: TriggerMode,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
}

enum Command {
    Request { request: AnalysisRequest, mode: TriggerMode, reply_id: Option<String> },
    CancelConnection(Uuid),
    JobFinished,
}

/// Handle to the scheduler task. Cheap to clone via `Arc`.
pub struct AnalysisScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl AnalysisScheduler {
    pub fn spawn(
        config: SchedulerConfig,
        engine: Arc<dyn AnalysisEngine>,
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<BroadcastFanout>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let core = SchedulerCore {
            debouncer: Debouncer::new(config.debounce.clone()),
            queue: VecDeque::new(),
            running: 0,
            config,
            engine,
            registry,
            fanout,
            commands: commands.clone(),
        };
        tokio::spawn(core.run(receiver));
        Arc::new(Self { commands })
    }

    /// Submit an analysis request. `immediate` enqueues right away; `auto`
    /// arms the debounce window for the (connection, file) key.
    pub fn request(&self, request: AnalysisRequest, mode: TriggerMode, reply_id: Option<String>) {
        let _ = self.commands.send(Command::Request { request, mode, reply_id });
    }

    /// Drop the connection's pending debounce entries and queued jobs.
    /// Running jobs complete, but their result delivery becomes a no-op.
    pub fn cancel_connection(&self, connection_id: Uuid) {
        let _ = self.commands.send(Command::CancelConnection(connection_id));
    }
}

struct SchedulerCore {
    debouncer: Debouncer,
    queue: VecDeque<AnalysisJob>,
    running: usize,
    config: SchedulerConfig,
    engine: Arc<dyn AnalysisEngine>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<BroadcastFanout>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerCore {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                maybe_command = receiver.recv() => {
                    let Some(command) = maybe_command else {
                        // All handles dropped; drain nothing further.
                        break;
                    };
                    match command {
                        Command::Request { request, mode, reply_id } => match mode {
                            TriggerMode::Immediate => self.enqueue(request, mode, reply_id).await,
                            TriggerMode::Auto => self.debouncer.arm(request),
                        },
                        Command::CancelConnection(connection_id) => self.cancel(connection_id),
                        Command::JobFinished => self.running = self.running.saturating_sub(1),
                    }
                }
                _ = sleep_until_std(deadline.unwrap_or_else(std::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    for request in self.debouncer.drain_ready() {
                        self.enqueue(request, TriggerMode::Auto, None).await;
                    }
                }
            }
            self.admit().await;
        }
    }

    async fn enqueue(&mut self, request: AnalysisRequest, mode: TriggerMode, reply_id: Option<String>) {
        // A connection that vanished between request and enqueue gets no job.
        if !self.registry.is_connected(request.connection_id).await {
            debug!(connection_id = %request.connection_id, "dropping analysis request from closed connection");
            return;
        }

        let job = AnalysisJob {
            id: Uuid::new_v4(),
            connection_id: request.connection_id,
            workspace_id: request.workspace_id,
            file_path: request.file_path,
            content: request.content,
            capabilities: request.capabilities,
            mode,
            submitted_at: Utc::now(),
            status: JobStatus::Queued,
        };

        self.registry
            .send_to(
                job.connection_id,
                ServerMessage::AnalysisQueued {
                    id: reply_id,
                    job_id: job.id,
                    file_path: job.file_path.clone(),
                },
            )
            .await;

        self.queue.push_back(job);
    }

    async fn admit(&mut self) {
        while self.running < self.config.max_running {
            let Some(mut job) = self.queue.pop_front() else {
                break;
            };
            // Cancellation may have raced with admission.
            if !self.registry.is_connected(job.connection_id).await {
                continue;
            }
            job.status = JobStatus::Running;
            self.running += 1;

            let engine = Arc::clone(&self.engine);
            let registry = Arc::clone(&self.registry);
            let fanout = Arc::clone(&self.fanout);
            let done = self.commands.clone();
            let timeout = self.config.engine_timeout;
            tokio::spawn(async move {
                process_job(job, engine, timeout, registry, fanout).await;
                let _ = done.send(Command::JobFinished);
            });
        }
    }

    fn cancel(&mut self, connection_id: Uuid) {
        let discarded = self.debouncer.cancel_connection(connection_id);
        let before = self.queue.len();
        self.queue.retain(|job| job.connection_id != connection_id);
        let dropped = before - self.queue.len();
        if discarded + dropped > 0 {
            debug!(
                connection_id = %connection_id,
                pending = discarded,
                queued = dropped,
                "cancelled analysis work for closed connection"
            );
        }
    }
}

fn sleep_until_std(deadline: std::time::Instant) -> tokio::time::Sleep {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
}

/// Run one job against the engine. Result delivery to a connection that has
/// since disconnected is a silent no-op.
async fn process_job(
    mut job: AnalysisJob,
    engine: Arc<dyn AnalysisEngine>,
    timeout: Duration,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<BroadcastFanout>,
) {
    registry
        .send_to(
            job.connection_id,
            ServerMessage::AnalysisStarted { job_id: job.id, file_path: job.file_path.clone() },
        )
        .await;

    let outcome =
        tokio::time::timeout(timeout, engine.analyze(&job.content, &job.capabilities, job.mode))
            .await;

    match outcome {
        Ok(Ok(report)) => {
            job.status = JobStatus::Completed;
            let summary = report.summary();
            let delivered = registry
                .send_to(
                    job.connection_id,
                    ServerMessage::AnalysisCompleted {
                        job_id: job.id,
                        file_path: job.file_path.clone(),
                        report,
                    },
                )
                .await;
            if !delivered {
                debug!(job_id = %job.id, "originator disconnected; analysis result dropped");
            }
            if let Some(workspace_id) = &job.workspace_id {
                fanout
                    .broadcast(
                        workspace_id,
                        &ServerMessage::WorkspaceAnalysisCompleted {
                            workspace_id: workspace_id.clone(),
                            file_path: job.file_path.clone(),
                            summary,
                        },
                        Some(job.connection_id),
                    )
                    .await;
            }
        }
        Ok(Err(engine_error)) => {
            job.status = JobStatus::Failed;
            warn!(job_id = %job.id, error = %engine_error, "analysis engine reported failure");
            registry
                .send_to(
                    job.connection_id,
                    ServerMessage::AnalysisFailed {
                        job_id: job.id,
                        file_path: job.file_path.clone(),
                        code: ErrorCode::EngineFailure.as_str().to_string(),
                        message: engine_error.to_string(),
                    },
                )
                .await;
            notify_workspace_failure(&fanout, &job).await;
        }
        Err(_elapsed) => {
            // The engine call is abandoned, not cancelled; it may still run
            // to completion on its own task.
            job.status = JobStatus::Failed;
            warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "analysis engine timed out");
            registry
                .send_to(
                    job.connection_id,
                    ServerMessage::AnalysisFailed {
                        job_id: job.id,
                        file_path: job.file_path.clone(),
                        code: ErrorCode::EngineTimeout.as_str().to_string(),
                        message: ErrorCode::EngineTimeout.default_message().to_string(),
                    },
                )
                .await;
            notify_workspace_failure(&fanout, &job).await;
        }
    }
}

/// Neutral note to the rest of the workspace; no error detail crosses over.
async fn notify_workspace_failure(fanout: &BroadcastFanout, job: &AnalysisJob) {
    if let Some(workspace_id) = &job.workspace_id {
        fanout
            .broadcast(
                workspace_id,
                &ServerMessage::WorkspaceAnalysisFailed {
                    workspace_id: workspace_id.clone(),
                    file_path: job.file_path.clone(),
                },
                Some(job.connection_id),
            )
            .await;
    }
}
