//! Async task poller (spec §4.9): provider invocations (video/3D/audio
//! generation) that return an opaque task id are tracked here and polled
//! until they resolve, time out, or the server shuts down.

use std::sync::Arc;
use std::time::Duration;

use agentim_rooms::types::{AsyncTask, Attachment, TaskKey};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a provider's poll call reported back.
pub enum PollOutcome {
    /// Still running; keep polling at the declared interval.
    Pending,
    /// Finished with downloadable media at the given provider URL. The
    /// poller itself runs this through the SSRF-protected, byte-capped
    /// downloader before persisting an attachment (§4.10).
    Media { url: String, filename: String, mime_type: String },
    /// Finished with inline text.
    Text(String),
    Failed(String),
}

/// Opaque provider invocation, out of scope beyond the capability set and
/// poll contract the spec names (§1: "provider-specific API bodies...are
/// opaque invocations").
#[async_trait]
pub trait TaskProvider: Send + Sync {
    async fn poll(&self, task: &AsyncTask) -> PollOutcome;
}

pub enum TaskResolution {
    Media { task: AsyncTask, attachment: Attachment },
    Text { task: AsyncTask, content: String },
    Failed { task: AsyncTask, reason: String },
}

/// Tracks in-flight tasks and enforces the active-task cap (default 100).
/// Each registered task runs as its own cancellation-aware tokio task that
/// polls on `poll_interval_ms` and hard-stops at `max_wait_ms`; resolutions
/// are reported back over `resolutions`.
pub struct TaskPoller {
    active: DashMap<TaskKey, JoinHandle<()>>,
    max_active_tasks: usize,
    max_media_bytes: u64,
    resolutions: tokio::sync::mpsc::UnboundedSender<TaskResolution>,
}

impl TaskPoller {
    pub fn new(
        max_active_tasks: usize,
        max_media_bytes: u64,
    ) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<TaskResolution>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self { active: DashMap::new(), max_active_tasks, max_media_bytes, resolutions: tx }),
            rx,
        )
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Register and start polling a task. Returns `false` (the caller
    /// should fail the invocation) if the active-task cap is already hit.
    pub fn spawn(
        self: &Arc<Self>,
        task: AsyncTask,
        provider: Arc<dyn TaskProvider>,
        mut shutdown: watch::Receiver<bool>,
    ) -> bool {
        if self.active.len() >= self.max_active_tasks {
            warn!(task_id = %task.key.provider_task_id, "active task cap reached, rejecting invocation");
            return false;
        }

        let key = task.key.clone();
        let poller = Arc::clone(self);
        let poll_interval = Duration::from_millis(task.poll_interval_ms);
        let max_wait = Duration::from_millis(task.max_wait_ms);

        let handle = tokio::spawn(async move {
            let deadline = tokio::time::sleep(max_wait);
            tokio::pin!(deadline);
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(task_id = %task.key.provider_task_id, "cancelling poller on shutdown");
                            return;
                        }
                    },
                    _ = &mut deadline => {
                        let _ = poller.resolutions.send(TaskResolution::Failed {
                            task: task.clone(),
                            reason: "Generation failed: timed out".to_string(),
                        });
                        poller.active.remove(&task.key);
                        return;
                    },
                    _ = ticker.tick() => {
                        match provider.poll(&task).await {
                            PollOutcome::Pending => continue,
                            PollOutcome::Media { url, filename, mime_type } => {
                                match agentim_ssrf::download_capped(&url, poller.max_media_bytes).await {
                                    Ok(bytes) => {
                                        let _ = poller.resolutions.send(TaskResolution::Media {
                                            attachment: Attachment {
                                                id: uuid::Uuid::new_v4().to_string(),
                                                filename,
                                                mime_type,
                                                size: bytes.len() as u64,
                                                url,
                                            },
                                            task: task.clone(),
                                        });
                                    },
                                    Err(e) => {
                                        warn!(task_id = %task.key.provider_task_id, error = %e, "media download rejected");
                                        let _ = poller.resolutions.send(TaskResolution::Failed {
                                            task: task.clone(),
                                            reason: format!("Generation failed: {e}"),
                                        });
                                    },
                                }
                                poller.active.remove(&task.key);
                                return;
                            },
                            PollOutcome::Text(content) => {
                                let _ = poller.resolutions.send(TaskResolution::Text { task: task.clone(), content });
                                poller.active.remove(&task.key);
                                return;
                            },
                            PollOutcome::Failed(reason) => {
                                let _ = poller.resolutions.send(TaskResolution::Failed {
                                    task: task.clone(),
                                    reason: format!("Generation failed: {reason}"),
                                });
                                poller.active.remove(&task.key);
                                return;
                            },
                        }
                    },
                }
            }
        });

        self.active.insert(key, handle);
        true
    }

    /// Abort every in-flight poller without persisting state, per §4.9's
    /// shutdown behaviour.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().abort();
        }
        self.active.clear();
    }
}

/// Fans resolved tasks out to the room they were posted in, editing the
/// placeholder status message the (out-of-scope) invocation REST layer
/// created. Runs for the lifetime of the process; the channel only closes
/// when every [`TaskPoller`] handle holding the sender is dropped.
pub async fn drive_resolutions(
    tables: Arc<crate::state::ConnectionTables>,
    mut resolutions: tokio::sync::mpsc::UnboundedReceiver<TaskResolution>,
) {
    while let Some(resolution) = resolutions.recv().await {
        let (room_id, message_id, content, attachments) = match resolution {
            TaskResolution::Media { task, attachment } => {
                (task.room_id, task.status_message_id, String::new(), vec![attachment])
            },
            TaskResolution::Text { task, content } => (task.room_id, task.status_message_id, content, Vec::new()),
            TaskResolution::Failed { task, reason } => (task.room_id, task.status_message_id, reason, Vec::new()),
        };

        let message = agentim_protocol::WireMessage {
            id: message_id,
            room_id: room_id.clone(),
            sender_id: String::new(),
            sender_type: agentim_protocol::SenderType::Agent,
            sender_name: String::new(),
            kind: agentim_protocol::MessageType::AgentResponse,
            content,
            mentions: Vec::new(),
            reply_to_id: None,
            attachments: if attachments.is_empty() {
                None
            } else {
                Some(
                    attachments
                        .into_iter()
                        .map(|a| agentim_protocol::WireAttachment {
                            id: a.id,
                            filename: a.filename,
                            mime_type: a.mime_type,
                            size: a.size,
                            url: a.url,
                        })
                        .collect(),
                )
            },
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        crate::broadcast::broadcast_to_room(
            &tables,
            &room_id,
            &agentim_protocol::ServerToClientFrame::MessageEdited { message },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentim_rooms::types::ProviderCapabilities;

    fn task(poll_ms: u64, max_wait_ms: u64) -> AsyncTask {
        AsyncTask {
            key: TaskKey { service_agent_id: "svc".into(), provider_task_id: "t1".into() },
            room_id: "r1".into(),
            service_agent_name: "video-gen".into(),
            config: serde_json::json!({}),
            provider: ProviderCapabilities { invoke: true, poll: true },
            status_message_id: "m1".into(),
            started_at: chrono::Utc::now(),
            max_wait_ms,
            poll_interval_ms: poll_ms,
        }
    }

    struct AlwaysPending;
    #[async_trait]
    impl TaskProvider for AlwaysPending {
        async fn poll(&self, _task: &AsyncTask) -> PollOutcome {
            PollOutcome::Pending
        }
    }

    struct ImmediateText;
    #[async_trait]
    impl TaskProvider for ImmediateText {
        async fn poll(&self, _task: &AsyncTask) -> PollOutcome {
            PollOutcome::Text("done".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cap_rejects_beyond_max_active_tasks() {
        let (poller, _rx) = TaskPoller::new(1, 1_000_000);
        let (_tx, shutdown) = watch::channel(false);
        assert!(poller.spawn(task(10, 10_000), Arc::new(AlwaysPending), shutdown.clone()));
        assert!(!poller.spawn(task(10, 10_000), Arc::new(AlwaysPending), shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_task_is_reported_and_removed() {
        let (poller, mut rx) = TaskPoller::new(10, 1_000_000);
        let (_tx, shutdown) = watch::channel(false);
        poller.spawn(task(10, 10_000), Arc::new(ImmediateText), shutdown);
        let resolution = rx.recv().await.unwrap();
        assert!(matches!(resolution, TaskResolution::Text { content, .. } if content == "done"));
        tokio::task::yield_now().await;
        assert_eq!(poller.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_task() {
        let (poller, mut rx) = TaskPoller::new(10, 1_000_000);
        let (_tx, shutdown) = watch::channel(false);
        poller.spawn(task(5, 20), Arc::new(AlwaysPending), shutdown);
        let resolution = rx.recv().await.unwrap();
        assert!(matches!(resolution, TaskResolution::Failed { .. }));
    }
}
