//! Heartbeat sending.
//!
//! Once a remote worker accepts an operation it reports progress by POSTing
//! callback messages to the orchestrator until it reaches a final status.
//! [`HeartbeatSender`] implements the sending side: interim statuses
//! (`running`, `failed`) are resent on a fixed cadence until superseded,
//! final statuses (`success`, `error`) are delivered with a single retry and
//! end the loop. A status change cancels the in-flight resend loop and
//! restarts it; only one loop is ever active per operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::HeartbeatConfig;
use crate::error::ReconcilerError;
use crate::model::CallbackStatus;

/// Wire format of one heartbeat callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub status: CallbackStatus,
    /// Error text for `failed`/`error` statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Deduplication token; constant across resends of one status, fresh on
    /// every status change.
    #[serde(rename = "retryID")]
    pub retry_id: String,
    /// Milliseconds spent processing so far.
    #[serde(rename = "processingDuration")]
    pub processing_duration: i64,
}

/// Trait for delivering callback messages to the orchestrator.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn callback(&self, message: CallbackMessage) -> anyhow::Result<()>;
}

/// Delivers callbacks by POSTing to the operation's callback URL.
pub struct RemoteCallbackHandler {
    callback_url: String,
    client: reqwest::Client,
}

impl RemoteCallbackHandler {
    pub fn new(callback_url: String, client: reqwest::Client) -> Self {
        Self {
            callback_url,
            client,
        }
    }
}

#[async_trait]
impl CallbackHandler for RemoteCallbackHandler {
    async fn callback(&self, message: CallbackMessage) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.callback_url)
            .json(&message)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "callback to '{}' rejected with HTTP {}",
                self.callback_url,
                response.status()
            );
        }
        Ok(())
    }
}

/// Delivers callbacks to a closure; used by the local runner and tests.
pub struct FnCallbackHandler<F> {
    handler: F,
}

impl<F> FnCallbackHandler<F>
where
    F: Fn(CallbackMessage) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> CallbackHandler for FnCallbackHandler<F>
where
    F: Fn(CallbackMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn callback(&self, message: CallbackMessage) -> anyhow::Result<()> {
        (self.handler)(message)
    }
}

#[derive(Clone)]
struct StatusUpdate {
    status: Option<CallbackStatus>,
    reason: Option<String>,
    retry_id: String,
}

/// Sending side of the heartbeat protocol for one operation.
pub struct HeartbeatSender {
    tx: watch::Sender<StatusUpdate>,
    closed: Arc<AtomicBool>,
    loop_handle: JoinHandle<()>,
}

impl HeartbeatSender {
    /// Start the resend loop. No message is sent until the first status
    /// change.
    pub fn start(config: HeartbeatConfig, handler: Arc<dyn CallbackHandler>) -> Self {
        let (tx, rx) = watch::channel(StatusUpdate {
            status: None,
            reason: None,
            retry_id: String::new(),
        });
        let closed = Arc::new(AtomicBool::new(false));
        let loop_handle = tokio::spawn(run_loop(config, handler, rx, Arc::clone(&closed)));
        Self {
            tx,
            closed,
            loop_handle,
        }
    }

    pub fn running(&self) -> anyhow::Result<()> {
        self.change_status(CallbackStatus::Running, None)
    }

    pub fn failed(&self, reason: impl Into<String>) -> anyhow::Result<()> {
        self.change_status(CallbackStatus::Failed, Some(reason.into()))
    }

    pub fn success(&self) -> anyhow::Result<()> {
        self.change_status(CallbackStatus::Success, None)
    }

    pub fn error(&self, reason: impl Into<String>) -> anyhow::Result<()> {
        self.change_status(CallbackStatus::Error, Some(reason.into()))
    }

    /// Whether the sender stopped (final status delivered or timeout
    /// elapsed).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the resend loop to stop.
    pub async fn join(self) {
        let _ = self.loop_handle.await;
    }

    fn change_status(
        &self,
        status: CallbackStatus,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!(ReconcilerError::ContextClosed {
                status: status.to_string(),
            });
        }
        self.tx
            .send(StatusUpdate {
                status: Some(status),
                reason,
                retry_id: Uuid::now_v7().to_string(),
            })
            .map_err(|_| {
                ReconcilerError::ContextClosed {
                    status: status.to_string(),
                }
                .into()
            })
    }
}

async fn run_loop(
    config: HeartbeatConfig,
    handler: Arc<dyn CallbackHandler>,
    mut rx: watch::Receiver<StatusUpdate>,
    closed: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    loop {
        let update = rx.borrow_and_update().clone();

        let Some(status) = update.status else {
            // nothing reported yet; wait for the first status change
            tokio::select! {
                _ = &mut deadline => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        };

        let message = CallbackMessage {
            status,
            error: update.reason.clone(),
            retry_id: update.retry_id.clone(),
            processing_duration: started.elapsed().as_millis() as i64,
        };

        if status.is_final() {
            if let Err(err) = handler.callback(message.clone()).await {
                tracing::warn!(status = %status, error = %err, "final heartbeat failed, retrying once");
                tokio::time::sleep(config.interval).await;
                if let Err(err) = handler.callback(message).await {
                    tracing::warn!(status = %status, error = %err, "final heartbeat lost");
                }
            }
            break;
        }

        if let Err(err) = handler.callback(message).await {
            tracing::warn!(status = %status, error = %err, "interim heartbeat failed");
        }

        // three-way wait: resend tick, status change, overall deadline
        tokio::select! {
            _ = &mut deadline => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
    closed.store(true, Ordering::SeqCst);
}
