//! The pull loop: follow the chain, apply batches, fail over.
//!
//! ```text
//!            ┌──────── non-empty batch: apply, advance, read again ───────┐
//!            ▼                                                            │
//!   Following(url) ── read ──► empty batch: sleep retry_after ────────────┤
//!            │                                                            │
//!            └── error / timeout: mark url down, next url that is up ─────┘
//!                                   │
//!                          none left ▼
//!                              Exhausted ── chain refreshed ──► Following(chain[0])
//!                                        └─ upstream back up ──► Following(first up)
//! ```
//!
//! The loop always reads from the first upstream that is up, so once the
//! health probe brings a preferred upstream back it is picked up on the next
//! read. Only a registry refresh marks the whole chain up again; a probe
//! recovery leaves the upstreams it found down alone.

use super::bootstrap::Bootstrapable;
use super::types::{Progress, PullState};
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::metrics;
use crate::node::NodeStatus;
use crate::pipe::{derive_pipe_state, MessageResults, OffsetName, ReadRequest, Writer};
use crate::upstream::{ChainVersion, LoadBalancer, UpstreamClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

/// Floor for the wait after an empty batch, so an upstream answering
/// `Retry-After: 0` with nothing new cannot make the loop spin.
const MIN_EMPTY_WAIT: Duration = Duration::from_millis(100);

/// Wait after a local write failure.
const LOCAL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one [`PullLoop::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Applied { upstream: Url, count: usize, offset: u64 },
    /// Nothing new; wait this long.
    Idle(Duration),
    FailedOver { from: Url },
    Exhausted,
    Paused,
}

/// Local side of the pipe: where batches land and how far we got.
///
/// Doubles as the pipe's [`Bootstrapable`]: `stop` pauses the loop after the
/// batch in flight, `reset` wipes the log and the cursor.
pub struct PipeControl {
    writer: Arc<dyn Writer>,
    cursor: Option<Arc<CursorStore>>,
    location: String,
    progress: watch::Sender<Progress>,
    paused: watch::Sender<bool>,
    /// Held across read + apply; `stop` takes it to wait out a batch.
    apply_lock: Mutex<()>,
}

impl PipeControl {
    pub fn new(
        writer: Arc<dyn Writer>,
        cursor: Option<Arc<CursorStore>>,
        location: impl Into<String>,
        start: Progress,
    ) -> Self {
        let (progress, _) = watch::channel(start);
        let (paused, _) = watch::channel(false);
        Self {
            writer,
            cursor,
            location: location.into(),
            progress,
            paused,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Write a batch and move the cursor to its highest offset.
    async fn apply(&self, read: MessageResults, upstream: &Url) -> Result<Step> {
        let current = self.progress.borrow().offset;
        let global_latest = read.global_latest_offset;

        let mut messages = read.messages;
        let received = messages.len();
        messages.retain(|m| m.offset.is_some_and(|o| o > current));
        if messages.len() < received {
            debug!(skipped = received - messages.len(), current, "Dropped messages at or below cursor");
        }

        let count = messages.len();
        let offset = messages.iter().filter_map(|m| m.offset).max().unwrap_or(current);
        if count > 0 {
            self.writer.write_messages(messages).await?;
            metrics::record_messages_applied(count);
            if let Some(cursor) = &self.cursor {
                cursor.set(&self.location, offset).await;
            }
            self.writer.write_offset(OffsetName::PipeOffset, offset).await?;
        }
        if let Some(latest) = global_latest {
            self.writer.write_offset(OffsetName::GlobalLatestOffset, latest).await?;
            metrics::set_replication_lag(latest.saturating_sub(offset));
        }
        let pipe_state = derive_pipe_state(offset, global_latest);
        self.writer.write_pipe_state(pipe_state).await?;

        self.progress.send_modify(|p| {
            p.offset = offset;
            p.pipe_state = pipe_state;
            p.global_latest_offset = global_latest;
            p.status = NodeStatus::Following;
        });

        if count > 0 {
            Ok(Step::Applied {
                upstream: upstream.clone(),
                count,
                offset,
            })
        } else {
            Ok(Step::Idle(read.retry_after.max(MIN_EMPTY_WAIT)))
        }
    }
}

impl Bootstrapable for PipeControl {
    fn name(&self) -> &str {
        "pipe"
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.paused.send_replace(true);
            // wait for the batch in flight
            drop(self.apply_lock.lock().await);
            info!("Pipe stopped");
            Ok(())
        })
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.apply_lock.lock().await;
            self.writer.delete_all().await?;
            if let Some(cursor) = &self.cursor {
                cursor.reset(&self.location).await;
                cursor.flush_dirty().await?;
            }
            self.progress.send_replace(Progress::resume(0));
            info!(location = %self.location, "Pipe reset to offset 0");
            Ok(())
        })
    }

    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.paused.send_replace(false);
            info!("Pipe started");
            Ok(())
        })
    }
}

pub struct PullLoop {
    balancer: LoadBalancer,
    client: Arc<dyn UpstreamClient>,
    control: Arc<PipeControl>,
    types: Vec<String>,
    state: watch::Sender<PullState>,
}

impl PullLoop {
    pub fn new(
        balancer: LoadBalancer,
        client: Arc<dyn UpstreamClient>,
        control: Arc<PipeControl>,
        types: Vec<String>,
    ) -> Self {
        let initial = PullState::Following(balancer.services().cloud_url().clone());
        let (state, _) = watch::channel(initial);
        Self {
            balancer,
            client,
            control,
            types,
            state,
        }
    }

    pub fn state(&self) -> PullState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PullState> {
        self.state.subscribe()
    }

    pub fn control(&self) -> &Arc<PipeControl> {
        &self.control
    }

    /// One read from the preferred upstream.
    pub async fn step(&self) -> Result<Step> {
        if self.control.is_paused() {
            return Ok(Step::Paused);
        }

        let instance = match self.balancer.select().await {
            Ok(instance) => instance,
            Err(ReplicationError::NoUpstreamAvailable) => {
                if self.state.send_replace(PullState::Exhausted) != PullState::Exhausted {
                    warn!("Every upstream is down, waiting for the chain to refresh");
                }
                return Ok(Step::Exhausted);
            }
            Err(e) => return Err(e),
        };
        let upstream = instance.url().clone();
        self.state.send_if_modified(|s| {
            let next = PullState::Following(upstream.clone());
            let changed = *s != next;
            if changed {
                info!(upstream = %upstream, "Following upstream");
            }
            *s = next;
            changed
        });

        let _guard = self.control.apply_lock.lock().await;
        if self.control.is_paused() {
            return Ok(Step::Paused);
        }

        let request = ReadRequest::new(self.control.progress().offset, self.types.clone(), &self.control.location);
        let started = Instant::now();
        match self.client.read(&upstream, &request).await {
            Ok(read) => {
                metrics::record_upstream_read(upstream.as_str(), read.messages.len(), started.elapsed());
                instance.record_success();
                self.control.apply(read, &upstream).await
            }
            Err(e) => {
                let error_type = match &e {
                    ReplicationError::UpstreamTimeout { .. } => "timeout",
                    _ => "read",
                };
                metrics::record_upstream_error(upstream.as_str(), error_type);
                warn!(upstream = %upstream, offset = request.offset, error = %e, "Read failed, failing over");
                instance.record_failure();
                Ok(Step::FailedOver { from: upstream })
            }
        }
    }

    /// Leave [`Step::Exhausted`] after the service list changed.
    ///
    /// Returns true if the whole chain was marked up again.
    async fn resume_after(&self, version: ChainVersion, last_refresh: &mut u64) -> bool {
        if version.refreshes == *last_refresh {
            debug!("Upstream recovered, resuming at the first one up");
            return false;
        }
        *last_refresh = version.refreshes;
        self.balancer.services().reset_health().await;
        debug!("Chain refreshed, retrying from the first upstream");
        true
    }

    /// Run until `shutdown_rx` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("pull_loop", location = %self.control.location);

        async move {
            info!(offset = self.control.progress().offset, "Starting pull loop");
            let mut changes = self.balancer.services().subscribe();
            let mut last_refresh = changes.borrow_and_update().refreshes;
            let mut paused_rx = self.control.subscribe_paused();

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let step = match self.step().await {
                    Ok(step) => step,
                    Err(e) => {
                        warn!(error = %e, "Failed to apply batch");
                        Step::Idle(LOCAL_ERROR_BACKOFF)
                    }
                };

                match step {
                    Step::Applied { upstream, count, offset } => {
                        debug!(upstream = %upstream, count, offset, "Applied batch");
                    }
                    Step::FailedOver { .. } => {}
                    Step::Idle(wait) => {
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Step::Exhausted => {
                        // Offset and status stay as they were; the registry
                        // notices through last_seen if this lasts.
                        tokio::select! {
                            changed = changes.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                let version = *changes.borrow_and_update();
                                self.resume_after(version, &mut last_refresh).await;
                            }
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Step::Paused => {
                        tokio::select! {
                            _ = paused_rx.changed() => {}
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            info!(offset = self.control.progress().offset, "Pull loop stopped");
        }
        .instrument(span)
        .await
    }
}
