//! Executing bootstrap instructions from the registry.
//!
//! ```text
//! PIPE / PROVIDER / PIPE_AND_PROVIDER   stop → reset → start
//! *_WITH_DELAY                          stop → reset → wait → start
//! CORRUPTION_RECOVERY                   stop both → wipe corruption → reset both → start both
//! ```
//!
//! A bootstrap runs in its own task so registration keeps reporting while
//! the pipe is rebuilt. Instructions arriving while one is in progress are
//! dropped; the registry consumes a request once it hands it out, so an
//! operator re-queues it if needed.

use crate::error::{BoxFuture, Result};
use crate::metrics;
use crate::registry::BootstrapType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// A component that can be rebuilt from scratch.
pub trait Bootstrapable: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Drop all local state. Only called while stopped.
    fn reset(&self) -> BoxFuture<'_, ()>;

    fn start(&self) -> BoxFuture<'_, ()>;
}

/// Wipes whatever a corrupted node must not carry over.
pub trait Resettable: Send + Sync + 'static {
    fn reset(&self) -> BoxFuture<'_, ()>;
}

pub struct BootstrapDispatcher {
    pipe: Arc<dyn Bootstrapable>,
    provider: Option<Arc<dyn Bootstrapable>>,
    corruption: Option<Arc<dyn Resettable>>,
    delay: Duration,
    running: AtomicBool,
}

impl BootstrapDispatcher {
    pub fn new(pipe: Arc<dyn Bootstrapable>, delay: Duration) -> Self {
        Self {
            pipe,
            provider: None,
            corruption: None,
            delay,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Bootstrapable>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_corruption_manager(mut self, corruption: Arc<dyn Resettable>) -> Self {
        self.corruption = Some(corruption);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start `kind` in the background. Returns false if it was not started.
    pub fn dispatch(self: &Arc<Self>, kind: BootstrapType) -> bool {
        if kind == BootstrapType::None {
            return false;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(bootstrap = %kind, "Bootstrap already in progress, ignoring request");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                if let Err(e) = this.run(kind).await {
                    warn!(error = %e, "Bootstrap failed");
                }
                this.running.store(false, Ordering::Release);
            }
            .instrument(info_span!("bootstrap", kind = %kind)),
        );
        true
    }

    /// Run `kind` to completion.
    ///
    /// Every component that was stopped is started again, also when a stop
    /// or reset step fails; the first error is returned afterwards.
    pub async fn run(&self, kind: BootstrapType) -> Result<()> {
        let targets = self.targets(kind);
        if targets.is_empty() {
            return Ok(());
        }
        info!(bootstrap = %kind, components = ?targets.iter().map(|t| t.name()).collect::<Vec<_>>(), "Bootstrap starting");
        metrics::record_bootstrap(&kind.to_string());

        let mut stopped = Vec::with_capacity(targets.len());
        let prepared = self.stop_and_reset(kind, &targets, &mut stopped).await;

        match &prepared {
            Ok(()) if kind.is_delayed() => {
                info!(delay_secs = self.delay.as_secs(), "Waiting before restart");
                tokio::time::sleep(self.delay).await;
            }
            Ok(()) => {}
            Err(e) => warn!(bootstrap = %kind, error = %e, "Bootstrap aborted, restarting components"),
        }

        let mut restarted = Ok(());
        for target in &stopped {
            if let Err(e) = target.start().await {
                warn!(component = target.name(), error = %e, "Failed to restart component");
                if restarted.is_ok() {
                    restarted = Err(e);
                }
            }
        }

        prepared?;
        restarted?;
        info!(bootstrap = %kind, "Bootstrap complete");
        Ok(())
    }

    async fn stop_and_reset(
        &self,
        kind: BootstrapType,
        targets: &[Arc<dyn Bootstrapable>],
        stopped: &mut Vec<Arc<dyn Bootstrapable>>,
    ) -> Result<()> {
        for target in targets {
            // a failed stop may still have halted part of the component
            stopped.push(Arc::clone(target));
            target.stop().await?;
        }

        if kind == BootstrapType::CorruptionRecovery {
            match &self.corruption {
                Some(corruption) => corruption.reset().await?,
                None => warn!("No corruption manager configured, skipping wipe"),
            }
        }

        for target in targets {
            target.reset().await?;
        }
        Ok(())
    }

    fn targets(&self, kind: BootstrapType) -> Vec<Arc<dyn Bootstrapable>> {
        let mut targets = Vec::with_capacity(2);
        if kind.resets_pipe() {
            targets.push(Arc::clone(&self.pipe));
        }
        if kind.resets_provider() {
            match &self.provider {
                Some(provider) => targets.push(Arc::clone(provider)),
                None => warn!(bootstrap = %kind, "No provider configured, skipping provider bootstrap"),
            }
        }
        targets
    }
}
