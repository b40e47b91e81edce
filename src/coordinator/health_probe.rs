//! Upstream health probing.
//!
//! Every interval each URL of the follow chain gets a `GET pipe/_status`.
//! Failures take an upstream down; a success brings it back up and wakes
//! an exhausted pull loop.

use crate::config::HealthCheckConfig;
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::upstream::{ServiceList, UpstreamClient, UpstreamInstance};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Result of one probe round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub up: usize,
    pub down: usize,
    /// Upstreams that were down before this round.
    pub recovered: usize,
}

/// Probe every upstream once, at most `bulkhead` at a time.
pub async fn probe_all(
    services: &ServiceList,
    client: &Arc<dyn UpstreamClient>,
    bulkhead: &Bulkhead,
    probe_timeout: Duration,
) -> ProbeSummary {
    let instances = services.instances().await;
    let probes = instances
        .iter()
        .map(|instance| probe_one(instance, client, bulkhead, probe_timeout));
    let results = join_all(probes).await;

    let mut summary = ProbeSummary::default();
    for (ok, recovered) in results {
        if ok {
            summary.up += 1;
        } else {
            summary.down += 1;
        }
        if recovered {
            summary.recovered += 1;
        }
    }

    if summary.recovered > 0 {
        services.notify_recovered();
    }
    summary
}

/// Returns (succeeded, came back up).
async fn probe_one(
    instance: &Arc<UpstreamInstance>,
    client: &Arc<dyn UpstreamClient>,
    bulkhead: &Bulkhead,
    probe_timeout: Duration,
) -> (bool, bool) {
    let Ok(_permit) = bulkhead.acquire().await else {
        return (instance.is_up(), false);
    };

    let started = Instant::now();
    let result = tokio::time::timeout(probe_timeout, client.probe(instance.url())).await;
    let ok = matches!(result, Ok(Ok(())));
    metrics::record_health_probe(instance.url().as_str(), ok, started.elapsed());

    if ok {
        (true, instance.record_success())
    } else {
        match result {
            Ok(Err(e)) => debug!(upstream = %instance.url(), error = %e, "Health probe failed"),
            _ => debug!(upstream = %instance.url(), "Health probe timed out"),
        }
        instance.record_failure();
        (false, false)
    }
}

/// Probe on the configured interval until shutdown.
pub async fn run_health_probe(
    services: Arc<ServiceList>,
    client: Arc<dyn UpstreamClient>,
    config: HealthCheckConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    async move {
        let bulkhead = Bulkhead::new(config.max_concurrent);
        let probe_timeout = config.timeout_duration();
        let mut timer = tokio::time::interval(config.interval_duration());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = config.interval_duration().as_millis() as u64,
            max_concurrent = config.max_concurrent,
            "Starting health probe task"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let summary = probe_all(&services, &client, &bulkhead, probe_timeout).await;
                    if summary.recovered > 0 {
                        info!(recovered = summary.recovered, up = summary.up, "Upstreams recovered");
                    } else if summary.up == 0 && summary.down > 0 {
                        warn!(down = summary.down, "No upstream answered its health probe");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Health probe task stopping");
                        break;
                    }
                }
            }
        }
    }
    .instrument(info_span!("health_check"))
    .await
}
