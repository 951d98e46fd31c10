//! Liveness supervision: hard-timeout sweep and periodic health evaluation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broadcaster::Broadcaster;
use super::session::ZombieReason;

/// Counts from one supervision pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub flagged: usize,
    pub evicted: usize,
}

/// Flag and evict every non-zombie session that has written nothing for
/// longer than the hard timeout.
///
/// Sessions already flagged are left alone so their grace period runs out.
pub fn sweep_timeouts(broadcaster: &Broadcaster, now: Instant) -> SweepReport {
    let hard_timeout = broadcaster.config().hard_timeout;
    let mut report = SweepReport::default();

    for session in broadcaster.sessions() {
        if session.is_zombie() || session.idle_for(now) <= hard_timeout {
            continue;
        }
        if broadcaster.flag_zombie(session.id(), ZombieReason::Timeout) {
            report.flagged += 1;
        }
        if broadcaster.evict(session.id(), ZombieReason::Timeout) {
            report.evicted += 1;
        }
    }
    report
}

/// Flag unhealthy sessions and evict zombies whose grace period has elapsed.
pub fn evaluate(broadcaster: &Broadcaster, now: Instant) -> SweepReport {
    let config = *broadcaster.config();
    let mut report = SweepReport::default();

    for session in broadcaster.sessions() {
        if let Some(reason) = session.zombie_reason() {
            if session.grace_elapsed(now, config.zombie_grace)
                && broadcaster.evict(session.id(), reason)
            {
                report.evicted += 1;
            }
            continue;
        }
        if let Some(reason) = session.evaluate_health(now, &config) {
            if broadcaster.flag_zombie(session.id(), reason) {
                report.flagged += 1;
            }
        }
    }

    broadcaster.record_health_check();
    report
}

async fn run_every<F>(
    name: &'static str,
    period: Duration,
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
    pass: F,
) where
    F: Fn(&Broadcaster, Instant) -> SweepReport,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task = name, period_secs = period.as_secs(), "liveness task started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = pass(&broadcaster, Instant::now());
                if report != SweepReport::default() {
                    info!(task = name, flagged = report.flagged, evicted = report.evicted, "liveness pass");
                } else {
                    debug!(task = name, "liveness pass found nothing");
                }
            }
        }
    }

    info!(task = name, "liveness task stopped");
}

pub async fn run_timeout_sweep(broadcaster: Arc<Broadcaster>, shutdown: CancellationToken) {
    let period = broadcaster.config().timeout_sweep_interval;
    run_every("timeout_sweep", period, broadcaster, shutdown, sweep_timeouts).await;
}

pub async fn run_health_checks(broadcaster: Arc<Broadcaster>, shutdown: CancellationToken) {
    let period = broadcaster.config().health_check_interval;
    run_every("health_check", period, broadcaster, shutdown, evaluate).await;
}
