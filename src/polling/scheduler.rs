//! Adaptive poll loop. One timer at a time: a mode change tears the current
//! interval down and restarts at the new period. Elevation requests from the
//! push path arrive over a watch channel and poll immediately; the task ends
//! on cancellation (visibility pause or session teardown).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{compute_mode, PollingMode};
use crate::config::EngineConfig;
use crate::models::{Device, NormalizedEvent};
use crate::pipeline::HitEventPipeline;
use crate::telemetry::normalizer::normalize;
use crate::telemetry::source::TelemetryProvider;
use crate::{log_debug, log_error, log_info, log_warn};

const ENABLE_LOGS: bool = true;

/// Everything one scheduler generation needs. Built fresh per session (and
/// per visibility resume); never shared across generations.
pub struct PollContext {
    pub provider: Arc<dyn TelemetryProvider>,
    pub devices: Vec<Device>,
    pub pipeline: Arc<Mutex<HitEventPipeline>>,
    pub events_tx: mpsc::Sender<NormalizedEvent>,
    pub config: EngineConfig,
}

pub struct PollScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    mode_rx: watch::Receiver<PollingMode>,
}

impl PollScheduler {
    /// Spawn the poll loop. The first tick runs immediately, which doubles
    /// as the "poll at once on resume" behavior. `elevate_rx` carries
    /// force-elevation requests from the push path.
    pub fn spawn(ctx: PollContext, elevate_rx: watch::Receiver<PollingMode>) -> Self {
        let cancel = CancellationToken::new();
        let (mode_tx, mode_rx) = watch::channel(PollingMode::Active);

        let token = cancel.clone();
        let handle = tokio::spawn(poll_loop(ctx, elevate_rx, mode_tx, token));

        Self {
            cancel,
            handle,
            mode_rx,
        }
    }

    pub fn current_mode(&self) -> PollingMode {
        *self.mode_rx.borrow()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            log_error!("poll loop task failed to join: {err:?}");
        }
    }
}

fn interval_for(config: &EngineConfig, mode: PollingMode) -> Duration {
    match mode {
        PollingMode::Active => config.active_interval,
        PollingMode::Recent => config.recent_interval,
        PollingMode::Standby => config.standby_interval,
    }
}

/// An interval whose first tick fires after one full period; used when the
/// mode changed after a poll and an immediate re-poll would double up.
fn deferred_interval(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// An interval whose first tick fires immediately; used at spawn and on
/// elevation so a detected hit is confirmed by a pull straight away.
fn immediate_interval(period: Duration) -> Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn poll_loop(
    ctx: PollContext,
    mut elevate_rx: watch::Receiver<PollingMode>,
    mode_tx: watch::Sender<PollingMode>,
    cancel: CancellationToken,
) {
    let mut mode = PollingMode::Active;
    let mut ticker = immediate_interval(interval_for(&ctx.config, mode));
    // The elevation writer is the push path; polling must outlive it, so a
    // closed channel only disables this branch, never the loop.
    let mut elevate_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&ctx).await;

                let next = {
                    let pipeline = ctx.pipeline.lock().await;
                    compute_mode(Utc::now(), &ctx.devices, pipeline.last_hit_by_device(), &ctx.config)
                };
                if next != mode {
                    log_info!("polling mode {:?} -> {:?}", mode, next);
                    mode = next;
                    let _ = mode_tx.send(mode);
                    ticker = deferred_interval(interval_for(&ctx.config, mode));
                }
            }
            changed = elevate_rx.changed(), if elevate_open => {
                if changed.is_err() {
                    elevate_open = false;
                    continue;
                }
                let requested = *elevate_rx.borrow_and_update();
                if requested.priority() > mode.priority() {
                    log_info!("polling mode elevated {:?} -> {:?}", mode, requested);
                    mode = requested;
                    let _ = mode_tx.send(mode);
                    ticker = immediate_interval(interval_for(&ctx.config, mode));
                }
            }
            _ = cancel.cancelled() => {
                log_info!("poll loop shutting down");
                break;
            }
        }
    }
}

async fn poll_once(ctx: &PollContext) {
    let device_ids: Vec<String> = ctx
        .devices
        .iter()
        .filter(|d| d.is_reachable())
        .map(|d| d.id.clone())
        .collect();
    if device_ids.is_empty() {
        log_debug!("no reachable devices to poll");
        return;
    }

    let started = Instant::now();
    let fetch = ctx.provider.fetch(&device_ids, &ctx.config.telemetry_keys);

    match time::timeout(ctx.config.fetch_timeout, fetch).await {
        Ok(Ok(payload)) => {
            let fallback = Utc::now();
            let mut forwarded = 0usize;
            for (device_id, by_key) in payload {
                for raw in by_key.values() {
                    let event = normalize(&device_id, raw, fallback);
                    if ctx.events_tx.send(event).await.is_err() {
                        // Ingest side is gone; this generation is done.
                        return;
                    }
                    forwarded += 1;
                }
            }
            log_debug!(
                "poll forwarded {} payloads in {}ms",
                forwarded,
                started.elapsed().as_millis()
            );
        }
        Ok(Err(err)) => log_warn!("telemetry fetch failed: {err:?}"),
        Err(_) => log_warn!(
            "telemetry fetch timed out (> {:?})",
            ctx.config.fetch_timeout
        ),
    }
}
