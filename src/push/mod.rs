//! Push-channel listener. Wraps the provider's live channel, filters
//! replayed cache frames, and feeds normalized events into the same ingest
//! queue the poll path uses. A dropped channel degrades the engine to
//! polling only; reconnecting is the controller's call, never automatic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::models::{EventKind, NormalizedEvent, TelemetryFrame};
use crate::polling::PollingMode;
use crate::telemetry::normalizer::normalize;
use crate::telemetry::source::{ChannelHandle, TelemetryProvider};
use crate::{log_debug, log_error, log_info, log_warn};

const ENABLE_LOGS: bool = true;

pub struct PushSubscriber {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    subscription_started_at: DateTime<Utc>,
}

impl PushSubscriber {
    /// Open one channel covering `device_ids`. Frames older than the open
    /// instant are replayed cache and are dropped here, before the pipeline
    /// ever sees them; otherwise every reconnect would fabricate phantom
    /// hits from the initial snapshot burst.
    ///
    /// Open failure is non-fatal to the engine (polling continues); the
    /// caller decides whether to surface it.
    pub async fn open(
        provider: Arc<dyn TelemetryProvider>,
        device_ids: Vec<String>,
        events_tx: mpsc::Sender<NormalizedEvent>,
        elevate_tx: Arc<watch::Sender<PollingMode>>,
        engine_events: broadcast::Sender<EngineEvent>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let subscription_started_at = Utc::now();
        let (frames_tx, frames_rx) = mpsc::channel::<TelemetryFrame>(config.event_buffer);

        let channel = provider
            .subscribe(&device_ids, frames_tx)
            .await
            .map_err(|err| EngineError::Channel(err.to_string()))?;

        let cancel = CancellationToken::new();
        let listener = Listener {
            frames_rx,
            channel,
            events_tx,
            elevate_tx,
            engine_events,
            subscription_started_at,
            cancel: cancel.clone(),
        };

        log_info!(
            "push channel open for {} devices (started_at={})",
            device_ids.len(),
            subscription_started_at
        );

        let handle = tokio::spawn(listener.run());
        Ok(Self {
            cancel,
            handle,
            subscription_started_at,
        })
    }

    pub fn subscription_started_at(&self) -> DateTime<Utc> {
        self.subscription_started_at
    }

    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            log_error!("push listener task failed to join: {err:?}");
        }
    }
}

struct Listener {
    frames_rx: mpsc::Receiver<TelemetryFrame>,
    channel: ChannelHandle,
    events_tx: mpsc::Sender<NormalizedEvent>,
    elevate_tx: Arc<watch::Sender<PollingMode>>,
    engine_events: broadcast::Sender<EngineEvent>,
    subscription_started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Listener {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = self.frames_rx.recv() => match maybe {
                    Some(frame) => {
                        if !self.handle_frame(frame).await {
                            break;
                        }
                    }
                    None => {
                        // Sender dropped without us closing: channel error.
                        // Reported exactly once; no auto-retry.
                        if !self.cancel.is_cancelled() {
                            log_warn!("push channel dropped; continuing on polling only");
                            let _ = self.engine_events.send(EngineEvent::ChannelDegraded {
                                reason: "push channel closed by source".to_string(),
                            });
                        }
                        break;
                    }
                },
                _ = self.cancel.cancelled() => {
                    self.channel.close();
                    log_info!("push listener shutting down");
                    break;
                }
            }
        }
    }

    /// Returns false when the ingest side is gone and the listener should
    /// stop.
    async fn handle_frame(&self, frame: TelemetryFrame) -> bool {
        let fallback = Utc::now();

        for raw in frame.data.values() {
            let event = normalize(&frame.entity_id, raw, fallback);

            if event.timestamp < self.subscription_started_at {
                log_debug!(
                    "dropping replayed frame for {} ({} < subscription start)",
                    event.device_id,
                    event.timestamp
                );
                continue;
            }

            if event.kind == EventKind::Hit {
                // A live hit on the fast path: poll fast immediately.
                let _ = self.elevate_tx.send(PollingMode::Active);
            }

            if self.events_tx.send(event).await.is_err() {
                return false;
            }
        }

        true
    }
}
