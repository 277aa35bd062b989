//! Session orchestration. The controller issues start/stop batches to the
//! targets, scopes the session to the devices that acknowledged, owns the
//! telemetry source generation (poll loop, push channel, ingest task), and
//! ends individual targets as their goals are met.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::state::{SessionPhase, SessionState};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::models::{Device, NormalizedEvent, SessionRecord, SessionStatus};
use crate::pipeline::{AcceptOutcome, HitEventPipeline, PipelineSnapshot};
use crate::polling::{PollContext, PollScheduler, PollingMode};
use crate::push::PushSubscriber;
use crate::summary::{build_summary, SessionSummary};
use crate::telemetry::source::{CommandWarning, DeviceCommand, DeviceCommander, TelemetryProvider};
use crate::{log_error, log_info, log_warn};

const ENABLE_LOGS: bool = true;

/// Everything a new session needs. Goals are per device id; devices absent
/// from the map have no goal and only stop with the session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub devices: Vec<Device>,
    pub game_name: Option<String>,
    pub duration_secs: Option<u32>,
    pub goal_shots_per_target: HashMap<String, u32>,
    /// Opaque passthrough (room, preset, desired duration); lands in the
    /// summary unchanged.
    pub context: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub session_id: String,
    /// The subset of requested devices that acknowledged the start.
    pub target_device_ids: Vec<String>,
    pub warnings: Vec<CommandWarning>,
    /// Set when a session was already in flight and this call returned its
    /// snapshot instead of starting a second one.
    pub already_running: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub session_id: String,
    /// Absent when the stop targeted explicit devices with no session
    /// running (cleanup after a restart).
    pub summary: Option<Box<SessionSummary>>,
    pub warnings: Vec<CommandWarning>,
}

/// One generation of telemetry sources. Torn down as a unit; a new session,
/// device set, or visibility resume always gets a fresh generation.
struct Sources {
    scheduler: PollScheduler,
    push: Option<PushSubscriber>,
    ingest: JoinHandle<()>,
    /// Keeps the elevation channel open for the scheduler even when the
    /// push channel (its only writer) failed to open or died.
    _elevate_tx: Arc<watch::Sender<PollingMode>>,
}

#[derive(Clone)]
pub struct SessionController {
    config: EngineConfig,
    provider: Arc<dyn TelemetryProvider>,
    commander: Arc<dyn DeviceCommander>,
    db: Database,
    state: Arc<Mutex<SessionState>>,
    pipeline: Arc<Mutex<HitEventPipeline>>,
    /// Tracked-device registry for the current session, keyed by id.
    devices: Arc<Mutex<HashMap<String, Device>>>,
    events_tx: broadcast::Sender<EngineEvent>,
    /// Serializes start/stop. A stop issued while a start is in flight
    /// waits here for the start to resolve.
    op_lock: Arc<Mutex<()>>,
    sources: Arc<Mutex<Option<Sources>>>,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn TelemetryProvider>,
        commander: Arc<dyn DeviceCommander>,
        db: Database,
        config: EngineConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            config,
            provider,
            commander,
            db,
            state: Arc::new(Mutex::new(SessionState::new())),
            pipeline: Arc::new(Mutex::new(HitEventPipeline::new())),
            devices: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            op_lock: Arc::new(Mutex::new(())),
            sources: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub async fn session_state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn pipeline_snapshot(&self) -> PipelineSnapshot {
        self.pipeline.lock().await.snapshot()
    }

    /// Current polling tier, when a source generation is live.
    pub async fn polling_mode(&self) -> Option<PollingMode> {
        self.sources
            .lock()
            .await
            .as_ref()
            .map(|s| s.scheduler.current_mode())
    }

    /// Mark sessions left `Running` by a crash as interrupted. Run once at
    /// startup, before the first `start`.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let marked = self.db.mark_interrupted_sessions(Utc::now()).await?;
        if marked > 0 {
            log_warn!("marked {marked} interrupted session(s) from a previous run");
        }
        Ok(marked)
    }

    /// Issue a start batch and open a session scoped to the devices that
    /// acknowledged. Zero acknowledgements abort back to idle; per-device
    /// failures ride along as warnings.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, EngineError> {
        if request.devices.is_empty() {
            return Err(EngineError::EmptyDeviceSet);
        }

        let _op = self.op_lock.lock().await;

        {
            let state = self.state.lock().await;
            if !state.is_startable() {
                // Re-entrant call: hand back the live snapshot rather than
                // racing a second session against the first.
                return Ok(StartOutcome {
                    session_id: state.session_id.clone().unwrap_or_default(),
                    target_device_ids: state.target_device_ids.clone(),
                    warnings: Vec::new(),
                    already_running: true,
                });
            }
        }

        self.set_phase(SessionPhase::Starting).await;

        let device_ids: Vec<String> = request.devices.iter().map(|d| d.id.clone()).collect();
        let session_id = Uuid::new_v4().to_string();
        let params = json!({
            "gameId": session_id,
            "durationSecs": request.duration_secs,
            "goalShotsPerTarget": &request.goal_shots_per_target,
        });

        let response = match time::timeout(
            self.config.command_timeout,
            self.commander
                .send_batch(&device_ids, DeviceCommand::Start, params),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                log_error!("start batch failed: {err:?}");
                self.set_phase(SessionPhase::Idle).await;
                return Err(EngineError::CommandFailed {
                    operation: DeviceCommand::Start,
                    device_ids,
                });
            }
            Err(_) => {
                log_error!(
                    "start batch timed out (> {:?})",
                    self.config.command_timeout
                );
                self.set_phase(SessionPhase::Idle).await;
                return Err(EngineError::CommandFailed {
                    operation: DeviceCommand::Start,
                    device_ids,
                });
            }
        };

        let successes = response.successes(&device_ids);
        let warnings = response.warnings(&device_ids);
        if successes.is_empty() {
            self.set_phase(SessionPhase::Idle).await;
            return Err(EngineError::CommandFailed {
                operation: DeviceCommand::Start,
                device_ids,
            });
        }
        for warning in &warnings {
            log_warn!(
                "device {} did not start: {}",
                warning.device_id,
                warning.warning
            );
        }

        let started_at = response.executed_at.unwrap_or_else(Utc::now);

        let record = SessionRecord {
            id: session_id.clone(),
            game_name: request.game_name.clone(),
            started_at,
            stopped_at: None,
            status: SessionStatus::Running,
            target_device_ids: successes.clone(),
            goal_shots_per_target: request.goal_shots_per_target.clone(),
            duration_secs: request.duration_secs,
            created_at: started_at,
            updated_at: started_at,
        };
        if let Err(err) = self.db.insert_session(&record).await {
            self.set_phase(SessionPhase::Idle).await;
            return Err(EngineError::Storage(err));
        }

        {
            let mut devices = self.devices.lock().await;
            devices.clear();
            for device in &request.devices {
                devices.insert(device.id.clone(), device.clone());
            }
        }

        {
            let mut state = self.state.lock().await;
            state.begin_session(
                session_id.clone(),
                request.game_name,
                successes.clone(),
                request.goal_shots_per_target,
                request.duration_secs,
                started_at,
                request.context,
            );
        }

        let subscription_started_at = Utc::now();
        self.pipeline
            .lock()
            .await
            .reset(session_id.clone(), subscription_started_at);

        self.spawn_sources().await;
        self.emit_state().await;

        log_info!(
            "session {session_id} running on {}/{} devices",
            successes.len(),
            device_ids.len()
        );

        Ok(StartOutcome {
            session_id,
            target_device_ids: successes,
            warnings,
            already_running: false,
        })
    }

    /// Issue a stop batch and end the session. All targets failing leaves
    /// the session running so the caller can retry the same set; partial
    /// failures end it with warnings.
    pub async fn stop(
        &self,
        device_ids: Option<Vec<String>>,
        game_id: Option<String>,
    ) -> Result<StopOutcome, EngineError> {
        let _op = self.op_lock.lock().await;

        let explicit = device_ids.is_some() || game_id.is_some();
        let (targets, session_id, was_running) = {
            let state = self.state.lock().await;
            let running = state.phase == SessionPhase::Running;
            if !running && !explicit {
                return Err(EngineError::NoActiveSession);
            }
            let targets = device_ids.unwrap_or_else(|| state.target_device_ids.clone());
            let session_id = game_id
                .or_else(|| state.session_id.clone())
                .unwrap_or_default();
            (targets, session_id, running)
        };

        if targets.is_empty() {
            return Err(EngineError::EmptyDeviceSet);
        }

        if was_running {
            self.set_phase(SessionPhase::Stopping).await;
        }

        let params = json!({ "gameId": session_id });
        let response = match time::timeout(
            self.config.command_timeout,
            self.commander
                .send_batch(&targets, DeviceCommand::Stop, params),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                log_error!("stop batch failed: {err:?}");
                if was_running {
                    self.set_phase(SessionPhase::Running).await;
                }
                return Err(EngineError::CommandFailed {
                    operation: DeviceCommand::Stop,
                    device_ids: targets,
                });
            }
            Err(_) => {
                log_error!("stop batch timed out (> {:?})", self.config.command_timeout);
                if was_running {
                    self.set_phase(SessionPhase::Running).await;
                }
                return Err(EngineError::CommandFailed {
                    operation: DeviceCommand::Stop,
                    device_ids: targets,
                });
            }
        };

        let successes = response.successes(&targets);
        let warnings = response.warnings(&targets);
        if successes.is_empty() {
            if was_running {
                self.set_phase(SessionPhase::Running).await;
            }
            return Err(EngineError::CommandFailed {
                operation: DeviceCommand::Stop,
                device_ids: targets,
            });
        }
        for warning in &warnings {
            log_warn!(
                "device {} did not acknowledge stop: {}",
                warning.device_id,
                warning.warning
            );
        }

        if !was_running {
            return Ok(StopOutcome {
                session_id,
                summary: None,
                warnings,
            });
        }

        let stopped_at = response.executed_at.unwrap_or_else(Utc::now);

        // Old generation first, so no event lands after the freeze.
        self.teardown_sources().await;

        let summary = {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::Ended;
            state.stopped_at = Some(stopped_at);

            let mut pipeline = self.pipeline.lock().await;
            pipeline.freeze();

            let devices = self.devices.lock().await;
            let summary = build_summary(&state, &pipeline.snapshot(), &devices, stopped_at);
            state.clear_bookkeeping();
            summary
        };

        // Hardware already stopped; a persistence failure must not void the
        // finished session. Subscribers still get the summary.
        if let Err(err) = self
            .db
            .mark_session_status(
                &session_id,
                SessionStatus::Completed,
                Some(stopped_at),
                stopped_at,
            )
            .await
        {
            log_error!("failed to mark session {session_id} completed: {err:?}");
        }
        if let Err(err) = self.db.insert_summary(&summary, stopped_at).await {
            log_error!("failed to persist summary for {session_id}: {err:?}");
        }

        self.emit_state().await;
        let _ = self.events_tx.send(EngineEvent::SessionCompleted {
            session_id: session_id.clone(),
            summary: Box::new(summary.clone()),
        });

        log_info!(
            "session {session_id} ended with {} hits",
            summary.total_hits
        );

        Ok(StopOutcome {
            session_id,
            summary: Some(Box::new(summary)),
            warnings,
        })
    }

    /// Cooperative visibility pause/resume. Inactive cancels the poll timer
    /// and closes the push channel; active re-opens both fresh, with the
    /// replay cutoff advanced so stale filtering restarts cleanly.
    pub async fn set_active(&self, active: bool) {
        if !active {
            log_info!("consumer inactive; tearing down telemetry sources");
            self.teardown_sources().await;
            return;
        }

        let running = { self.state.lock().await.phase == SessionPhase::Running };
        if !running {
            return;
        }
        if self.sources.lock().await.is_some() {
            return;
        }

        log_info!("consumer active again; re-opening telemetry sources");
        self.pipeline.lock().await.mark_resubscribed(Utc::now());
        self.spawn_sources().await;
    }

    /// Spawn a fresh source generation for the current session: poll loop
    /// (first tick immediate), push channel, and the single ingest consumer
    /// both feed. Any previous generation is torn down first.
    async fn spawn_sources(&self) {
        self.teardown_sources().await;

        let (session_id, target_ids) = {
            let state = self.state.lock().await;
            match &state.session_id {
                Some(id) => (id.clone(), state.target_device_ids.clone()),
                None => return,
            }
        };

        let device_map = self.devices.lock().await.clone();
        let devices: Vec<Device> = target_ids
            .iter()
            .filter_map(|id| device_map.get(id).cloned())
            .collect();

        let (events_tx, events_rx) = mpsc::channel::<NormalizedEvent>(self.config.event_buffer);
        let (elevate_tx, elevate_rx) = watch::channel(PollingMode::Standby);
        let elevate_tx = Arc::new(elevate_tx);

        let scheduler = PollScheduler::spawn(
            PollContext {
                provider: self.provider.clone(),
                devices,
                pipeline: self.pipeline.clone(),
                events_tx: events_tx.clone(),
                config: self.config.clone(),
            },
            elevate_rx,
        );

        let push = match PushSubscriber::open(
            self.provider.clone(),
            target_ids,
            events_tx.clone(),
            elevate_tx.clone(),
            self.events_tx.clone(),
            &self.config,
        )
        .await
        {
            Ok(push) => Some(push),
            Err(err) => {
                // Polling carries the session alone until a fresh open.
                log_warn!("push channel unavailable: {err}");
                let _ = self.events_tx.send(EngineEvent::ChannelDegraded {
                    reason: err.to_string(),
                });
                None
            }
        };

        // The ingest receiver ends when the scheduler and push listener
        // drop their senders; no separate cancel needed.
        drop(events_tx);

        let ingest = tokio::spawn(ingest_loop(
            IngestContext {
                session_id,
                state: self.state.clone(),
                pipeline: self.pipeline.clone(),
                devices: device_map,
                commander: self.commander.clone(),
                events_tx: self.events_tx.clone(),
                command_timeout: self.config.command_timeout,
            },
            events_rx,
        ));

        *self.sources.lock().await = Some(Sources {
            scheduler,
            push,
            ingest,
            _elevate_tx: elevate_tx,
        });
    }

    /// Strictly ordered teardown: cancel and await every task of the old
    /// generation before a new one may exist, so two generations never
    /// deliver into the same pipeline.
    async fn teardown_sources(&self) {
        let sources = self.sources.lock().await.take();
        if let Some(Sources {
            scheduler,
            push,
            ingest,
            ..
        }) = sources
        {
            scheduler.shutdown().await;
            if let Some(push) = push {
                push.close().await;
            }
            if let Err(err) = ingest.await {
                log_error!("ingest task failed to join: {err:?}");
            }
        }
    }

    async fn set_phase(&self, phase: SessionPhase) {
        {
            let mut state = self.state.lock().await;
            state.phase = phase;
        }
        self.emit_state().await;
    }

    async fn emit_state(&self) {
        let state = self.state.lock().await;
        let _ = self.events_tx.send(EngineEvent::SessionStateChanged {
            phase: state.phase,
            session_id: state.session_id.clone(),
        });
    }
}

struct IngestContext {
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    pipeline: Arc<Mutex<HitEventPipeline>>,
    devices: HashMap<String, Device>,
    commander: Arc<dyn DeviceCommander>,
    events_tx: broadcast::Sender<EngineEvent>,
    command_timeout: std::time::Duration,
}

/// Single consumer of the normalized-event queue. Every `accept` runs here,
/// so the push and poll paths never interleave their read-modify-write of
/// pipeline state. Goal checks ride on the accept outcome.
async fn ingest_loop(ctx: IngestContext, mut events_rx: mpsc::Receiver<NormalizedEvent>) {
    while let Some(event) = events_rx.recv().await {
        let (stopped, goal) = {
            let state = ctx.state.lock().await;
            if state.session_id.as_deref() != Some(ctx.session_id.as_str()) {
                // Session swapped out underneath this generation.
                break;
            }
            (
                state.stopped_devices.clone(),
                state
                    .goal_shots_per_target
                    .get(&event.device_id)
                    .copied(),
            )
        };

        let device_name = ctx
            .devices
            .get(&event.device_id)
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|| event.device_id.clone());

        let outcome = {
            let mut pipeline = ctx.pipeline.lock().await;
            pipeline.accept(&event, &device_name, &stopped)
        };

        let AcceptOutcome::Counted {
            device_id,
            new_count,
        } = outcome
        else {
            continue;
        };

        let _ = ctx.events_tx.send(EngineEvent::HitRegistered {
            device_id: device_id.clone(),
            device_name,
            hit_count: new_count,
            timestamp: event.timestamp,
        });

        if !goal.map(|g| new_count >= g).unwrap_or(false) {
            continue;
        }

        {
            let mut state = ctx.state.lock().await;
            if !state.stopped_devices.insert(device_id.clone()) {
                continue;
            }
        }

        let _ = ctx.events_tx.send(EngineEvent::TargetGoalReached {
            device_id: device_id.clone(),
            hit_count: new_count,
        });
        log_info!("goal reached on {device_id} at {new_count} hits; stopping that target");

        // Stop this target alone; the rest of the session keeps running.
        // Fire and forget so a slow device cannot stall ingestion.
        let commander = ctx.commander.clone();
        let session_id = ctx.session_id.clone();
        let timeout = ctx.command_timeout;
        tokio::spawn(async move {
            let targets = vec![device_id.clone()];
            let params = json!({ "gameId": session_id });
            match time::timeout(
                timeout,
                commander.send_batch(&targets, DeviceCommand::Stop, params),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log_warn!("individual stop for {device_id} failed: {err:?}"),
                Err(_) => log_warn!("individual stop for {device_id} timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceStatus, TelemetryFrame};
    use crate::telemetry::source::{ChannelHandle, CommandBatchResponse, CommandResult, RawTelemetry};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Provider/commander that acknowledges everything and records how many
    /// batches were issued.
    struct NullBackend {
        batches: AtomicUsize,
    }

    impl NullBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TelemetryProvider for NullBackend {
        async fn fetch(&self, _device_ids: &[String], _keys: &[String]) -> Result<RawTelemetry> {
            Ok(HashMap::new())
        }

        async fn subscribe(
            &self,
            _device_ids: &[String],
            _frames: mpsc::Sender<TelemetryFrame>,
        ) -> Result<ChannelHandle> {
            Ok(ChannelHandle::new(CancellationToken::new()))
        }
    }

    #[async_trait]
    impl DeviceCommander for NullBackend {
        async fn send_batch(
            &self,
            device_ids: &[String],
            _command: DeviceCommand,
            _params: Value,
        ) -> Result<CommandBatchResponse> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(CommandBatchResponse {
                results: device_ids
                    .iter()
                    .map(|id| CommandResult {
                        device_id: id.clone(),
                        success: true,
                        warning: None,
                    })
                    .collect(),
                executed_at: Some(Utc::now()),
            })
        }
    }

    fn controller(backend: Arc<NullBackend>) -> (SessionController, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("engine.db")).expect("db");
        let controller = SessionController::new(
            backend.clone(),
            backend,
            db,
            EngineConfig::default(),
        );
        (controller, dir)
    }

    fn request(ids: &[&str]) -> StartRequest {
        StartRequest {
            devices: ids
                .iter()
                .map(|id| Device::new(*id, id.to_uppercase(), DeviceStatus::Online))
                .collect(),
            game_name: None,
            duration_secs: None,
            goal_shots_per_target: HashMap::new(),
            context: Value::Null,
        }
    }

    #[tokio::test]
    async fn empty_device_set_is_rejected_before_any_command() {
        let backend = NullBackend::new();
        let (controller, _dir) = controller(backend.clone());

        let err = controller.start(request(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyDeviceSet));
        assert_eq!(backend.batches.load(Ordering::SeqCst), 0);
        assert_eq!(controller.session_state().await.phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn stop_without_session_or_explicit_target_is_rejected() {
        let backend = NullBackend::new();
        let (controller, _dir) = controller(backend.clone());

        let err = controller.stop(None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoActiveSession));
        assert_eq!(backend.batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reentrant_start_returns_the_running_snapshot() {
        let backend = NullBackend::new();
        let (controller, _dir) = controller(backend);

        let first = controller.start(request(&["d1"])).await.unwrap();
        assert!(!first.already_running);

        let second = controller.start(request(&["d2"])).await.unwrap();
        assert!(second.already_running);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.target_device_ids, vec!["d1".to_string()]);

        controller.stop(None, None).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_stop_without_session_issues_the_batch() {
        let backend = NullBackend::new();
        let (controller, _dir) = controller(backend.clone());

        let outcome = controller
            .stop(Some(vec!["d1".to_string()]), Some("g1".to_string()))
            .await
            .unwrap();
        assert_eq!(backend.batches.load(Ordering::SeqCst), 1);
        assert!(outcome.summary.is_none());
        assert_eq!(outcome.session_id, "g1");
    }
}
