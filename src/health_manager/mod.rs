//! The health reconciliation engine: ingests host reports, compares them to
//! the desired state and queues corrective actions for the controller.

pub mod analyzer;
pub mod crash_tracker;
pub mod ingestor;
pub mod registry;
pub mod request_queue;
pub mod status;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use data_model::{
    messages::{subjects, ExitedMessage, HealthRequest, HeartbeatMessage, StartRequest},
    AnalysisStats,
    AppId,
    DesiredAppState,
    DropletEntry,
    Partition,
};
use hm_utils::SharedClock;
use message_bus::MessageBus;
use metrics::{health_manager::Metrics, Timer};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use self::{
    crash_tracker::{CrashTracker, FlappingPolicy},
    registry::DropletRegistry,
    request_queue::RequestQueue,
};
use crate::{config::ServerConfig, desired_state::DesiredStateStore};

/// Apps analysed between two yields to the runtime during a full pass.
const ANALYSIS_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub partition: Partition,
    pub dequeueing_rate: usize,
    pub droplet_lost: Duration,
    pub restart_timeout: Duration,
    pub stable_state: Duration,
    pub inactivity_period_for_spindown: Option<Duration>,
    /// How long a queued spindown may take to show up as a stopped app in the
    /// desired state before the app is analysed again.
    pub spindown_retry: Duration,
    pub flapping: FlappingPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        let intervals = &config.intervals;
        Self {
            partition: config.partition(),
            dequeueing_rate: config.dequeueing_rate,
            droplet_lost: intervals.droplet_lost(),
            restart_timeout: intervals.restart_timeout(),
            stable_state: intervals.stable_state(),
            inactivity_period_for_spindown: intervals.inactivity_period_for_spindown(),
            spindown_retry: intervals.database_scan() + intervals.restart_timeout(),
            flapping: FlappingPolicy::from(intervals),
        }
    }
}

/// Everything the engine mutates, guarded by a single lock so a message
/// handler never observes another one half way through.
#[derive(Debug)]
pub struct HealthManagerState {
    pub registry: DropletRegistry,
    pub crashes: CrashTracker,
    pub queue: RequestQueue,
    pub analysis_in_progress: bool,
    pub last_stats: AnalysisStats,
    metrics: Arc<Metrics>,
}

impl HealthManagerState {
    fn new(settings: &EngineSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            registry: DropletRegistry::default(),
            crashes: CrashTracker::new(settings.flapping.clone()),
            queue: RequestQueue::default(),
            analysis_in_progress: false,
            last_stats: AnalysisStats::default(),
            metrics,
        }
    }

    fn enqueue(&mut self, request: HealthRequest) {
        debug!(
            app_id = request.droplet().get(),
            op = request.as_ref(),
            "queueing request"
        );
        self.metrics
            .requests_queued
            .add(1, &[KeyValue::new("op", request.as_ref().to_string())]);
        self.queue.push(request);
    }

    /// Moves delayed restarts whose time has come into the request queue.
    fn promote_ready_restarts(&mut self, now_ms: u64) {
        for ((app_id, index), request) in self.crashes.take_ready(now_ms) {
            trace!(app_id = app_id.get(), index, "delayed restart is due");
            self.registry.mark_action(&app_id, &[index], now_ms);
            self.enqueue(HealthRequest::Start(request));
        }
    }
}

/// Snapshot served on `/varz`.
#[derive(Debug, Clone, Serialize)]
pub struct Varz {
    pub partition: String,
    pub droplets: usize,
    pub queue_length: usize,
    pub pending_restarts: usize,
    pub analysis_in_progress: bool,
    pub stats: AnalysisStats,
}

pub struct HealthManager {
    settings: EngineSettings,
    clock: SharedClock,
    bus: Arc<dyn MessageBus>,
    desired_state: Arc<dyn DesiredStateStore>,
    state: Mutex<HealthManagerState>,
    dequeue_lock: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl HealthManager {
    pub fn new(
        settings: EngineSettings,
        clock: SharedClock,
        bus: Arc<dyn MessageBus>,
        desired_state: Arc<dyn DesiredStateStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let state = HealthManagerState::new(&settings, metrics.clone());
        Self {
            settings,
            clock,
            bus,
            desired_state,
            state: Mutex::new(state),
            dequeue_lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Refreshes the registry from the desired-state source.
    pub async fn update_from_desired_state(&self) -> Result<()> {
        let apps = self.desired_state.list_apps().await?;
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        let outcome = state.registry.sync(&apps, now_ms);
        for app_id in outcome.version_changed.iter().chain(outcome.removed.iter()) {
            state.crashes.reset_app(app_id);
        }
        if !outcome.created.is_empty() || !outcome.removed.is_empty() {
            info!(
                created = outcome.created.len(),
                removed = outcome.removed.len(),
                redeployed = outcome.version_changed.len(),
                droplets = state.registry.len(),
                "synced desired state"
            );
        }
        Ok(())
    }

    /// Creates or refreshes the entry of a single app.
    pub async fn update_droplet(&self, app: &DesiredAppState) {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        if state.registry.update_droplet(app, now_ms) {
            state.crashes.reset_app(&app.app_id);
        }
    }

    /// Ingests a `dea.heartbeat` payload and returns the apps it touched.
    pub async fn process_heartbeat_message(&self, payload: &[u8]) -> Vec<AppId> {
        let message: HeartbeatMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed heartbeat: {:?}", err);
                self.metrics
                    .dropped_messages
                    .add(1, &[KeyValue::new("reason", "decode")]);
                return vec![];
            }
        };
        self.process_heartbeat(&message).await
    }

    pub async fn process_heartbeat(&self, message: &HeartbeatMessage) -> Vec<AppId> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        state.ingest_heartbeat(&self.settings, message, now_ms)
    }

    /// Ingests a `dea.exited` payload and returns the app it touched.
    pub async fn process_exited_message(&self, payload: &[u8]) -> Option<AppId> {
        let message: ExitedMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed exit notification: {:?}", err);
                self.metrics
                    .dropped_messages
                    .add(1, &[KeyValue::new("reason", "decode")]);
                return None;
            }
        };
        self.process_exited(&message).await
    }

    pub async fn process_exited(&self, message: &ExitedMessage) -> Option<AppId> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        state.ingest_exit(&self.settings, message, now_ms)
    }

    /// Ingests the compressed activity digest published by the routers.
    pub async fn process_active_apps_message(&self, payload: &[u8]) -> usize {
        let apps = match ingestor::decode_active_apps(payload) {
            Ok(apps) => apps,
            Err(err) => {
                warn!("dropping malformed activity digest: {:?}", err);
                self.metrics
                    .dropped_messages
                    .add(1, &[KeyValue::new("reason", "decode")]);
                return 0;
            }
        };
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        state.record_activity(&apps, now_ms)
    }

    /// Analyses one app, queueing whatever corrective actions it needs.
    /// Returns false if the app is not in the registry.
    pub async fn analyze_app(&self, app_id: &AppId, stats: &mut AnalysisStats) -> bool {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        state.analyze_app(&self.settings, app_id, stats, now_ms)
    }

    /// Runs a full analysis pass over the registry.
    ///
    /// Returns false without doing anything while the requests of a previous
    /// pass are still draining.
    pub async fn analyze_all_apps(&self) -> bool {
        let app_ids = {
            let mut state = self.state.lock().await;
            if state.analysis_in_progress {
                debug!(
                    queue_length = state.queue.len(),
                    "previous analysis still draining, skipping pass"
                );
                self.metrics.analysis_skipped.add(1, &[]);
                return false;
            }
            state.analysis_in_progress = true;
            state.registry.ids()
        };

        let _timer = Timer::start(&self.metrics.analysis_duration);
        let mut stats = AnalysisStats::default();
        for (n, app_id) in app_ids.iter().enumerate() {
            if !self.analyze_app(app_id, &mut stats).await {
                debug!(app_id = app_id.get(), "app vanished before analysis");
            }
            if (n + 1) % ANALYSIS_BATCH_SIZE == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut state = self.state.lock().await;
        self.metrics
            .totals
            .set(stats.running, stats.down, stats.flapping);
        info!(
            droplets = app_ids.len(),
            running = stats.running,
            down = stats.down,
            flapping = stats.flapping,
            queued = state.queue.len(),
            "analysis pass complete"
        );
        state.last_stats = stats;
        if state.queue.is_empty() {
            state.analysis_in_progress = false;
        }
        true
    }

    pub async fn analysis_in_progress(&self) -> bool {
        self.state.lock().await.analysis_in_progress
    }

    /// Publishes up to `dequeueing_rate` queued requests, oldest first, to
    /// `cloudcontrollers.hm.requests.<partition>`.
    pub async fn deque_a_batch_of_requests(&self) -> Result<usize> {
        let _guard = self.dequeue_lock.lock().await;
        let batch = {
            let now_ms = self.now_ms();
            let mut state = self.state.lock().await;
            state.promote_ready_restarts(now_ms);
            let batch = state.queue.pop_batch(self.settings.dequeueing_rate);
            for request in &batch {
                if let HealthRequest::Start(start) = request {
                    for index in &start.indices {
                        state.crashes.clear_pending(&start.droplet, *index);
                    }
                }
            }
            if state.queue.is_empty() && state.analysis_in_progress {
                trace!("request queue drained");
                state.analysis_in_progress = false;
            }
            batch
        };

        let subject = subjects::health_requests(self.settings.partition.get());
        let mut published = 0;
        for request in batch {
            let payload = match serde_json::to_vec(&request) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(
                        app_id = request.droplet().get(),
                        "failed to encode request: {:?}", err
                    );
                    continue;
                }
            };
            if let Err(err) = self.bus.publish(&subject, Bytes::from(payload)).await {
                error!(
                    app_id = request.droplet().get(),
                    op = request.as_ref(),
                    "failed to publish request: {:?}", err
                );
                continue;
            }
            self.metrics
                .requests_published
                .add(1, &[KeyValue::new("op", request.as_ref().to_string())]);
            published += 1;
        }
        Ok(published)
    }

    pub async fn restart_pending(&self, app_id: &AppId, index: u32) -> bool {
        self.state.lock().await.crashes.restart_pending(app_id, index)
    }

    pub async fn crash_count(&self, app_id: &AppId, index: u32) -> u32 {
        self.state.lock().await.crashes.crash_count(app_id, index)
    }

    pub async fn droplet(&self, app_id: &AppId) -> Option<DropletEntry> {
        self.state.lock().await.registry.get(app_id).cloned()
    }

    pub async fn queued_requests(&self) -> Vec<HealthRequest> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn pending_restart(&self, app_id: &AppId, index: u32) -> Option<StartRequest> {
        let state = self.state.lock().await;
        state
            .crashes
            .pending(app_id, index)
            .map(|pending| pending.request.clone())
    }

    /// Answers a `healthmanager.status` request.
    pub async fn status_report(&self, payload: &[u8]) -> Result<Bytes> {
        let request = serde_json::from_slice(payload)?;
        let state = self.state.lock().await;
        let reply = status::status_reply(&state, &request)?;
        Ok(Bytes::from(reply))
    }

    pub async fn varz(&self) -> Varz {
        let state = self.state.lock().await;
        Varz {
            partition: self.settings.partition.to_string(),
            droplets: state.registry.len(),
            queue_length: state.queue.len(),
            pending_restarts: state.crashes.pending_len(),
            analysis_in_progress: state.analysis_in_progress,
            stats: state.last_stats.clone(),
        }
    }
}
