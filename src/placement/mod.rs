//! Controller side of the loop: turns health requests into host-addressed
//! start and stop messages.

pub mod deferred;
pub mod pool;

use std::{collections::BTreeMap, ops::Range, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use data_model::{
    messages::{
        subjects,
        CrashedStatusReply,
        DiscoverReply,
        DiscoverRequest,
        FindDropletRequest,
        FlappingStatusReply,
        HealthRequest,
        InstanceReport,
        InstanceSince,
        InstanceView,
        StartInstanceMessage,
        StatusRequest,
        StopMessage,
    },
    AppId,
    DesiredAppState,
    InstanceStateKind,
    Partition,
};
use hm_utils::SharedClock;
use message_bus::{MessageBus, RequestOptions};
use metrics::{placement::Metrics, Timer};
use serde::Serialize;
use tracing::{debug, info, warn};

use self::{deferred::once_app_is_staged, pool::DeaPool};
use crate::{
    catalog::Catalog,
    config::{PlacementMode, ServerConfig},
    desired_state::DesiredStateStore,
};

#[derive(Debug, Clone)]
pub struct PlacementSettings {
    pub mode: PlacementMode,
    /// Timeout of every broadcast query.
    pub request_timeout: Duration,
    pub external_uri: String,
    pub partition: Partition,
    pub staging_poll_interval: Duration,
    pub staging_time_limit: Duration,
}

impl PlacementSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            mode: config.placement.mode,
            request_timeout: Duration::from_secs(config.placement.discover_timeout),
            external_uri: config.external_uri.clone(),
            partition: config.partition(),
            staging_poll_interval: Duration::from_millis(config.staging.poll_interval_ms),
            staging_time_limit: Duration::from_secs(config.staging.time_limit),
        }
    }
}

pub struct DispatchManager {
    settings: PlacementSettings,
    clock: SharedClock,
    bus: Arc<dyn MessageBus>,
    desired_state: Arc<dyn DesiredStateStore>,
    catalog: Arc<Catalog>,
    pool: Arc<DeaPool>,
    metrics: Arc<Metrics>,
}

impl DispatchManager {
    pub fn new(
        settings: PlacementSettings,
        clock: SharedClock,
        bus: Arc<dyn MessageBus>,
        desired_state: Arc<dyn DesiredStateStore>,
        catalog: Arc<Catalog>,
        pool: Arc<DeaPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            clock,
            bus,
            desired_state,
            catalog,
            pool,
            metrics,
        }
    }

    async fn publish_json<T: Serialize>(&self, subject: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.bus.publish(subject, Bytes::from(payload)).await
    }

    async fn request_json<T: Serialize>(
        &self,
        subject: &str,
        message: &T,
        expected: usize,
    ) -> Result<Vec<Bytes>> {
        let payload = serde_json::to_vec(message)?;
        self.bus
            .request(
                subject,
                Bytes::from(payload),
                RequestOptions::new(self.settings.request_timeout, expected),
            )
            .await
    }

    pub fn download_app_uri(&self, path: &str) -> String {
        format!("{}{}", self.settings.external_uri.trim_end_matches('/'), path)
    }

    /// Start message shared by every index of the app.
    pub fn new_message(&self, app: &DesiredAppState) -> StartInstanceMessage {
        StartInstanceMessage {
            droplet: app.app_id.clone(),
            name: app.name.clone(),
            uris: app.uris.clone(),
            runtime: app.runtime.clone(),
            runtime_info: self.catalog.runtime_info(&app.runtime),
            framework: app.framework.clone(),
            prod: app.prod,
            sha1: app.staged_package_hash.clone(),
            executable_uri: format!(
                "/staged_droplets/{}/{}",
                app.app_id, app.staged_package_hash
            ),
            version: app.version(),
            services: app.services.clone(),
            limits: app.limits.clone(),
            env: app.env.clone(),
            users: app.user_emails.clone(),
            cc_partition: self.settings.partition.clone(),
            index: 0,
            debug: app.metadata.debug.clone(),
            console: app.metadata.console,
            flapping: None,
        }
    }

    pub async fn handle_health_request_message(&self, payload: &[u8]) -> Result<()> {
        let request: HealthRequest =
            serde_json::from_slice(payload).context("decoding health request")?;
        self.handle_health_request(request).await
    }

    pub async fn handle_health_request(&self, request: HealthRequest) -> Result<()> {
        let app_id = request.droplet().clone();
        debug!(
            app_id = app_id.get(),
            op = request.as_ref(),
            "received health request"
        );
        let Some(app) = self.desired_state.get_app(&app_id).await? else {
            debug!(app_id = app_id.get(), "app no longer exists, ignoring");
            return Ok(());
        };
        match request {
            HealthRequest::Start(start) => {
                if !app.is_started() {
                    debug!(app_id = app_id.get(), "app no longer running, ignoring");
                    return Ok(());
                }
                if app.version() != start.version {
                    debug!(
                        app_id = app_id.get(),
                        version = %start.version,
                        "request for an older version, ignoring"
                    );
                    return Ok(());
                }
                if !self.runtime_supported(&app) {
                    return Ok(());
                }
                let mut message = self.new_message(&app);
                message.flapping = start.flapping.filter(|flapping| *flapping);
                for index in start.indices {
                    if let Err(err) = self.start_instance(&message, index).await {
                        warn!(
                            app_id = app_id.get(),
                            index,
                            "failed to start instance: {:?}", err
                        );
                    }
                }
            }
            HealthRequest::Stop(stop) => {
                if stop.last_updated != app.last_updated {
                    debug!(app_id = app_id.get(), "stop request for a stale app, ignoring");
                    return Ok(());
                }
                self.publish_json(
                    subjects::DEA_STOP,
                    &StopMessage {
                        droplet: app_id,
                        instances: Some(stop.instances),
                        ..Default::default()
                    },
                )
                .await?;
            }
            HealthRequest::Spindown(_) => {
                info!(app_id = app_id.get(), "spinning down app");
                self.desired_state.mark_stopped(&app_id).await?;
                self.stop_all(&app_id).await?;
            }
        }
        Ok(())
    }

    /// Places one index and sends it its start message. Returns false when
    /// no host could take it; the index stays down until the next analysis.
    pub async fn start_instance(&self, message: &StartInstanceMessage, index: u32) -> Result<bool> {
        let mut message = message.clone();
        message.executable_uri = self.download_app_uri(&message.executable_uri);
        message.index = index;

        let dea_id = {
            let _timer = Timer::start(&self.metrics.placement_latency);
            self.find_dea_for(&message).await?
        };
        match dea_id {
            Some(dea_id) => {
                debug!(
                    app_id = message.droplet.get(),
                    index,
                    dea = %dea_id,
                    "sending start message"
                );
                self.publish_json(&subjects::dea_start(&dea_id), &message)
                    .await?;
                self.metrics.instances_started.add(1, &[]);
                Ok(true)
            }
            None => {
                warn!(
                    app_id = message.droplet.get(),
                    index,
                    "no resources available to start instance"
                );
                self.metrics.placement_failures.add(1, &[]);
                Ok(false)
            }
        }
    }

    /// Starts every index of `indices`, one after the other, and returns how
    /// many were placed. A failed index does not stop the others.
    pub async fn start_instances(&self, app: &DesiredAppState, indices: Range<u32>) -> usize {
        if !self.runtime_supported(app) {
            return 0;
        }
        let message = self.new_message(app);
        let mut started = 0;
        for index in indices {
            match self.start_instance(&message, index).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    app_id = app.app_id.get(),
                    index,
                    "failed to start instance: {:?}", err
                ),
            }
        }
        started
    }

    fn runtime_supported(&self, app: &DesiredAppState) -> bool {
        let supported = self.catalog.supports(&app.framework, &app.runtime);
        if !supported {
            warn!(
                app_id = app.app_id.get(),
                framework = %app.framework,
                runtime = %app.runtime,
                "framework does not support the app's runtime, not starting"
            );
        }
        supported
    }

    pub async fn find_dea_for(&self, message: &StartInstanceMessage) -> Result<Option<String>> {
        let request = DiscoverRequest::from(message);
        match self.settings.mode {
            PlacementMode::Pool => Ok(self.pool.find_dea(&request).await),
            PlacementMode::Discover => {
                let replies = self
                    .request_json(subjects::DEA_DISCOVER, &request, 1)
                    .await?;
                let Some(reply) = replies.first() else {
                    return Ok(None);
                };
                let reply: DiscoverReply =
                    serde_json::from_slice(reply).context("decoding dea.discover reply")?;
                Ok(Some(reply.id))
            }
        }
    }

    pub async fn stop_instances(&self, app: &DesiredAppState, indices: Vec<u32>) -> Result<()> {
        self.publish_json(
            subjects::DEA_STOP,
            &StopMessage {
                droplet: app.app_id.clone(),
                version: Some(app.version()),
                indices: Some(indices),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn stop_all(&self, app_id: &AppId) -> Result<()> {
        self.publish_json(
            subjects::DEA_STOP,
            &StopMessage {
                droplet: app_id.clone(),
                ..Default::default()
            },
        )
        .await
    }

    /// Starts the app once staging is over. A single instance is started when
    /// staging failed so its logs can be inspected.
    pub async fn started(&self, app_id: &AppId) -> Duration {
        once_app_is_staged(
            self.desired_state.as_ref(),
            app_id,
            self.settings.staging_poll_interval,
            self.settings.staging_time_limit,
            |app| async move {
                let count = if app.staging_failed() {
                    1
                } else {
                    app.instance_count
                };
                let started = self.start_instances(&app, 0..count).await;
                debug!(app_id = app.app_id.get(), started, "started app");
            },
        )
        .await
    }

    pub async fn stopped(&self, app_id: &AppId) -> Result<()> {
        self.stop_all(app_id).await
    }

    /// Reacts to the instance count changing by `delta`; the desired state
    /// already carries the new count.
    pub async fn change_running_instances(&self, app_id: &AppId, delta: i64) -> Result<()> {
        let Some(app) = self.desired_state.get_app(app_id).await? else {
            return Ok(());
        };
        if !app.is_started() || delta == 0 {
            return Ok(());
        }
        let instances = app.instance_count as i64;
        if delta > 0 {
            let first = (instances - delta).max(0) as u32;
            self.start_instances(&app, first..app.instance_count)
                .await;
        } else {
            let indices = (instances..instances - delta).map(|i| i as u32).collect();
            self.stop_instances(&app, indices).await?;
        }
        Ok(())
    }

    async fn flapping_indices(&self, app: &DesiredAppState) -> Vec<(u32, u64)> {
        let request = StatusRequest {
            droplet: app.app_id.clone(),
            version: Some(app.version()),
            state: InstanceStateKind::Flapping,
        };
        let replies = match self.request_json(subjects::HEALTH_STATUS, &request, 1).await {
            Ok(replies) => replies,
            Err(err) => {
                warn!(app_id = app.app_id.get(), "flapping status query failed: {:?}", err);
                return vec![];
            }
        };
        replies
            .first()
            .and_then(|reply| serde_json::from_slice::<FlappingStatusReply>(reply).ok())
            .map(|reply| {
                reply
                    .indices
                    .into_iter()
                    .map(|entry| (entry.index, entry.since))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn find_droplet(
        &self,
        app: &DesiredAppState,
        states: Vec<InstanceStateKind>,
        include_stats: bool,
        expected: usize,
    ) -> Result<Vec<InstanceReport>> {
        let request = FindDropletRequest {
            droplet: app.app_id.clone(),
            version: app.version(),
            states,
            include_stats,
        };
        let replies = self
            .request_json(subjects::DEA_FIND_DROPLET, &request, expected)
            .await?;
        Ok(replies
            .iter()
            .filter_map(|reply| serde_json::from_slice::<InstanceReport>(reply).ok())
            .collect())
    }

    /// Per-index view of a started app: flapping indices as reported by the
    /// health manager, live instances as reported by the hosts, and DOWN for
    /// every index nobody answered for.
    pub async fn find_instances(&self, app_id: &AppId) -> Result<Vec<InstanceView>> {
        let Some(app) = self.desired_state.get_app(app_id).await? else {
            return Ok(vec![]);
        };
        if !app.is_started() {
            return Ok(vec![]);
        }
        let instances = app.instance_count;
        let mut views: BTreeMap<u32, InstanceView> = BTreeMap::new();
        for (index, since) in self.flapping_indices(&app).await {
            if index < instances {
                let mut view = InstanceView::down(index, since);
                view.state = InstanceStateKind::Flapping;
                views.insert(index, view);
            }
        }

        let expected = (instances as usize).saturating_sub(views.len());
        if expected > 0 {
            let reports = self
                .find_droplet(
                    &app,
                    vec![InstanceStateKind::Starting, InstanceStateKind::Running],
                    false,
                    expected,
                )
                .await?;
            for report in reports {
                let Ok(index) = u32::try_from(report.index) else {
                    continue;
                };
                if index >= instances {
                    continue;
                }
                views.insert(
                    index,
                    InstanceView {
                        index,
                        state: report.state,
                        since: report.state_timestamp as u64,
                        debug_ip: report.debug_ip,
                        debug_port: report.debug_port,
                        console_ip: report.console_ip,
                        console_port: report.console_port,
                        stats: None,
                    },
                );
            }
        }

        let now_secs = self.clock.now_secs();
        Ok((0..instances)
            .map(|index| {
                views
                    .remove(&index)
                    .unwrap_or_else(|| InstanceView::down(index, now_secs))
            })
            .collect())
    }

    /// Resource usage of the running instances, keyed by index.
    pub async fn find_stats(&self, app_id: &AppId) -> Result<BTreeMap<u32, InstanceView>> {
        let Some(app) = self.desired_state.get_app(app_id).await? else {
            return Ok(BTreeMap::new());
        };
        if !app.is_started() {
            return Ok(BTreeMap::new());
        }
        let instances = app.instance_count;
        let mut stats = BTreeMap::new();
        let reports = self
            .find_droplet(
                &app,
                vec![InstanceStateKind::Running],
                true,
                instances as usize,
            )
            .await?;
        for report in reports {
            let Ok(index) = u32::try_from(report.index) else {
                continue;
            };
            if index < instances {
                let mut view = InstanceView::down(index, report.state_timestamp as u64);
                view.state = report.state;
                view.stats = report.stats;
                stats.insert(index, view);
            }
        }
        let now_secs = self.clock.now_secs();
        for index in 0..instances {
            stats
                .entry(index)
                .or_insert_with(|| InstanceView::down(index, now_secs));
        }
        Ok(stats)
    }

    pub async fn find_crashes(&self, app_id: &AppId) -> Result<Vec<InstanceSince>> {
        let request = StatusRequest {
            droplet: app_id.clone(),
            version: None,
            state: InstanceStateKind::Crashed,
        };
        let replies = self
            .request_json(subjects::HEALTH_STATUS, &request, 1)
            .await?;
        Ok(replies
            .first()
            .and_then(|reply| serde_json::from_slice::<CrashedStatusReply>(reply).ok())
            .map(|reply| reply.instances)
            .unwrap_or_default())
    }
}
