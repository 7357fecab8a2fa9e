use std::io::Read;

use anyhow::{Context, Result};
use data_model::{
    messages::{
        ActiveApps,
        ExitReason,
        ExitedMessage,
        HealthRequest,
        HeartbeatMessage,
        InstanceHeartbeat,
        StartRequest,
    },
    AppId,
    AppState,
    InstanceState,
    InstanceStateKind,
    Partition,
};
use flate2::read::ZlibDecoder;
use opentelemetry::KeyValue;
use tracing::{debug, info, trace, warn};

use super::{crash_tracker::RestartDecision, EngineSettings, HealthManagerState};

/// Inflates and decodes the router activity digest.
pub fn decode_active_apps(payload: &[u8]) -> Result<ActiveApps> {
    let mut json = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut json)
        .context("inflating activity digest")?;
    serde_json::from_slice(&json).context("decoding activity digest")
}

impl HealthManagerState {
    fn drop_foreign(&self, settings: &EngineSettings, partition: &Partition) -> bool {
        if partition != &settings.partition {
            trace!(
                partition = partition.get(),
                "ignoring message for another partition"
            );
            self.metrics
                .dropped_messages
                .add(1, &[KeyValue::new("reason", "partition")]);
            return true;
        }
        false
    }

    pub(super) fn ingest_heartbeat(
        &mut self,
        settings: &EngineSettings,
        message: &HeartbeatMessage,
        now_ms: u64,
    ) -> Vec<AppId> {
        let mut touched: Vec<AppId> = vec![];
        for report in &message.droplets {
            if self.ingest_instance_report(settings, report, message.prod, now_ms) &&
                !touched.contains(&report.droplet)
            {
                touched.push(report.droplet.clone());
            }
        }
        touched
    }

    fn ingest_instance_report(
        &mut self,
        settings: &EngineSettings,
        report: &InstanceHeartbeat,
        host_prod: Option<bool>,
        now_ms: u64,
    ) -> bool {
        if self.drop_foreign(settings, &report.cc_partition) {
            return false;
        }
        self.metrics.heartbeats.add(1, &[]);

        let app_id = &report.droplet;
        let timestamp_ms = report.timestamp_ms();
        let indices = &mut self
            .registry
            .get_or_create(app_id, now_ms)
            .version_mut(&report.version)
            .indices;
        let previous = indices.get(&report.index).cloned();
        if let Some(previous) = &previous {
            let stale = previous.instance_id == report.instance &&
                previous
                    .crash_timestamp_ms
                    .is_some_and(|crashed_at| timestamp_ms < crashed_at);
            if stale {
                debug!(
                    app_id = app_id.get(),
                    index = report.index,
                    instance = %report.instance,
                    "ignoring report from a crashed instance"
                );
                return false;
            }
        }

        let mut instance = InstanceState::new(report.state, report.instance.clone(), timestamp_ms);
        instance.prod = report.prod.or(host_prod).unwrap_or(false);
        if let Some(previous) = previous {
            instance.last_action_ms = previous.last_action_ms;
            if previous.instance_id == report.instance {
                instance.crash_timestamp_ms = previous.crash_timestamp_ms;
            }
        }
        indices.insert(report.index, instance);

        if report.state == InstanceStateKind::Running {
            self.crashes
                .cancel_pending(app_id, report.index, &report.instance);
            self.crashes.on_sustained_running(app_id, report.index, now_ms);
        }
        true
    }

    pub(super) fn ingest_exit(
        &mut self,
        settings: &EngineSettings,
        message: &ExitedMessage,
        now_ms: u64,
    ) -> Option<AppId> {
        if self.drop_foreign(settings, &message.cc_partition) {
            return None;
        }
        let app_id = &message.droplet;
        let index = message.index;
        let crash_timestamp_ms = message.timestamp_ms();
        if self
            .crashes
            .is_duplicate(app_id, index, &message.instance, crash_timestamp_ms)
        {
            debug!(
                app_id = app_id.get(),
                index,
                instance = %message.instance,
                "ignoring duplicate exit notification"
            );
            return None;
        }
        self.metrics
            .exits
            .add(1, &[KeyValue::new("reason", message.reason.as_ref().to_string())]);

        let entry = self.registry.get_or_create(app_id, now_ms);
        let is_live = message.version == entry.live_version;
        let restartable =
            is_live && entry.state == AppState::Started && index < entry.instance_count;
        let last_updated = entry.last_updated;
        let live_version = entry.live_version.clone();

        let mut mark = |state: InstanceStateKind| {
            let slot = entry
                .version_mut(&message.version)
                .indices
                .entry(index)
                .or_insert_with(|| InstanceState::down(now_ms));
            let last_action_ms = slot.last_action_ms;
            *slot = InstanceState::new(state, message.instance.clone(), now_ms);
            slot.last_action_ms = last_action_ms;
            slot.crash_timestamp_ms = Some(crash_timestamp_ms);
        };

        let restart = |flapping: Option<bool>| StartRequest {
            droplet: app_id.clone(),
            last_updated,
            version: live_version.clone(),
            indices: vec![index],
            flapping,
        };

        let crashed = message.reason != ExitReason::Stopped && !message.reason.is_host_initiated();
        if !is_live {
            mark(if crashed {
                InstanceStateKind::Crashed
            } else {
                InstanceStateKind::Down
            });
            self.crashes
                .note_exit(app_id, index, &message.instance, crash_timestamp_ms);
            return Some(app_id.clone());
        }

        match message.reason {
            ExitReason::Stopped => {
                mark(InstanceStateKind::Down);
                self.crashes
                    .note_exit(app_id, index, &message.instance, crash_timestamp_ms);
            }
            ref reason if reason.is_host_initiated() => {
                mark(InstanceStateKind::Down);
                self.crashes
                    .note_exit(app_id, index, &message.instance, crash_timestamp_ms);
                if restartable {
                    info!(
                        app_id = app_id.get(),
                        index,
                        reason = message.reason.as_ref(),
                        "restarting instance removed by its host"
                    );
                    self.enqueue(HealthRequest::Start(restart(None)));
                    self.registry.mark_action(app_id, &[index], now_ms);
                }
            }
            _ => {
                let decision = self.crashes.on_crash(
                    app_id,
                    index,
                    &message.instance,
                    crash_timestamp_ms,
                    now_ms,
                );
                match decision {
                    RestartDecision::RestartNow => {
                        mark(InstanceStateKind::Crashed);
                        if restartable {
                            self.enqueue(HealthRequest::Start(restart(None)));
                            self.registry.mark_action(app_id, &[index], now_ms);
                        }
                    }
                    RestartDecision::RestartDelayed(delay) => {
                        mark(InstanceStateKind::Flapping);
                        if restartable {
                            let fire_at_ms = now_ms + delay.as_millis() as u64;
                            info!(
                                app_id = app_id.get(),
                                index,
                                delay_secs = delay.as_secs_f64(),
                                "instance is flapping, delaying restart"
                            );
                            self.crashes.schedule_restart(
                                app_id,
                                index,
                                fire_at_ms,
                                &message.instance,
                                restart(Some(true)),
                            );
                        }
                    }
                    RestartDecision::GiveUp => {
                        mark(InstanceStateKind::Flapping);
                        warn!(
                            app_id = app_id.get(),
                            index,
                            crashes = self.crashes.crash_count(app_id, index),
                            "giving up on restarting flapping instance"
                        );
                    }
                }
            }
        }
        Some(app_id.clone())
    }

    /// Stamps the activity time of every known app in the digest.
    pub(super) fn record_activity(&mut self, apps: &[AppId], now_ms: u64) -> usize {
        let mut updated = 0;
        for app_id in apps {
            if let Some(entry) = self.registry.get_mut(app_id) {
                entry.last_activity_ms = Some(now_ms);
                if entry.spindown_requested_at_ms.take().is_some() {
                    debug!(app_id = app_id.get(), "app active again, dropping spindown");
                }
                updated += 1;
            }
        }
        trace!(reported = apps.len(), updated, "recorded app activity");
        updated
    }
}
