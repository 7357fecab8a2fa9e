use std::collections::BTreeSet;

use data_model::{
    messages::{HealthRequest, SpindownRequest, StartRequest, StopRequest},
    AnalysisStats,
    AppId,
    AppState,
};
use tracing::{debug, info, trace};

use super::{EngineSettings, HealthManagerState};

/// Corrective actions computed for one app, applied once the registry borrow
/// is released.
#[derive(Debug, Default)]
struct AppActions {
    stop_instances: Vec<String>,
    start_indices: Vec<u32>,
    spindown: bool,
}

fn millis(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}

impl HealthManagerState {
    pub(super) fn analyze_app(
        &mut self,
        settings: &EngineSettings,
        app_id: &AppId,
        stats: &mut AnalysisStats,
        now_ms: u64,
    ) -> bool {
        let Some(entry) = self.registry.get_mut(app_id) else {
            return false;
        };
        if entry.instance_count == 0 || entry.state == AppState::Stopped {
            return true;
        }
        if now_ms.saturating_sub(entry.last_updated.saturating_mul(1000)) <
            millis(settings.stable_state)
        {
            trace!(app_id = app_id.get(), "app changed recently, not analysing");
            return true;
        }
        if let Some(requested_at_ms) = entry.spindown_requested_at_ms {
            if now_ms.saturating_sub(requested_at_ms) < millis(settings.spindown_retry) {
                return true;
            }
            debug!(
                app_id = app_id.get(),
                "spindown was not applied, analysing the app again"
            );
            entry.spindown_requested_at_ms = None;
        }

        let framework = entry.framework.clone();
        let runtime = entry.runtime.clone();
        stats.app(&framework, &runtime);

        let mut actions = AppActions::default();
        if let Some(period) = settings.inactivity_period_for_spindown {
            let idle_since = entry
                .last_activity_ms
                .unwrap_or_default()
                .max(entry.created_at_ms);
            if !entry.prod && now_ms.saturating_sub(idle_since) > millis(period) {
                info!(
                    app_id = app_id.get(),
                    idle_secs = now_ms.saturating_sub(idle_since) / 1000,
                    "app inactive, spinning down"
                );
                entry.spindown_requested_at_ms = Some(now_ms);
                actions.spindown = true;
            }
        }

        if !actions.spindown {
            let live_version = entry.live_version.clone();
            let stale_versions: Vec<String> = entry
                .versions
                .keys()
                .filter(|version| **version != live_version)
                .cloned()
                .collect();
            for version in stale_versions {
                let Some(stale) = entry.versions.remove(&version) else {
                    continue;
                };
                let alive: Vec<String> = stale
                    .indices
                    .into_values()
                    .filter(|instance| instance.state.is_alive() && !instance.instance_id.is_empty())
                    .map(|instance| instance.instance_id)
                    .collect();
                if !alive.is_empty() {
                    debug!(
                        app_id = app_id.get(),
                        version = %version,
                        instances = alive.len(),
                        "stopping instances of a superseded version"
                    );
                }
                actions.stop_instances.extend(alive);
            }

            let droplet_lost_ms = millis(settings.droplet_lost);
            let restart_timeout_ms = millis(settings.restart_timeout);
            let recently_acted = |last_action_ms: Option<u64>| {
                last_action_ms.is_some_and(|at| now_ms.saturating_sub(at) < restart_timeout_ms)
            };

            let mut running = BTreeSet::new();
            let mut relocating = BTreeSet::new();
            if let Some(live) = entry.live() {
                for (index, instance) in &live.indices {
                    let alive = instance.state.is_alive() &&
                        now_ms.saturating_sub(instance.timestamp_ms) <= droplet_lost_ms;
                    if !alive {
                        continue;
                    }
                    if *index >= entry.instance_count {
                        actions.stop_instances.push(instance.instance_id.clone());
                    } else if instance.prod != entry.prod {
                        if !recently_acted(instance.last_action_ms) {
                            actions.stop_instances.push(instance.instance_id.clone());
                            relocating.insert(*index);
                        }
                    } else {
                        running.insert(*index);
                        stats.running(&framework, &runtime);
                    }
                }
            }

            for index in 0..entry.instance_count {
                if running.contains(&index) {
                    continue;
                }
                if self.crashes.is_given_up(app_id, index) ||
                    self.crashes.restart_pending(app_id, index)
                {
                    stats.flapping(&framework, &runtime);
                    continue;
                }
                stats.missing(&framework, &runtime);
                if relocating.contains(&index) {
                    actions.start_indices.push(index);
                    continue;
                }
                let last_action_ms = entry
                    .live()
                    .and_then(|live| live.indices.get(&index))
                    .and_then(|instance| instance.last_action_ms);
                if recently_acted(last_action_ms) {
                    trace!(app_id = app_id.get(), index, "start already in flight");
                    continue;
                }
                actions.start_indices.push(index);
            }
        }

        let last_updated = entry.last_updated;
        let live_version = entry.live_version.clone();
        stats.crashes(&framework, &runtime, self.crashes.crashes_for_app(app_id));
        self.apply_actions(app_id, last_updated, live_version, actions, now_ms);
        true
    }

    fn apply_actions(
        &mut self,
        app_id: &AppId,
        last_updated: u64,
        live_version: String,
        actions: AppActions,
        now_ms: u64,
    ) {
        if actions.spindown {
            self.enqueue(HealthRequest::Spindown(SpindownRequest {
                droplet: app_id.clone(),
            }));
            return;
        }
        if !actions.stop_instances.is_empty() {
            self.enqueue(HealthRequest::Stop(StopRequest {
                droplet: app_id.clone(),
                last_updated,
                instances: actions.stop_instances,
            }));
        }
        if !actions.start_indices.is_empty() {
            let mut indices = actions.start_indices;
            indices.sort_unstable();
            let flapping = self.crashes.has_flapping_history(app_id).then_some(true);
            self.registry.mark_action(app_id, &indices, now_ms);
            self.enqueue(HealthRequest::Start(StartRequest {
                droplet: app_id.clone(),
                last_updated,
                version: live_version,
                indices,
                flapping,
            }));
        }
    }
}
