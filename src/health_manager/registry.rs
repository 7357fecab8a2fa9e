use std::collections::{BTreeMap, HashSet};

use data_model::{AppId, DesiredAppState, DropletEntry, InstanceState};

/// Observed state of every known application. The only owner of
/// [`DropletEntry`] values.
#[derive(Debug, Default)]
pub struct DropletRegistry {
    droplets: BTreeMap<AppId, DropletEntry>,
}

/// Outcome of reconciling the registry with a desired-state snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub created: Vec<AppId>,
    pub version_changed: Vec<AppId>,
    pub removed: Vec<AppId>,
}

impl DropletRegistry {
    pub fn get(&self, app_id: &AppId) -> Option<&DropletEntry> {
        self.droplets.get(app_id)
    }

    pub fn get_mut(&mut self, app_id: &AppId) -> Option<&mut DropletEntry> {
        self.droplets.get_mut(app_id)
    }

    /// Entry for an app first seen in a host report.
    pub fn get_or_create(&mut self, app_id: &AppId, now_ms: u64) -> &mut DropletEntry {
        self.droplets
            .entry(app_id.clone())
            .or_insert_with(|| DropletEntry::new(app_id.clone(), now_ms))
    }

    pub fn ids(&self) -> Vec<AppId> {
        self.droplets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.droplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.droplets.is_empty()
    }

    /// Creates or refreshes the entry of one app. Returns true when the live
    /// version changed.
    pub fn update_droplet(&mut self, desired: &DesiredAppState, now_ms: u64) -> bool {
        match self.droplets.get_mut(&desired.app_id) {
            Some(entry) => entry.apply_desired(desired),
            None => {
                self.droplets.insert(
                    desired.app_id.clone(),
                    DropletEntry::from_desired(desired, now_ms),
                );
                false
            }
        }
    }

    /// Makes the registry reflect `apps`: entries are created or refreshed and
    /// entries of apps missing from the snapshot are removed.
    pub fn sync(&mut self, apps: &[DesiredAppState], now_ms: u64) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let mut seen = HashSet::with_capacity(apps.len());
        for app in apps {
            seen.insert(app.app_id.clone());
            let existed = self.droplets.contains_key(&app.app_id);
            if self.update_droplet(app, now_ms) {
                outcome.version_changed.push(app.app_id.clone());
            }
            if !existed {
                outcome.created.push(app.app_id.clone());
            }
        }
        self.droplets.retain(|app_id, _| {
            let keep = seen.contains(app_id);
            if !keep {
                outcome.removed.push(app_id.clone());
            }
            keep
        });
        outcome
    }

    /// Records a corrective action for the given indices of the live
    /// version, creating DOWN placeholders for indices no host reported yet.
    pub fn mark_action(&mut self, app_id: &AppId, indices: &[u32], now_ms: u64) {
        let Some(entry) = self.droplets.get_mut(app_id) else {
            return;
        };
        let live = entry.live_mut();
        for index in indices {
            live.indices
                .entry(*index)
                .or_insert_with(|| InstanceState::down(now_ms))
                .last_action_ms = Some(now_ms);
        }
    }
}
