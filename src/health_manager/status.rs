use anyhow::{anyhow, Result};
use data_model::{
    messages::{
        CrashedStatusReply,
        FlappingStatusReply,
        IndexSince,
        InstanceSince,
        StatusRequest,
    },
    InstanceStateKind,
};

use super::HealthManagerState;

/// Builds the JSON answer to a `healthmanager.status` query.
pub fn status_reply(state: &HealthManagerState, request: &StatusRequest) -> Result<Vec<u8>> {
    let entry = state.registry.get(&request.droplet);
    match request.state {
        InstanceStateKind::Flapping => {
            let mut reply = FlappingStatusReply::default();
            if let Some(entry) = entry {
                let version = request.version.as_ref().unwrap_or(&entry.live_version);
                if let Some(version_entry) = entry.versions.get(version) {
                    for (index, instance) in &version_entry.indices {
                        let flapping = instance.state == InstanceStateKind::Flapping ||
                            state.crashes.is_given_up(&entry.app_id, *index);
                        if !flapping {
                            continue;
                        }
                        let since_ms = state
                            .crashes
                            .record(&entry.app_id, *index)
                            .map(|record| record.last_crash_at_ms)
                            .unwrap_or(instance.timestamp_ms);
                        reply.indices.push(IndexSince {
                            index: *index,
                            since: since_ms / 1000,
                        });
                    }
                }
            }
            Ok(serde_json::to_vec(&reply)?)
        }
        InstanceStateKind::Crashed => {
            let mut reply = CrashedStatusReply::default();
            if let Some(entry) = entry {
                let versions = entry
                    .versions
                    .iter()
                    .filter(|(version, _)| request.version.as_ref().map_or(true, |v| v == *version));
                for (_, version_entry) in versions {
                    for instance in version_entry.indices.values() {
                        let Some(crashed_at_ms) = instance.crash_timestamp_ms else {
                            continue;
                        };
                        let crashed = matches!(
                            instance.state,
                            InstanceStateKind::Crashed | InstanceStateKind::Flapping
                        );
                        if !crashed || instance.instance_id.is_empty() {
                            continue;
                        }
                        reply.instances.push(InstanceSince {
                            instance: instance.instance_id.clone(),
                            since: crashed_at_ms / 1000,
                        });
                    }
                }
            }
            Ok(serde_json::to_vec(&reply)?)
        }
        other => Err(anyhow!("unsupported status query for state {}", other)),
    }
}
