pub mod tests {
    use crate::{
        messages::{ExitReason, ExitedMessage, HeartbeatMessage, InstanceHeartbeat},
        AppId,
        AppState,
        DesiredAppState,
        DesiredAppStateBuilder,
        InstanceStateKind,
        PackageState,
        Partition,
    };

    pub const TEST_FRAMEWORK: &str = "sinatra";
    pub const TEST_RUNTIME: &str = "ruby19";
    pub const TEST_LAST_UPDATED: u64 = 1_700_000_000;

    pub fn mock_app(app_id: &str, instances: u32) -> DesiredAppState {
        DesiredAppStateBuilder::default()
            .app_id(app_id)
            .name(format!("app-{}", app_id))
            .instance_count(instances)
            .state(AppState::Started)
            .package_state(PackageState::Staged)
            .staged_package_hash(format!("{:0>40}", app_id))
            .run_count(0u32)
            .runtime(TEST_RUNTIME)
            .framework(TEST_FRAMEWORK)
            .last_updated(TEST_LAST_UPDATED)
            .user_emails(vec!["test@example.com".to_string()])
            .uris(vec![format!("app-{}.vcap.me", app_id)])
            .build()
            .unwrap()
    }

    pub fn instance_id(app: &DesiredAppState, index: u32) -> String {
        format!("{}-badbeef-{}", app.app_id, index)
    }

    pub fn mock_instance_heartbeat(
        app: &DesiredAppState,
        index: u32,
        state_timestamp: f64,
    ) -> InstanceHeartbeat {
        InstanceHeartbeat {
            droplet: app.app_id.clone(),
            cc_partition: Partition::default(),
            index,
            instance: instance_id(app, index),
            state: InstanceStateKind::Running,
            version: app.version(),
            state_timestamp,
            prod: None,
        }
    }

    pub fn mock_heartbeat(
        app: &DesiredAppState,
        indices: &[u32],
        state_timestamp: f64,
    ) -> HeartbeatMessage {
        HeartbeatMessage {
            droplets: indices
                .iter()
                .map(|index| mock_instance_heartbeat(app, *index, state_timestamp))
                .collect(),
            prod: None,
            dea: Some("dea-1".to_string()),
        }
    }

    pub fn mock_exited(app: &DesiredAppState, index: u32, crash_timestamp: f64) -> ExitedMessage {
        ExitedMessage {
            droplet: app.app_id.clone(),
            cc_partition: Partition::default(),
            version: app.version(),
            index,
            instance: instance_id(app, index),
            reason: ExitReason::Crashed,
            crash_timestamp,
        }
    }

    pub fn app_id(id: &str) -> AppId {
        AppId::from(id)
    }
}
