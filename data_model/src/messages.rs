//! Payloads exchanged over the message bus.

use hm_utils::secs_to_ms;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

use crate::{
    default_if_null,
    string_or_number,
    AppId,
    InstanceStateKind,
    Limits,
    Partition,
};

pub mod subjects {
    pub const DEA_HEARTBEAT: &str = "dea.heartbeat";
    pub const DEA_EXITED: &str = "dea.exited";
    pub const DEA_ADVERTISE: &str = "dea.advertise";
    pub const DEA_LOCATE: &str = "dea.locate";
    pub const DEA_DISCOVER: &str = "dea.discover";
    pub const DEA_STOP: &str = "dea.stop";
    pub const DEA_FIND_DROPLET: &str = "dea.find.droplet";
    pub const ACTIVE_APPS: &str = "router.active_apps";
    pub const HEALTH_STATUS: &str = "healthmanager.status";

    pub fn dea_start(dea_id: &str) -> String {
        format!("dea.{}.start", dea_id)
    }

    pub fn health_requests(partition: &str) -> String {
        format!("cloudcontrollers.hm.requests.{}", partition)
    }
}

/// One instance report inside a `dea.heartbeat` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceHeartbeat {
    pub droplet: AppId,
    #[serde(default, deserialize_with = "default_if_null")]
    pub cc_partition: Partition,
    pub index: u32,
    #[serde(deserialize_with = "string_or_number")]
    pub instance: String,
    pub state: InstanceStateKind,
    pub version: String,
    pub state_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prod: Option<bool>,
}

impl InstanceHeartbeat {
    pub fn timestamp_ms(&self) -> u64 {
        secs_to_ms(self.state_timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub droplets: Vec<InstanceHeartbeat>,
    /// Whether the reporting host is a prod-only host. Applies to every
    /// report that does not carry its own flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prod: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dea: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Crashed,
    Stopped,
    DeaShutdown,
    DeaEvacuation,
    #[serde(other)]
    Other,
}

impl ExitReason {
    /// Exits initiated by the host rather than by a failure of the app.
    pub fn is_host_initiated(&self) -> bool {
        matches!(self, ExitReason::DeaEvacuation | ExitReason::DeaShutdown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExitedMessage {
    pub droplet: AppId,
    #[serde(default, deserialize_with = "default_if_null")]
    pub cc_partition: Partition,
    pub version: String,
    pub index: u32,
    #[serde(deserialize_with = "string_or_number")]
    pub instance: String,
    pub reason: ExitReason,
    pub crash_timestamp: f64,
}

impl ExitedMessage {
    pub fn timestamp_ms(&self) -> u64 {
        secs_to_ms(self.crash_timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    pub droplet: AppId,
    pub last_updated: u64,
    pub version: String,
    pub indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flapping: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopRequest {
    pub droplet: AppId,
    pub last_updated: u64,
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpindownRequest {
    pub droplet: AppId,
}

/// A corrective action sent to the owning controller on
/// `cloudcontrollers.hm.requests.<partition>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HealthRequest {
    Start(StartRequest),
    Stop(StopRequest),
    Spindown(SpindownRequest),
}

impl HealthRequest {
    pub fn droplet(&self) -> &AppId {
        match self {
            HealthRequest::Start(req) => &req.droplet,
            HealthRequest::Stop(req) => &req.droplet,
            HealthRequest::Spindown(req) => &req.droplet,
        }
    }
}

/// Payload of `dea.stop`. With neither instances nor indices every instance of
/// the droplet is stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StopMessage {
    pub droplet: AppId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Vec<u32>>,
}

/// Payload of `dea.<host>.start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StartInstanceMessage {
    pub droplet: AppId,
    pub name: String,
    pub uris: Vec<String>,
    pub runtime: String,
    pub runtime_info: serde_json::Value,
    pub framework: String,
    pub prod: bool,
    pub sha1: String,
    #[serde(rename = "executableUri")]
    pub executable_uri: String,
    pub version: String,
    pub services: Vec<serde_json::Value>,
    pub limits: Limits,
    pub env: Vec<String>,
    pub users: Vec<String>,
    pub cc_partition: Partition,
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    #[serde(default)]
    pub console: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flapping: Option<bool>,
}

/// Payload of `dea.discover`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverRequest {
    pub droplet: AppId,
    pub name: String,
    pub limits: Limits,
    pub runtime: String,
    pub runtime_info: serde_json::Value,
    pub prod: bool,
    pub sha: String,
}

impl From<&StartInstanceMessage> for DiscoverRequest {
    fn from(message: &StartInstanceMessage) -> Self {
        Self {
            droplet: message.droplet.clone(),
            name: message.name.clone(),
            limits: message.limits.clone(),
            runtime: message.runtime.clone(),
            runtime_info: message.runtime_info.clone(),
            prod: message.prod,
            sha: message.sha1.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverReply {
    pub id: String,
}

/// Payload of `dea.advertise`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeaAdvertisement {
    pub id: String,
    #[serde(default)]
    pub runtimes: Vec<String>,
    /// Memory in megabytes.
    pub available_memory: u64,
    #[serde(default)]
    pub prod: bool,
}

/// Payload of the compressed activity digest: the ids of apps that served
/// traffic recently.
pub type ActiveApps = Vec<AppId>;

/// Request on `healthmanager.status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRequest {
    pub droplet: AppId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub state: InstanceStateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSince {
    pub index: u32,
    pub since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSince {
    pub instance: String,
    pub since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FlappingStatusReply {
    pub indices: Vec<IndexSince>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CrashedStatusReply {
    pub instances: Vec<InstanceSince>,
}

/// Request on `dea.find.droplet`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindDropletRequest {
    pub droplet: AppId,
    pub version: String,
    pub states: Vec<InstanceStateKind>,
    #[serde(default)]
    pub include_stats: bool,
}

/// A host's answer to `dea.find.droplet`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceReport {
    pub index: i64,
    pub state: InstanceStateKind,
    #[serde(default)]
    pub state_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

/// One slot of the per-index view assembled by `find_instances` and
/// `find_stats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub index: u32,
    pub state: InstanceStateKind,
    pub since: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl InstanceView {
    pub fn down(index: u32, since: u64) -> Self {
        Self {
            index,
            state: InstanceStateKind::Down,
            since,
            debug_ip: None,
            debug_port: None,
            console_ip: None,
            console_port: None,
            stats: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_health_request_wire_format() {
        let start = HealthRequest::Start(StartRequest {
            droplet: AppId::from("7"),
            last_updated: 100,
            version: "abc-0".to_string(),
            indices: vec![0, 1, 2],
            flapping: None,
        });
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({
                "op": "START",
                "droplet": "7",
                "last_updated": 100,
                "version": "abc-0",
                "indices": [0, 1, 2],
            })
        );
        assert_eq!(start.as_ref(), "START");

        let spindown: HealthRequest =
            serde_json::from_value(json!({"droplet": 7, "op": "SPINDOWN"})).unwrap();
        assert_eq!(
            spindown,
            HealthRequest::Spindown(SpindownRequest {
                droplet: AppId::from("7")
            })
        );

        assert!(serde_json::from_value::<HealthRequest>(json!({"droplet": "7", "op": "RESTART"}))
            .is_err());
    }

    #[test]
    fn test_heartbeat_defaults_partition() {
        let hb: HeartbeatMessage = serde_json::from_value(json!({
            "droplets": [{
                "droplet": "1",
                "index": 0,
                "instance": "badbeef-0",
                "state": "RUNNING",
                "version": "abc-0",
                "state_timestamp": 12.5,
            }]
        }))
        .unwrap();
        assert_eq!(hb.droplets[0].cc_partition, Partition::default());
        assert_eq!(hb.droplets[0].timestamp_ms(), 12_500);
        assert_eq!(hb.prod, None);
    }

    #[test]
    fn test_null_partition_is_default() {
        let report: InstanceHeartbeat = serde_json::from_value(json!({
            "droplet": 1,
            "cc_partition": null,
            "index": 0,
            "instance": "badbeef-0",
            "state": "RUNNING",
            "version": "abc-0",
            "state_timestamp": 1,
        }))
        .unwrap();
        assert_eq!(report.cc_partition, Partition::default());

        let exited: ExitedMessage = serde_json::from_value(json!({
            "droplet": 1,
            "cc_partition": null,
            "version": "abc-0",
            "index": 0,
            "instance": "badbeef-0",
            "reason": "CRASHED",
            "crash_timestamp": 1,
        }))
        .unwrap();
        assert_eq!(exited.cc_partition, Partition::default());
    }

    #[test]
    fn test_exited_message_accepts_numeric_instance() {
        let exited: ExitedMessage = serde_json::from_value(json!({
            "droplet": "1",
            "cc_partition": "default",
            "version": "abc-0",
            "index": 0,
            "instance": 0,
            "reason": "DEA_EVACUATION",
            "crash_timestamp": 10,
        }))
        .unwrap();
        assert_eq!(exited.instance, "0");
        assert!(exited.reason.is_host_initiated());

        let exited: ExitedMessage = serde_json::from_value(json!({
            "droplet": "1",
            "version": "abc-0",
            "index": 0,
            "instance": "x",
            "reason": "OUT_OF_MEMORY",
            "crash_timestamp": 10,
        }))
        .unwrap();
        assert_eq!(exited.reason, ExitReason::Other);
    }

    #[test]
    fn test_start_message_uses_executable_uri_key() {
        let message = StartInstanceMessage {
            droplet: AppId::from("1"),
            executable_uri: "http://cc/staged_droplets/1/abc".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["executableUri"], "http://cc/staged_droplets/1/abc");
        assert!(value.get("flapping").is_none());
    }
}
