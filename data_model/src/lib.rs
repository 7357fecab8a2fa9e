pub mod messages;
pub mod test_objects;

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
    time::Duration,
};

use derive_builder::Builder;
use serde::{de, Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

pub const DEFAULT_PARTITION: &str = "default";

/// Deserializes an identifier that producers may send either as a JSON string
/// or as a JSON number.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => Ok(s),
        StringOrNumber::Unsigned(n) => Ok(n.to_string()),
        StringOrNumber::Signed(n) => Ok(n.to_string()),
        StringOrNumber::Float(f) if f.fract() == 0.0 => Ok((f as i64).to_string()),
        StringOrNumber::Float(f) => Err(de::Error::custom(format!(
            "expected an identifier, got {}",
            f
        ))),
    }
}

/// Deserializes a field whose producers send `null` when they mean "not set",
/// falling back to the type's default.
pub fn default_if_null<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for AppId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        string_or_number(deserializer).map(AppId)
    }
}

/// The control-plane partition a message belongs to.
///
/// Producers that predate partitioning omit the tag or send it as `null`; an
/// absent tag is the [`DEFAULT_PARTITION`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Partition(String);

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self(DEFAULT_PARTITION.to_string())
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    StrumDisplay,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStateKind {
    Starting,
    Running,
    Crashed,
    Down,
    Flapping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceStateKind {
    /// An instance in one of these states counts towards the desired count.
    pub fn is_alive(&self) -> bool {
        matches!(self, InstanceStateKind::Starting | InstanceStateKind::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, StrumDisplay)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    #[default]
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, StrumDisplay)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    #[default]
    Pending,
    Staged,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    /// Memory in megabytes.
    pub mem: u64,
    pub disk: u64,
    pub fds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            mem: 256,
            disk: 2048,
            fds: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AppMetadata {
    #[serde(default)]
    pub debug: Option<String>,
    #[serde(default)]
    pub console: bool,
}

/// An application as recorded by the desired-state source. Read-only to the
/// reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq)]
#[builder(setter(into))]
pub struct DesiredAppState {
    pub app_id: AppId,
    #[builder(default)]
    #[serde(default)]
    pub name: String,
    pub instance_count: u32,
    #[builder(default)]
    #[serde(default)]
    pub state: AppState,
    #[builder(default)]
    #[serde(default)]
    pub package_state: PackageState,
    pub staged_package_hash: String,
    #[builder(default)]
    #[serde(default)]
    pub run_count: u32,
    pub runtime: String,
    pub framework: String,
    #[builder(default)]
    #[serde(default)]
    pub prod: bool,
    /// Seconds since the epoch.
    pub last_updated: u64,
    #[builder(default)]
    #[serde(default)]
    pub user_emails: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub uris: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub limits: Limits,
    #[builder(default)]
    #[serde(default)]
    pub env: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub services: Vec<serde_json::Value>,
    #[builder(default)]
    #[serde(default)]
    pub metadata: AppMetadata,
}

impl DesiredAppState {
    /// Identifies the staged package and the run it belongs to.
    pub fn version(&self) -> String {
        format!("{}-{}", self.staged_package_hash, self.run_count)
    }

    pub fn is_started(&self) -> bool {
        self.state == AppState::Started
    }

    pub fn is_staged(&self) -> bool {
        self.package_state == PackageState::Staged
    }

    pub fn staging_failed(&self) -> bool {
        self.package_state == PackageState::Failed
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceState {
    pub state: InstanceStateKind,
    /// Time of the last report for this index, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Time of the last corrective action taken for this index.
    pub last_action_ms: Option<u64>,
    pub instance_id: String,
    /// Whether the instance runs on a prod-only host.
    pub prod: bool,
    /// Wire timestamp of the last exit processed for this instance.
    pub crash_timestamp_ms: Option<u64>,
}

impl InstanceState {
    pub fn new(state: InstanceStateKind, instance_id: String, timestamp_ms: u64) -> Self {
        Self {
            state,
            timestamp_ms,
            last_action_ms: None,
            instance_id,
            prod: false,
            crash_timestamp_ms: None,
        }
    }

    /// Placeholder used when a corrective action is taken for an index no
    /// host has reported yet.
    pub fn down(timestamp_ms: u64) -> Self {
        Self::new(InstanceStateKind::Down, String::new(), timestamp_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VersionEntry {
    pub indices: BTreeMap<u32, InstanceState>,
}

/// Observed state of one application.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DropletEntry {
    pub app_id: AppId,
    pub state: AppState,
    pub instance_count: u32,
    pub framework: String,
    pub runtime: String,
    pub prod: bool,
    /// Seconds since the epoch, copied from the desired state.
    pub last_updated: u64,
    pub live_version: String,
    pub last_activity_ms: Option<u64>,
    pub created_at_ms: u64,
    /// When a spindown was last queued for this app. Cleared by new activity,
    /// by a restart of the app, or once the retry window passes without the
    /// app being stopped.
    pub spindown_requested_at_ms: Option<u64>,
    pub versions: BTreeMap<String, VersionEntry>,
}

impl DropletEntry {
    pub fn new(app_id: AppId, created_at_ms: u64) -> Self {
        Self {
            app_id,
            state: AppState::Started,
            instance_count: 0,
            framework: String::new(),
            runtime: String::new(),
            prod: false,
            last_updated: 0,
            live_version: String::new(),
            last_activity_ms: None,
            created_at_ms,
            spindown_requested_at_ms: None,
            versions: BTreeMap::new(),
        }
    }

    pub fn from_desired(desired: &DesiredAppState, created_at_ms: u64) -> Self {
        let mut entry = Self::new(desired.app_id.clone(), created_at_ms);
        entry.apply_desired(desired);
        entry
    }

    /// Refreshes the desired-state view of the entry.
    ///
    /// Returns true when the live version changed.
    pub fn apply_desired(&mut self, desired: &DesiredAppState) -> bool {
        let version = desired.version();
        let version_changed = !self.live_version.is_empty() && self.live_version != version;
        if self.state == AppState::Stopped && desired.is_started() {
            self.spindown_requested_at_ms = None;
        }
        self.state = desired.state;
        self.instance_count = desired.instance_count;
        self.framework = desired.framework.clone();
        self.runtime = desired.runtime.clone();
        self.prod = desired.prod;
        self.last_updated = desired.last_updated;
        self.live_version = version;
        version_changed
    }

    pub fn live(&self) -> Option<&VersionEntry> {
        self.versions.get(&self.live_version)
    }

    pub fn live_mut(&mut self) -> &mut VersionEntry {
        self.versions
            .entry(self.live_version.clone())
            .or_default()
    }

    pub fn version_mut(&mut self, version: &str) -> &mut VersionEntry {
        self.versions.entry(version.to_string()).or_default()
    }
}

/// Crash history of one index of an application, independent of version.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct CrashRecord {
    pub crash_count: u32,
    pub first_crash_at_ms: u64,
    pub last_crash_at_ms: u64,
    pub current_restart_delay: Duration,
    pub given_up: bool,
    pub last_crash_instance: Option<String>,
    pub last_crash_timestamp_ms: Option<u64>,
}

/// Counters for one framework or runtime.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct InstanceCounts {
    pub apps: u64,
    pub running_instances: u64,
    pub missing_instances: u64,
    pub flapping_instances: u64,
    pub crashes: u64,
}

/// Observability counters filled in by an analysis pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AnalysisStats {
    pub running: u64,
    pub down: u64,
    pub flapping: u64,
    pub frameworks: HashMap<String, InstanceCounts>,
    pub runtimes: HashMap<String, InstanceCounts>,
}

impl AnalysisStats {
    pub fn app(&mut self, framework: &str, runtime: &str) {
        self.frameworks.entry(framework.to_string()).or_default().apps += 1;
        self.runtimes.entry(runtime.to_string()).or_default().apps += 1;
    }

    pub fn running(&mut self, framework: &str, runtime: &str) {
        self.running += 1;
        self.frameworks
            .entry(framework.to_string())
            .or_default()
            .running_instances += 1;
        self.runtimes
            .entry(runtime.to_string())
            .or_default()
            .running_instances += 1;
    }

    pub fn missing(&mut self, framework: &str, runtime: &str) {
        self.down += 1;
        self.frameworks
            .entry(framework.to_string())
            .or_default()
            .missing_instances += 1;
        self.runtimes
            .entry(runtime.to_string())
            .or_default()
            .missing_instances += 1;
    }

    pub fn flapping(&mut self, framework: &str, runtime: &str) {
        self.flapping += 1;
        self.frameworks
            .entry(framework.to_string())
            .or_default()
            .flapping_instances += 1;
        self.runtimes
            .entry(runtime.to_string())
            .or_default()
            .flapping_instances += 1;
    }

    pub fn crashes(&mut self, framework: &str, runtime: &str, crashes: u64) {
        self.frameworks
            .entry(framework.to_string())
            .or_default()
            .crashes += crashes;
        self.runtimes.entry(runtime.to_string()).or_default().crashes += crashes;
    }
}

/// A runtime known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub debug_modes: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// A framework and the runtimes it can run on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FrameworkInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtimes: Vec<String>,
    #[serde(default)]
    pub default_runtime: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl FrameworkInfo {
    pub fn supports_runtime(&self, runtime: &str) -> bool {
        self.runtimes.iter().any(|rt| rt == runtime)
    }
}
