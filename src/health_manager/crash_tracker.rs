use std::{cmp::Ordering, collections::HashMap, time::Duration};

use data_model::{messages::StartRequest, AppId, CrashRecord};
use priority_queue::PriorityQueue;
use tracing::debug;

use crate::config::IntervalsConfig;

/// An instance slot: application and index.
pub type IndexKey = (AppId, u32);

/// Epoch milliseconds ordered so the earliest deadline has the highest
/// priority.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReverseDeadline(pub u64);

impl Ord for ReverseDeadline {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for ReverseDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartDelayed(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct FlappingPolicy {
    pub flapping_death: u32,
    pub flapping_timeout: Duration,
    pub min_restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub giveup_crash_number: u32,
}

impl From<&IntervalsConfig> for FlappingPolicy {
    fn from(intervals: &IntervalsConfig) -> Self {
        Self {
            flapping_death: intervals.flapping_death,
            flapping_timeout: intervals.flapping_timeout(),
            min_restart_delay: intervals.min_restart_delay(),
            max_restart_delay: intervals.max_restart_delay(),
            giveup_crash_number: intervals.giveup_crash_number,
        }
    }
}

impl FlappingPolicy {
    /// Restart decision for a record whose latest crash has already been
    /// counted. The delay doubles from the one previously applied to the
    /// record.
    pub fn decide(&self, record: &CrashRecord) -> RestartDecision {
        if record.crash_count <= self.flapping_death {
            return RestartDecision::RestartNow;
        }
        if record.crash_count > self.giveup_crash_number {
            return RestartDecision::GiveUp;
        }
        let delay = if record.current_restart_delay.is_zero() {
            self.min_restart_delay
        } else {
            record.current_restart_delay.saturating_mul(2)
        };
        RestartDecision::RestartDelayed(delay.min(self.max_restart_delay))
    }
}

/// A restart decided but not yet drained to the controller.
#[derive(Debug, Clone)]
pub struct PendingRestart {
    pub fire_at_ms: u64,
    /// The instance whose crash scheduled this restart.
    pub crashed_instance: String,
    pub request: StartRequest,
    /// Set once the fire time passed and the request moved to the queue.
    pub promoted: bool,
}

/// Per-index crash history and the delayed restarts it produced.
#[derive(Debug)]
pub struct CrashTracker {
    policy: FlappingPolicy,
    records: HashMap<IndexKey, CrashRecord>,
    pending: HashMap<IndexKey, PendingRestart>,
    deadlines: PriorityQueue<IndexKey, ReverseDeadline>,
}

impl CrashTracker {
    pub fn new(policy: FlappingPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            pending: HashMap::new(),
            deadlines: PriorityQueue::new(),
        }
    }

    pub fn record(&self, app_id: &AppId, index: u32) -> Option<&CrashRecord> {
        self.records.get(&(app_id.clone(), index))
    }

    pub fn crash_count(&self, app_id: &AppId, index: u32) -> u32 {
        self.record(app_id, index)
            .map(|record| record.crash_count)
            .unwrap_or_default()
    }

    /// Whether the exit `(instance_id, crash_timestamp_ms)` was already
    /// counted for this index.
    pub fn is_duplicate(
        &self,
        app_id: &AppId,
        index: u32,
        instance_id: &str,
        crash_timestamp_ms: u64,
    ) -> bool {
        self.record(app_id, index).is_some_and(|record| {
            record.last_crash_instance.as_deref() == Some(instance_id) &&
                record.last_crash_timestamp_ms == Some(crash_timestamp_ms)
        })
    }

    /// Marks an exit as seen without counting it as a crash.
    pub fn note_exit(
        &mut self,
        app_id: &AppId,
        index: u32,
        instance_id: &str,
        crash_timestamp_ms: u64,
    ) {
        let record = self.records.entry((app_id.clone(), index)).or_default();
        record.last_crash_instance = Some(instance_id.to_string());
        record.last_crash_timestamp_ms = Some(crash_timestamp_ms);
    }

    /// Counts a crash and decides what to do about it.
    pub fn on_crash(
        &mut self,
        app_id: &AppId,
        index: u32,
        instance_id: &str,
        crash_timestamp_ms: u64,
        now_ms: u64,
    ) -> RestartDecision {
        let record = self.records.entry((app_id.clone(), index)).or_default();
        if record.crash_count == 0 {
            record.first_crash_at_ms = now_ms;
        }
        record.crash_count += 1;
        record.last_crash_at_ms = now_ms;
        record.last_crash_instance = Some(instance_id.to_string());
        record.last_crash_timestamp_ms = Some(crash_timestamp_ms);

        let decision = self.policy.decide(record);
        match &decision {
            RestartDecision::RestartDelayed(delay) => record.current_restart_delay = *delay,
            RestartDecision::GiveUp => {
                record.given_up = true;
                self.clear_pending(app_id, index);
            }
            RestartDecision::RestartNow => {}
        }
        decision
    }

    /// Clears the history of an index that has been running for longer than
    /// the flapping window since its last crash. Given-up indices keep their
    /// history until the app is redeployed.
    pub fn on_sustained_running(&mut self, app_id: &AppId, index: u32, now_ms: u64) {
        let key = (app_id.clone(), index);
        let window_ms = self.policy.flapping_timeout.as_millis() as u64;
        let expired = self.records.get(&key).is_some_and(|record| {
            !record.given_up && now_ms.saturating_sub(record.last_crash_at_ms) > window_ms
        });
        if expired {
            debug!(app_id = app_id.get(), index, "crash history expired");
            self.records.remove(&key);
        }
    }

    pub fn is_given_up(&self, app_id: &AppId, index: u32) -> bool {
        self.record(app_id, index)
            .is_some_and(|record| record.given_up)
    }

    /// Whether any index of the app has crashed past the flapping threshold.
    pub fn has_flapping_history(&self, app_id: &AppId) -> bool {
        self.records.iter().any(|((id, _), record)| {
            id == app_id && record.crash_count > self.policy.flapping_death
        })
    }

    pub fn crashes_for_app(&self, app_id: &AppId) -> u64 {
        self.records
            .iter()
            .filter(|((id, _), _)| id == app_id)
            .map(|(_, record)| record.crash_count as u64)
            .sum()
    }

    pub fn schedule_restart(
        &mut self,
        app_id: &AppId,
        index: u32,
        fire_at_ms: u64,
        crashed_instance: &str,
        request: StartRequest,
    ) {
        let key = (app_id.clone(), index);
        self.pending.insert(
            key.clone(),
            PendingRestart {
                fire_at_ms,
                crashed_instance: crashed_instance.to_string(),
                request,
                promoted: false,
            },
        );
        if self
            .deadlines
            .change_priority(&key, ReverseDeadline(fire_at_ms))
            .is_none()
        {
            self.deadlines.push(key, ReverseDeadline(fire_at_ms));
        }
    }

    /// True from the moment a delayed restart is decided until its START has
    /// been drained from the request queue.
    pub fn restart_pending(&self, app_id: &AppId, index: u32) -> bool {
        self.pending.contains_key(&(app_id.clone(), index))
    }

    pub fn pending(&self, app_id: &AppId, index: u32) -> Option<&PendingRestart> {
        self.pending.get(&(app_id.clone(), index))
    }

    /// Drops a pending restart when a different instance reports running for
    /// the index. Reports from the crashed instance itself are stale.
    pub fn cancel_pending(&mut self, app_id: &AppId, index: u32, running_instance: &str) -> bool {
        let key = (app_id.clone(), index);
        let superseded = self.pending.get(&key).is_some_and(|pending| {
            !pending.promoted && pending.crashed_instance != running_instance
        });
        if superseded {
            debug!(
                app_id = app_id.get(),
                index,
                instance = %running_instance,
                "pending restart superseded by a running instance"
            );
            self.pending.remove(&key);
            self.deadlines.remove(&key);
        }
        superseded
    }

    /// Pops restarts whose fire time has passed, earliest first. They stay
    /// pending until [`CrashTracker::clear_pending`] is called for them.
    pub fn take_ready(&mut self, now_ms: u64) -> Vec<(IndexKey, StartRequest)> {
        let mut ready = vec![];
        while let Some((_, deadline)) = self.deadlines.peek() {
            if deadline.0 > now_ms {
                break;
            }
            let Some((key, _)) = self.deadlines.pop() else {
                break;
            };
            if let Some(pending) = self.pending.get_mut(&key) {
                pending.promoted = true;
                ready.push((key, pending.request.clone()));
            }
        }
        ready
    }

    pub fn clear_pending(&mut self, app_id: &AppId, index: u32) {
        let key = (app_id.clone(), index);
        self.pending.remove(&key);
        self.deadlines.remove(&key);
    }

    /// Forgets every record and pending restart of the app.
    pub fn reset_app(&mut self, app_id: &AppId) {
        self.records.retain(|(id, _), _| id != app_id);
        self.pending.retain(|(id, _), _| id != app_id);
        let keys: Vec<IndexKey> = self
            .deadlines
            .iter()
            .filter(|((id, _), _)| id == app_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.deadlines.remove(&key);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::app_id;

    use super::*;

    fn policy() -> FlappingPolicy {
        FlappingPolicy {
            flapping_death: 2,
            flapping_timeout: Duration::from_secs(5),
            min_restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(3),
            giveup_crash_number: 5,
        }
    }

    fn start(app: &AppId) -> StartRequest {
        StartRequest {
            droplet: app.clone(),
            last_updated: 0,
            version: "v-0".to_string(),
            indices: vec![0],
            flapping: Some(true),
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        let decisions: Vec<RestartDecision> = (0..7)
            .map(|n| tracker.on_crash(&app, 0, "i-0", n * 1000, n * 1000))
            .collect();
        assert_eq!(
            decisions,
            vec![
                RestartDecision::RestartNow,
                RestartDecision::RestartNow,
                RestartDecision::RestartDelayed(Duration::from_secs(1)),
                RestartDecision::RestartDelayed(Duration::from_secs(2)),
                RestartDecision::RestartDelayed(Duration::from_secs(3)),
                RestartDecision::GiveUp,
                RestartDecision::GiveUp,
            ]
        );
        assert!(tracker.is_given_up(&app, 0));
        assert!(!tracker.is_given_up(&app, 1));
        assert_eq!(tracker.crash_count(&app, 0), 7);
    }

    #[test]
    fn test_give_up_drops_pending_restart() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        for n in 0..5 {
            tracker.on_crash(&app, 0, "i-0", n * 1000, n * 1000);
        }
        tracker.schedule_restart(&app, 0, 8_000, "i-0", start(&app));
        assert_eq!(
            tracker.on_crash(&app, 0, "i-0", 6_000, 6_000),
            RestartDecision::GiveUp
        );
        assert!(!tracker.restart_pending(&app, 0));
        assert!(tracker.take_ready(10_000).is_empty());
    }

    #[test]
    fn test_duplicate_exit_detection() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        tracker.on_crash(&app, 0, "i-0", 10_000, 10_000);
        assert!(tracker.is_duplicate(&app, 0, "i-0", 10_000));
        assert!(!tracker.is_duplicate(&app, 0, "i-0", 11_000));
        assert!(!tracker.is_duplicate(&app, 0, "i-1", 10_000));
    }

    #[test]
    fn test_pending_restart_lifecycle() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        tracker.schedule_restart(&app, 0, 5_000, "i-0", start(&app));
        assert!(tracker.restart_pending(&app, 0));

        assert!(tracker.take_ready(4_999).is_empty());
        let ready = tracker.take_ready(5_000);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, (app.clone(), 0));
        // promoted but not drained yet
        assert!(tracker.restart_pending(&app, 0));

        tracker.clear_pending(&app, 0);
        assert!(!tracker.restart_pending(&app, 0));
    }

    #[test]
    fn test_cancel_pending_ignores_crashed_instance() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        tracker.schedule_restart(&app, 0, 5_000, "i-0", start(&app));

        assert!(!tracker.cancel_pending(&app, 0, "i-0"));
        assert!(tracker.restart_pending(&app, 0));

        assert!(tracker.cancel_pending(&app, 0, "i-9"));
        assert!(!tracker.restart_pending(&app, 0));
        assert!(tracker.take_ready(10_000).is_empty());
    }

    #[test]
    fn test_sustained_running_resets_history() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        tracker.on_crash(&app, 0, "i-0", 1_000, 1_000);
        tracker.on_sustained_running(&app, 0, 3_000);
        assert_eq!(tracker.crash_count(&app, 0), 1);
        tracker.on_sustained_running(&app, 0, 7_000);
        assert_eq!(tracker.crash_count(&app, 0), 0);
    }

    #[test]
    fn test_reset_app_clears_give_up() {
        let mut tracker = CrashTracker::new(policy());
        let app = app_id("1");
        let other = app_id("2");
        for n in 0..6 {
            tracker.on_crash(&app, 0, "i-0", n, n);
        }
        tracker.schedule_restart(&other, 1, 5_000, "j-1", start(&other));
        assert!(tracker.is_given_up(&app, 0));

        tracker.reset_app(&app);
        assert!(!tracker.is_given_up(&app, 0));
        assert!(tracker.restart_pending(&other, 1));
        assert_eq!(tracker.pending_len(), 1);
    }
}
