use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{sync::watch, time::MissedTickBehavior};

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    get_epoch_time().as_millis() as u64
}

fn get_epoch_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Converts a wire timestamp expressed in (possibly fractional) seconds into
/// epoch milliseconds.
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_sign_negative() || !secs.is_finite() {
        return 0;
    }
    (secs * 1000.0) as u64
}

/// Source of "now" for every time-based decision of the health manager.
///
/// Production code uses [`SystemClock`]; tests drive a [`ManualClock`] so that
/// backoff windows, spindown periods and stale-heartbeat checks can be crossed
/// without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        get_epoch_time_in_ms()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Runs `tick` every `period` until the shutdown channel fires.
///
/// Ticks never overlap: a slow tick delays the next one instead of bursting.
pub async fn run_periodically<F, Fut>(
    period: Duration,
    mut shutdown_rx: watch::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown_rx.changed() => break,
        }
    }
}
