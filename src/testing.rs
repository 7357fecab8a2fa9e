use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use data_model::{
    messages::{subjects, DiscoverReply, HealthRequest},
    DesiredAppState,
};
use hm_utils::{Clock, ManualClock};
use message_bus::{BusConfig, LocalBus, MessageBus, Subscription};
use serde::de::DeserializeOwned;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{IntervalsConfig, ServerConfig},
    desired_state::InMemoryDesiredStateStore,
    service::Service,
};

/// Start of the manual clock, far enough from zero for every window to fit.
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Intervals small enough to walk through a whole flapping sequence.
pub fn test_intervals() -> IntervalsConfig {
    IntervalsConfig {
        droplet_lost: 300,
        flapping_death: 2,
        flapping_timeout: 5,
        min_restart_delay: 1,
        max_restart_delay: 3,
        giveup_crash_number: 5,
        restart_timeout: 2,
        stable_state: 0,
        ..Default::default()
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        intervals: test_intervals(),
        ..Default::default()
    }
}

/// Collects what is published on one subject.
pub struct Capture {
    subscription: Subscription,
}

impl Capture {
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut messages = vec![];
        while let Some(message) = self.subscription.try_next() {
            messages.push(message.payload);
        }
        messages
    }

    pub fn drain_json<T: DeserializeOwned>(&mut self) -> Vec<T> {
        self.drain()
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    pub async fn next_json<T: DeserializeOwned>(&mut self) -> T {
        let message = tokio::time::timeout(Duration::from_secs(5), self.subscription.next())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&message.payload).unwrap()
    }
}

pub struct TestService {
    pub service: Service,
    pub clock: Arc<ManualClock>,
    pub bus: LocalBus,
    pub store: Arc<InMemoryDesiredStateStore>,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::new_with_config(test_config()).await
    }

    pub async fn new_with_config(cfg: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let bus = LocalBus::new(BusConfig::default());
        let store = Arc::new(InMemoryDesiredStateStore::default());
        let service = Service::new_with(cfg, clock.clone(), Arc::new(bus.clone()), store.clone())?;
        Ok(Self {
            service,
            clock,
            bus,
            store,
        })
    }

    /// Current manual time as a wire timestamp.
    pub fn now_secs(&self) -> f64 {
        self.clock.now_ms() as f64 / 1000.0
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Stores the app and syncs the registry with it.
    pub async fn add_app(&self, app: DesiredAppState) -> Result<()> {
        self.store.upsert(app).await;
        self.service.health_manager.update_from_desired_state().await
    }

    pub async fn capture(&self, subject: &str) -> Result<Capture> {
        Ok(Capture {
            subscription: self.bus.subscribe(subject).await?,
        })
    }

    pub async fn capture_requests(&self) -> Result<Capture> {
        let partition = self.service.health_manager.settings().partition.clone();
        self.capture(&subjects::health_requests(partition.get()))
            .await
    }

    /// Runs one dequeue and returns what it published.
    pub async fn dequeue(&self, requests: &mut Capture) -> Result<Vec<HealthRequest>> {
        self.service
            .health_manager
            .deque_a_batch_of_requests()
            .await?;
        Ok(requests.drain_json())
    }

    /// A host that answers every `dea.discover` with its id.
    pub async fn fake_dea(&self, id: &str) -> Result<()> {
        let mut discover = self.bus.subscribe(subjects::DEA_DISCOVER).await?;
        let bus = self.bus.clone();
        let reply = Bytes::from(serde_json::to_vec(&DiscoverReply { id: id.to_string() })?);
        tokio::spawn(async move {
            while let Some(message) = discover.next().await {
                if bus.respond(&message, reply.clone()).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}
