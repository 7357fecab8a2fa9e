use std::{collections::HashMap, time::Duration};

use data_model::messages::{DeaAdvertisement, DiscoverRequest};
use hm_utils::SharedClock;
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct PooledDea {
    advertisement: DeaAdvertisement,
    seen_at_ms: u64,
}

/// Placement pool fed by `dea.advertise`.
pub struct DeaPool {
    clock: SharedClock,
    expiry: Duration,
    deas: RwLock<HashMap<String, PooledDea>>,
}

impl DeaPool {
    pub fn new(clock: SharedClock, expiry: Duration) -> Self {
        Self {
            clock,
            expiry,
            deas: RwLock::new(HashMap::new()),
        }
    }

    pub async fn process_advertise_message(&self, advertisement: DeaAdvertisement) {
        trace!(
            dea = %advertisement.id,
            available_memory = advertisement.available_memory,
            "dea advertisement"
        );
        let seen_at_ms = self.clock.now_ms();
        self.deas.write().await.insert(
            advertisement.id.clone(),
            PooledDea {
                advertisement,
                seen_at_ms,
            },
        );
    }

    /// Picks the fresh host with the most available memory that can take the
    /// request, and debits the request's memory from it.
    pub async fn find_dea(&self, request: &DiscoverRequest) -> Option<String> {
        let now_ms = self.clock.now_ms();
        let expiry_ms = self.expiry.as_millis() as u64;
        let mut deas = self.deas.write().await;
        deas.retain(|_, dea| now_ms.saturating_sub(dea.seen_at_ms) <= expiry_ms);

        let chosen = deas
            .values_mut()
            .filter(|dea| {
                let advertisement = &dea.advertisement;
                advertisement.prod == request.prod &&
                    advertisement.available_memory >= request.limits.mem &&
                    advertisement
                        .runtimes
                        .iter()
                        .any(|runtime| *runtime == request.runtime)
            })
            .max_by(|a, b| {
                a.advertisement
                    .available_memory
                    .cmp(&b.advertisement.available_memory)
                    .then_with(|| b.advertisement.id.cmp(&a.advertisement.id))
            })?;
        chosen.advertisement.available_memory -= request.limits.mem;
        debug!(
            app_id = request.droplet.get(),
            dea = %chosen.advertisement.id,
            "placed instance from pool"
        );
        Some(chosen.advertisement.id.clone())
    }

    pub async fn len(&self) -> usize {
        self.deas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deas.read().await.is_empty()
    }
}
