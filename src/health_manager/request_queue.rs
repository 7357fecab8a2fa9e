use std::collections::VecDeque;

use data_model::messages::HealthRequest;

/// FIFO of corrective actions waiting to be drained to the controller. Each
/// request is complete, so draining never consults the registry.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: VecDeque<HealthRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, request: HealthRequest) {
        self.requests.push_back(request);
    }

    /// Removes up to `limit` requests in submission order.
    pub fn pop_batch(&mut self, limit: usize) -> Vec<HealthRequest> {
        let n = limit.min(self.requests.len());
        self.requests.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthRequest> {
        self.requests.iter()
    }
}
