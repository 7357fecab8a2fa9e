use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages buffered per subscription before publishes to it are dropped.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig { capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    /// Subject a responder should publish its answer to.
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Number of replies after which the request completes early.
    pub expected: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            expected: 1,
        }
    }
}

impl RequestOptions {
    pub fn new(timeout: Duration, expected: usize) -> Self {
        Self { timeout, expected }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    pub subject: String,
    rx: mpsc::Receiver<Message>,
    _guard: Box<dyn Send + Sync>,
}

impl Subscription {
    pub fn new(subject: String, rx: mpsc::Receiver<Message>, guard: Box<dyn Send + Sync>) -> Self {
        Self {
            subject,
            rx,
            _guard: guard,
        }
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Topic-addressed publish/subscribe with a timed request primitive.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<String>,
    ) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.publish_with_reply(subject, payload, None).await
    }

    /// Publishes `payload` with a private reply subject and collects up to
    /// `options.expected` replies.
    ///
    /// Running out of time is not an error: whatever arrived before the
    /// timeout is returned, possibly nothing.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        options: RequestOptions,
    ) -> Result<Vec<Bytes>> {
        if options.expected == 0 {
            return Ok(vec![]);
        }
        let inbox = format!("_INBOX.{}", nanoid::nanoid!());
        let mut replies = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, payload, Some(inbox))
            .await?;

        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut results = Vec::with_capacity(options.expected);
        while results.len() < options.expected {
            match tokio::time::timeout_at(deadline, replies.next()).await {
                Ok(Some(message)) => results.push(message.payload),
                Ok(None) => break,
                Err(_) => {
                    trace!(
                        subject = subject,
                        received = results.len(),
                        expected = options.expected,
                        "request timed out"
                    );
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Answers a request message on its reply subject.
    async fn respond(&self, message: &Message, payload: Bytes) -> Result<()> {
        match &message.reply {
            Some(reply) => self.publish(reply, payload).await,
            None => Err(anyhow!(
                "message on {} has no reply subject",
                message.subject
            )),
        }
    }
}

/// Whether `subject` is matched by `pattern`, where `*` matches a single token
/// and a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct SubscriberEntry {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct LocalBusInner {
    subscribers: DashMap<u64, SubscriberEntry>,
    next_sid: AtomicU64,
}

struct Unsubscribe {
    sid: u64,
    inner: Arc<LocalBusInner>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.inner.subscribers.remove(&self.sid);
    }
}

/// In-process bus. Delivery is in publish order per subscriber; a subscriber
/// whose buffer is full misses the message, like a slow consumer on a real
/// broker.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(LocalBusInner::default()),
            capacity: config.capacity.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("subscribers", &self.inner.subscribers.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<String>,
    ) -> Result<()> {
        let mut closed = vec![];
        let mut sids: Vec<u64> = self
            .inner
            .subscribers
            .iter()
            .filter(|entry| subject_matches(&entry.value().pattern, subject))
            .map(|entry| *entry.key())
            .collect();
        // subscription order
        sids.sort_unstable();
        for sid in sids {
            let Some(entry) = self.inner.subscribers.get(&sid) else {
                continue;
            };
            let message = Message {
                subject: subject.to_string(),
                payload: payload.clone(),
                reply: reply.clone(),
            };
            match entry.tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subject = subject,
                        pattern = %entry.pattern,
                        "subscriber buffer full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sid),
            }
        }
        for sid in closed {
            self.inner.subscribers.remove(&sid);
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        if subject.is_empty() || subject.split('.').any(|token| token.is_empty()) {
            return Err(anyhow!("invalid subject: {:?}", subject));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let sid = self.inner.next_sid.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            sid,
            SubscriberEntry {
                pattern: subject.to_string(),
                tx,
            },
        );
        Ok(Subscription::new(
            subject.to_string(),
            rx,
            Box::new(Unsubscribe {
                sid,
                inner: self.inner.clone(),
            }),
        ))
    }
}
