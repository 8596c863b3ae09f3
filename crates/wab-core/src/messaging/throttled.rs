use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{domain::ConversationId, messaging::port::MessagingPort, Result};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* two sends.
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same conversation.
    pub per_conversation_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(50),
            per_conversation_min_interval: Duration::from_millis(350),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve_at(&mut self, now: Instant) -> Duration {
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MessagingPort decorator that paces outbound replies.
///
/// Multi-chunk answers go out one after another; spacing them keeps the account
/// clear of the protocol's flood heuristics.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_conversation: Mutex<HashMap<ConversationId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_conversation: Mutex::new(HashMap::new()),
        }
    }

    /// Limiters whose next slot already passed are dropped first: a fresh one
    /// would reserve the same slot, so only pending spacing is kept.
    async fn limiter_for(
        &self,
        conversation: &ConversationId,
        now: Instant,
    ) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_conversation.lock().await;
        map.retain(|_, lim| {
            Arc::strong_count(lim) > 1 || lim.try_lock().map_or(true, |l| l.next > now)
        });
        map.entry(conversation.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_conversation_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, conversation: &ConversationId) {
        let now = Instant::now();
        let global_wait = { self.global.lock().await.reserve_at(now) };
        let conversation_wait = {
            let lim = self.limiter_for(conversation, now).await;
            let mut guard = lim.lock().await;
            guard.reserve_at(now)
        };

        let wait = global_wait.max(conversation_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
impl ThrottledMessenger {
    async fn tracked_conversations(&self) -> usize {
        self.per_conversation.lock().await.len()
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_text(&self, to: &ConversationId, text: &str) -> Result<()> {
        self.throttle(to).await;
        self.inner.send_text(to, text).await
    }
}
