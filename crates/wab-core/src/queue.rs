//! Per-conversation ordered processing.
//!
//! Each conversation gets a FIFO queue and at most one drain task. Entries of one
//! conversation never run concurrently; different conversations never wait on
//! each other.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::{domain::ConversationId, errors::Error, Result};

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
pub type QueueHandler<E> = Arc<dyn Fn(E) -> BoxFuture + Send + Sync>;

struct ConversationQueue<E> {
    entries: VecDeque<E>,
    processing: bool,
}

struct Shared<E> {
    handler: QueueHandler<E>,
    handler_timeout: Option<Duration>,
    queues: Mutex<HashMap<ConversationId, ConversationQueue<E>>>,
    drained: Notify,
}

/// Registry of conversation queues. Cloning yields another handle to the same
/// registry.
pub struct MessageQueueManager<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for MessageQueueManager<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Send + 'static> MessageQueueManager<E> {
    /// `handler_timeout: None` lets a handler run for as long as it wants; a
    /// stuck handler then stalls its own conversation.
    pub fn new(handler: QueueHandler<E>, handler_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler,
                handler_timeout,
                queues: Mutex::new(HashMap::new()),
                drained: Notify::new(),
            }),
        }
    }

    pub fn from_fn<F, Fut>(handler: F, handler_timeout: Option<Duration>) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(
            Arc::new(move |entry: E| -> BoxFuture { Box::pin(handler(entry)) }),
            handler_timeout,
        )
    }

    /// Append an entry. Returns `true` when this call started the drain task.
    pub async fn enqueue(&self, conversation: ConversationId, entry: E) -> bool {
        let start = {
            let mut queues = self.shared.queues.lock().await;
            let queue = queues
                .entry(conversation.clone())
                .or_insert_with(|| ConversationQueue {
                    entries: VecDeque::new(),
                    processing: false,
                });
            queue.entries.push_back(entry);
            if queue.processing {
                false
            } else {
                queue.processing = true;
                true
            }
        };

        if start {
            debug!(conversation = %conversation, "starting drain");
            tokio::spawn(drain(Arc::clone(&self.shared), conversation));
        }
        start
    }

    /// Entries waiting behind the one currently being handled.
    pub async fn pending(&self, conversation: &ConversationId) -> usize {
        self.shared
            .queues
            .lock()
            .await
            .get(conversation)
            .map(|q| q.entries.len())
            .unwrap_or(0)
    }

    pub async fn is_processing(&self, conversation: &ConversationId) -> bool {
        self.shared
            .queues
            .lock()
            .await
            .get(conversation)
            .map(|q| q.processing)
            .unwrap_or(false)
    }

    pub async fn active_conversations(&self) -> usize {
        self.shared.queues.lock().await.len()
    }

    /// Resolve once no conversation has queued or in-flight entries.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.queues.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain<E: Send + 'static>(shared: Arc<Shared<E>>, conversation: ConversationId) {
    loop {
        let entry = {
            let mut queues = shared.queues.lock().await;
            let Some(queue) = queues.get_mut(&conversation) else {
                break;
            };
            match queue.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    queues.remove(&conversation);
                    break;
                }
            }
        };

        if let Err(e) = run_handler(&shared, entry).await {
            warn!(conversation = %conversation, error = %e, "message handler failed; entry dropped");
        }
    }

    debug!(conversation = %conversation, "queue drained");
    shared.drained.notify_waiters();
}

async fn run_handler<E>(shared: &Shared<E>, entry: E) -> Result<()> {
    let handler = Arc::clone(&shared.handler);
    let call = AssertUnwindSafe(async move { handler(entry).await }).catch_unwind();

    let outcome = match shared.handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(Error::Handler(format!("timed out after {limit:?}")));
            }
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(Error::Handler(msg))) => Err(Error::Handler(msg)),
        Ok(Err(other)) => Err(Error::Handler(other.to_string())),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Handler(format!("handler panicked: {msg}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Barrier;

    type Entry = (&'static str, &'static str);

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        handled: StdMutex<Vec<Entry>>,
        active: StdMutex<HashMap<&'static str, usize>>,
        max_active: StdMutex<HashMap<&'static str, usize>>,
    }

    impl Recorder {
        fn enter(&self, conv: &'static str) {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(conv).or_insert(0);
            *n += 1;
            let mut max = self.max_active.lock().unwrap();
            let m = max.entry(conv).or_insert(0);
            *m = (*m).max(*n);
        }

        fn leave(&self, entry: Entry) {
            *self.active.lock().unwrap().get_mut(entry.0).unwrap() -= 1;
            self.handled.lock().unwrap().push(entry);
        }

        fn handled_for(&self, conv: &str) -> Vec<&'static str> {
            self.handled
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == conv)
                .map(|(_, label)| *label)
                .collect()
        }

        fn max_active(&self, conv: &str) -> usize {
            self.max_active
                .lock()
                .unwrap()
                .get(conv)
                .copied()
                .unwrap_or(0)
        }
    }

    fn recording_manager(
        rec: Arc<Recorder>,
        timeout: Option<Duration>,
    ) -> MessageQueueManager<Entry> {
        MessageQueueManager::from_fn(
            move |entry: Entry| {
                let rec = rec.clone();
                async move {
                    rec.enter(entry.0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let outcome = match entry.1 {
                        "fail" => Err(Error::External("boom".to_string())),
                        "panic" => panic!("handler blew up"),
                        "hang" => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok(())
                        }
                        _ => Ok(()),
                    };
                    rec.leave(entry);
                    outcome
                }
            },
            timeout,
        )
    }

    fn conv(s: &str) -> ConversationId {
        ConversationId(s.to_string())
    }

    #[tokio::test]
    async fn fifo_per_conversation_without_overlap() {
        let rec = Arc::new(Recorder::default());
        let mgr = recording_manager(rec.clone(), None);

        mgr.enqueue(conv("c1"), ("c1", "e1")).await;
        mgr.enqueue(conv("c2"), ("c2", "f1")).await;
        mgr.enqueue(conv("c1"), ("c1", "e2")).await;
        mgr.enqueue(conv("c1"), ("c1", "e3")).await;

        tokio::time::timeout(WAIT, mgr.wait_idle()).await.unwrap();

        assert_eq!(rec.handled_for("c1"), vec!["e1", "e2", "e3"]);
        assert_eq!(rec.handled_for("c2"), vec!["f1"]);
        assert_eq!(rec.max_active("c1"), 1);
        assert_eq!(mgr.active_conversations().await, 0);
    }

    #[tokio::test]
    async fn enqueue_while_processing_only_appends() {
        let rec = Arc::new(Recorder::default());
        let mgr = recording_manager(rec.clone(), None);

        assert!(mgr.enqueue(conv("c1"), ("c1", "e1")).await);
        assert!(!mgr.enqueue(conv("c1"), ("c1", "e2")).await);
        assert!(!mgr.enqueue(conv("c1"), ("c1", "e3")).await);
        assert!(mgr.is_processing(&conv("c1")).await);
        assert!(mgr.pending(&conv("c1")).await >= 2);

        tokio::time::timeout(WAIT, mgr.wait_idle()).await.unwrap();
        assert_eq!(rec.max_active("c1"), 1);
        assert!(!mgr.is_processing(&conv("c1")).await);
        assert_eq!(mgr.pending(&conv("c1")).await, 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_stop_the_drain() {
        let rec = Arc::new(Recorder::default());
        let mgr = recording_manager(rec.clone(), None);

        mgr.enqueue(conv("c1"), ("c1", "e1")).await;
        mgr.enqueue(conv("c1"), ("c1", "fail")).await;
        mgr.enqueue(conv("c1"), ("c1", "panic")).await;
        mgr.enqueue(conv("c1"), ("c1", "e3")).await;

        tokio::time::timeout(WAIT, mgr.wait_idle()).await.unwrap();

        // The panicking entry never reaches `leave`.
        assert_eq!(rec.handled_for("c1"), vec!["e1", "fail", "e3"]);
        assert_eq!(mgr.active_conversations().await, 0);
    }

    #[tokio::test]
    async fn handler_timeout_releases_the_conversation() {
        let rec = Arc::new(Recorder::default());
        let mgr = recording_manager(rec.clone(), Some(Duration::from_millis(50)));

        mgr.enqueue(conv("c1"), ("c1", "hang")).await;
        mgr.enqueue(conv("c1"), ("c1", "after")).await;

        tokio::time::timeout(WAIT, mgr.wait_idle()).await.unwrap();
        assert_eq!(rec.handled_for("c1"), vec!["after"]);
    }

    #[tokio::test]
    async fn conversations_progress_independently() {
        // Both handlers must be in flight at once to pass the barrier.
        let barrier = Arc::new(Barrier::new(2));
        let mgr = MessageQueueManager::from_fn(
            move |_: &'static str| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            },
            None,
        );

        mgr.enqueue(conv("c1"), "a").await;
        mgr.enqueue(conv("c2"), "b").await;

        tokio::time::timeout(WAIT, mgr.wait_idle())
            .await
            .expect("conversations blocked each other");
    }

    #[tokio::test]
    async fn managers_are_independent() {
        let rec_a = Arc::new(Recorder::default());
        let rec_b = Arc::new(Recorder::default());
        let a = recording_manager(rec_a.clone(), None);
        let b = recording_manager(rec_b.clone(), None);

        a.enqueue(conv("c1"), ("c1", "a1")).await;
        b.enqueue(conv("c1"), ("c1", "b1")).await;
        tokio::time::timeout(WAIT, a.wait_idle()).await.unwrap();
        tokio::time::timeout(WAIT, b.wait_idle()).await.unwrap();

        assert_eq!(rec_a.handled_for("c1"), vec!["a1"]);
        assert_eq!(rec_b.handled_for("c1"), vec!["b1"]);
    }
}
