//! Completion backend port and the per-conversation variable store it may use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{domain::ConversationId, Result};

#[derive(Clone, Copy, Debug)]
pub struct AskRequest<'a> {
    pub assistant_id: &'a str,
    pub conversation: &'a ConversationId,
    pub prompt: &'a str,
}

/// Opaque asynchronous completion call.
///
/// Implementations may keep their own per-conversation bookkeeping (thread ids
/// and the like) in `state`.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(&self, req: AskRequest<'_>, state: &ConversationState) -> Result<String>;
}

/// Variables of every conversation.
///
/// Entries are never evicted: a conversation keeps its assistant thread across
/// messages for the process lifetime, and each entry holds a few small values.
#[derive(Default)]
pub struct ConversationStates {
    inner: Mutex<HashMap<ConversationId, HashMap<String, serde_json::Value>>>,
}

impl ConversationStates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scope(self: &Arc<Self>, conversation: ConversationId) -> ConversationState {
        ConversationState {
            states: Arc::clone(self),
            conversation,
        }
    }
}

/// Handle to one conversation's variables.
#[derive(Clone)]
pub struct ConversationState {
    states: Arc<ConversationStates>,
    conversation: ConversationId,
}

impl ConversationState {
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.states
            .inner
            .lock()
            .await
            .get(&self.conversation)
            .and_then(|vars| vars.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: serde_json::Value) {
        self.states
            .inner
            .lock()
            .await
            .entry(self.conversation.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub async fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let mut all = self.states.inner.lock().await;
        let vars = all.get_mut(&self.conversation)?;
        let removed = vars.remove(key);
        if vars.is_empty() {
            all.remove(&self.conversation);
        }
        removed
    }
}
