use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{auth_state::slot::SlotKey, domain::SessionId, Result};

/// Storage port for the auth state: one document per slot.
///
/// Values are already codec-encoded; adapters only move JSON documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create supporting indexes. Must be idempotent.
    async fn ensure_indexes(&self) -> Result<()>;

    async fn read(&self, key: &SlotKey) -> Result<Option<serde_json::Value>>;

    /// Upsert the slot. Must not touch any other slot.
    async fn write(&self, key: &SlotKey, value: serde_json::Value) -> Result<()>;

    /// Delete the slot. Deleting a missing slot is not an error.
    async fn remove(&self, key: &SlotKey) -> Result<()>;

    /// Delete every slot of a session, returning how many were removed.
    async fn remove_session(&self, session: &SessionId) -> Result<u64>;

    /// Read the slot from the unscoped single-session layout
    /// ([`SlotKey::legacy_document_id`]). Stores without such data keep the
    /// default.
    async fn read_legacy(&self, _key: &SlotKey) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn remove_legacy(&self, _key: &SlotKey) -> Result<()> {
        Ok(())
    }

    /// Delete every document of the unscoped layout.
    async fn remove_all_legacy(&self) -> Result<u64> {
        Ok(0)
    }
}

#[derive(Clone, Debug)]
struct MemorySlot {
    /// `None` for documents of the unscoped layout.
    session: Option<String>,
    value: serde_json::Value,
}

/// In-process [`DocumentStore`], used by tests and local runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    slots: Mutex<BTreeMap<String, MemorySlot>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Raw stored document for a slot (test inspection).
    pub async fn raw(&self, key: &SlotKey) -> Option<serde_json::Value> {
        self.slots
            .lock()
            .await
            .get(&key.document_id())
            .map(|s| s.value.clone())
    }

    /// Store a document the way an unscoped single-session deployment did.
    pub async fn seed_legacy(&self, id: &str, value: serde_json::Value) {
        self.slots.lock().await.insert(
            id.to_string(),
            MemorySlot {
                session: None,
                value,
            },
        );
    }

    async fn legacy_slot(&self, key: &SlotKey) -> Option<serde_json::Value> {
        self.slots
            .lock()
            .await
            .get(&key.legacy_document_id())
            .filter(|s| s.session.is_none())
            .map(|s| s.value.clone())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, key: &SlotKey) -> Result<Option<serde_json::Value>> {
        Ok(self.raw(key).await)
    }

    async fn write(&self, key: &SlotKey, value: serde_json::Value) -> Result<()> {
        self.slots.lock().await.insert(
            key.document_id(),
            MemorySlot {
                session: Some(key.session().to_string()),
                value,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &SlotKey) -> Result<()> {
        self.slots.lock().await.remove(&key.document_id());
        Ok(())
    }

    async fn remove_session(&self, session: &SessionId) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, s| s.session.as_deref() != Some(session.0.as_str()));
        Ok((before - slots.len()) as u64)
    }

    async fn read_legacy(&self, key: &SlotKey) -> Result<Option<serde_json::Value>> {
        Ok(self.legacy_slot(key).await)
    }

    async fn remove_legacy(&self, key: &SlotKey) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let id = key.legacy_document_id();
        if slots.get(&id).is_some_and(|s| s.session.is_none()) {
            slots.remove(&id);
        }
        Ok(())
    }

    async fn remove_all_legacy(&self) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, s| s.session.is_some());
        Ok((before - slots.len()) as u64)
    }
}
