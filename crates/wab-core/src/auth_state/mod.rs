//! Durable credential and signal-key store for one protocol session.
//!
//! Every `(category, id)` key lives in its own document next to a single creds
//! document, so a key rotation never rewrites unrelated material.

pub mod creds;
pub mod slot;
pub mod store;
pub mod sync_key;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{codec, domain::SessionId, value::Value, Result};

pub use creds::fresh_creds;
pub use slot::{SlotKey, KEY_SEPARATOR};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use sync_key::{AppStateSyncKeyData, APP_STATE_SYNC_KEY};

/// `category -> id -> value`; `None` deletes the key.
pub type KeyUpdates = BTreeMap<String, BTreeMap<String, Option<Value>>>;

/// Produces the credentials of a session that has none stored.
pub type CredsFactory = fn() -> Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyWriteSummary {
    pub upserted: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyWrite {
    Upserted,
    Deleted,
    Failed,
}

pub struct AuthStateStore {
    docs: Arc<dyn DocumentStore>,
    session: SessionId,
    creds_slot: SlotKey,
    creds: Mutex<Value>,
    new_creds: CredsFactory,
    adopt_legacy: bool,
}

impl AuthStateStore {
    pub async fn open(docs: Arc<dyn DocumentStore>, session: SessionId) -> Result<Self> {
        Self::open_with(docs, session, fresh_creds).await
    }

    /// Open with a custom factory for the credentials of a new session.
    ///
    /// Fails only when the session id cannot address a slot; read and decode
    /// problems fall back to fresh credentials.
    pub async fn open_with(
        docs: Arc<dyn DocumentStore>,
        session: SessionId,
        new_creds: CredsFactory,
    ) -> Result<Self> {
        let creds_slot = SlotKey::creds(&session)?;

        if let Err(e) = docs.ensure_indexes().await {
            warn!(error = %e, "auth state index creation failed; continuing without it");
        }

        let adopt_legacy = session.is_default();
        let creds = match load_creds(docs.as_ref(), &creds_slot, adopt_legacy).await {
            Some(creds) => {
                info!(session = %session, "loaded stored credentials");
                creds
            }
            None => {
                info!(session = %session, "no usable stored credentials; starting a new session");
                new_creds()
            }
        };

        Ok(Self {
            docs,
            session,
            creds_slot,
            creds: Mutex::new(creds),
            new_creds,
            adopt_legacy,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Look up keys of one category. Missing or undecodable ids are omitted.
    pub async fn get_keys(&self, category: &str, ids: &[String]) -> HashMap<String, Value> {
        let lookups = ids.iter().map(|id| async move {
            let value = self.read_key(category, id).await;
            (id, value)
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(id, value)| value.map(|v| (id.clone(), v)))
            .collect()
    }

    /// Apply upserts and deletes independently; one failing key does not stop
    /// the others.
    pub async fn set_keys(&self, updates: &KeyUpdates) -> KeyWriteSummary {
        let writes = updates.iter().flat_map(|(category, entries)| {
            entries
                .iter()
                .map(move |(id, value)| self.write_key(category, id, value.as_ref()))
        });

        let mut summary = KeyWriteSummary::default();
        for outcome in join_all(writes).await {
            match outcome {
                KeyWrite::Upserted => summary.upserted += 1,
                KeyWrite::Deleted => summary.deleted += 1,
                KeyWrite::Failed => summary.failed += 1,
            }
        }
        if summary.failed > 0 {
            warn!(
                session = %self.session,
                failed = summary.failed,
                "some signal key writes failed"
            );
        }
        summary
    }

    pub async fn creds(&self) -> Value {
        self.creds.lock().await.clone()
    }

    /// Merge a partial update from a "credentials changed" event into the cache.
    ///
    /// Nothing is persisted until [`AuthStateStore::save_creds`].
    pub async fn update_creds(&self, partial: Value) -> Result<()> {
        let mut creds = self.creds.lock().await;
        creds::merge_creds(&mut creds, partial)
    }

    pub async fn save_creds(&self) -> Result<()> {
        let snapshot = self.creds().await;
        let encoded = codec::encode(&snapshot)?;
        self.docs.write(&self.creds_slot, encoded).await?;
        debug!(session = %self.session, "credentials saved");
        Ok(())
    }

    /// Delete everything stored for the session and restart from fresh creds.
    pub async fn clear(&self) -> Result<u64> {
        let mut removed = self.docs.remove_session(&self.session).await?;
        if self.adopt_legacy {
            removed += self.docs.remove_all_legacy().await?;
        }
        *self.creds.lock().await = (self.new_creds)();
        info!(session = %self.session, removed, "session state cleared");
        Ok(removed)
    }

    async fn read_key(&self, category: &str, id: &str) -> Option<Value> {
        let slot = match SlotKey::key(&self.session, category, id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(category, id, error = %e, "rejected signal key lookup");
                return None;
            }
        };

        let stored = match read_slot(self.docs.as_ref(), &slot, self.adopt_legacy).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(category, id, error = %e, "signal key read failed");
                return None;
            }
        };

        let value = match codec::decode(&stored) {
            Ok(v) => v,
            Err(e) => {
                warn!(category, id, error = %e, "stored signal key is malformed");
                return None;
            }
        };

        if category != APP_STATE_SYNC_KEY {
            return Some(value);
        }
        match AppStateSyncKeyData::from_value(&value) {
            Ok(record) => Some(record.to_value()),
            Err(e) => {
                warn!(id, error = %e, "app state sync key failed to decode");
                None
            }
        }
    }

    async fn write_key(&self, category: &str, id: &str, value: Option<&Value>) -> KeyWrite {
        let slot = match SlotKey::key(&self.session, category, id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(category, id, error = %e, "rejected signal key write");
                return KeyWrite::Failed;
            }
        };

        let result = match value {
            Some(value) => match codec::encode(value) {
                Ok(encoded) => self.docs.write(&slot, encoded).await.map(|_| KeyWrite::Upserted),
                Err(e) => Err(e),
            },
            None => self.remove_key(&slot).await.map(|_| KeyWrite::Deleted),
        };

        result.unwrap_or_else(|e| {
            warn!(category, id, error = %e, "signal key write failed");
            KeyWrite::Failed
        })
    }

    async fn remove_key(&self, slot: &SlotKey) -> Result<()> {
        self.docs.remove(slot).await?;
        if self.adopt_legacy {
            // Otherwise the unscoped copy would come back on the next read.
            self.docs.remove_legacy(slot).await?;
        }
        Ok(())
    }
}

/// Read a slot, moving it over from the unscoped layout when allowed and only
/// the old document exists.
async fn read_slot(
    docs: &dyn DocumentStore,
    slot: &SlotKey,
    adopt_legacy: bool,
) -> Result<Option<serde_json::Value>> {
    if let Some(stored) = docs.read(slot).await? {
        return Ok(Some(stored));
    }
    if !adopt_legacy {
        return Ok(None);
    }
    let Some(legacy) = docs.read_legacy(slot).await? else {
        return Ok(None);
    };

    // Rewrite in the current binary form; undecodable data is left in place
    // for the caller to report.
    let Ok(encoded) = codec::decode(&legacy).and_then(|v| codec::encode(&v)) else {
        return Ok(Some(legacy));
    };
    docs.write(slot, encoded.clone()).await?;
    if let Err(e) = docs.remove_legacy(slot).await {
        warn!(id = %slot.legacy_document_id(), error = %e, "could not remove migrated document");
    }
    info!(id = %slot.legacy_document_id(), "migrated document from the unscoped layout");
    Ok(Some(encoded))
}

async fn load_creds(docs: &dyn DocumentStore, slot: &SlotKey, adopt_legacy: bool) -> Option<Value> {
    let stored = match read_slot(docs, slot, adopt_legacy).await {
        Ok(stored) => stored?,
        Err(e) => {
            warn!(error = %e, "credential read failed");
            return None;
        }
    };

    match codec::decode(&stored) {
        Ok(Value::Object(map)) => Some(Value::Object(map)),
        Ok(_) => {
            warn!("stored credentials are not an object");
            None
        }
        Err(e) => {
            warn!(error = %e, "stored credentials are malformed");
            None
        }
    }
}
