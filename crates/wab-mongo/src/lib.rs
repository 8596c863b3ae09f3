//! MongoDB adapter for the auth state storage port.
//!
//! One document per slot:
//! `{ _id, session, category?, key?, value, updated_at }`.
//!
//! Documents without a `session` field belong to the older unscoped layout
//! (`{ _id: "creds" | "<category>-<id>", value }`) and are only reached through
//! the `*_legacy` port methods.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mongodb::{
    bson::{self, doc, Bson, Document},
    options::{ClientOptions, IndexOptions, UpdateOptions},
    Client, Collection, IndexModel,
};
use tracing::info;

use wab_core::{
    auth_state::{AuthStateStore, DocumentStore, SlotKey},
    domain::SessionId,
    errors::Error,
    utils::iso_timestamp_utc,
    Result,
};

const SESSION_INDEX: &str = "session_1";

#[derive(Clone, Debug)]
pub struct MongoSettings {
    pub url: String,
    pub database: String,
    pub collection: String,
    pub app_name: String,
    pub server_selection_timeout: Duration,
}

impl MongoSettings {
    pub fn new(url: impl Into<String>, database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            collection: collection.into(),
            app_name: "wab".to_string(),
            server_selection_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MongoDocumentStore {
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    /// Connect and verify the server answers a ping.
    ///
    /// Any failure here is an [`Error::Connection`]: no state is usable without
    /// the database.
    pub async fn connect(settings: &MongoSettings) -> Result<Self> {
        let mut options = ClientOptions::parse(&settings.url)
            .await
            .map_err(|e| Error::Connection(format!("invalid MONGO_URL: {e}")))?;
        options.app_name = Some(settings.app_name.clone());
        options.server_selection_timeout = Some(settings.server_selection_timeout);

        let client = Client::with_options(options).map_err(|e| Error::Connection(e.to_string()))?;
        let db = client.database(&settings.database);
        db.run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| Error::Connection(format!("ping failed: {e}")))?;

        info!(
            database = %settings.database,
            collection = %settings.collection,
            "connected to MongoDB"
        );

        Ok(Self {
            collection: db.collection(&settings.collection),
        })
    }
}

/// Connect to MongoDB and open the auth state of `session`.
pub async fn open_auth_state(settings: &MongoSettings, session: SessionId) -> Result<AuthStateStore> {
    let docs = MongoDocumentStore::connect(settings).await?;
    AuthStateStore::open(Arc::new(docs), session).await
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn ensure_indexes(&self) -> Result<()> {
        let model = IndexModel::builder()
            .keys(doc! { "session": 1 })
            .options(IndexOptions::builder().name(SESSION_INDEX.to_string()).build())
            .build();
        self.collection
            .create_index(model, None)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn read(&self, key: &SlotKey) -> Result<Option<serde_json::Value>> {
        let found = self
            .collection
            .find_one(doc! { "_id": key.document_id() }, None)
            .await
            .map_err(storage_err)?;

        let Some(document) = found else {
            return Ok(None);
        };
        match document.get("value") {
            None | Some(Bson::Null) => Ok(None),
            Some(value) => Ok(Some(from_bson_value(value.clone())?)),
        }
    }

    async fn write(&self, key: &SlotKey, value: serde_json::Value) -> Result<()> {
        let update = doc! { "$set": slot_fields(key, to_bson_value(&value)?) };
        self.collection
            .update_one(
                doc! { "_id": key.document_id() },
                update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove(&self, key: &SlotKey) -> Result<()> {
        self.collection
            .delete_one(doc! { "_id": key.document_id() }, None)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_session(&self, session: &SessionId) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "session": session.0.as_str() }, None)
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count)
    }

    async fn read_legacy(&self, key: &SlotKey) -> Result<Option<serde_json::Value>> {
        let found = self
            .collection
            .find_one(legacy_filter(key), None)
            .await
            .map_err(storage_err)?;
        match found.as_ref().and_then(|d| d.get("value")) {
            None | Some(Bson::Null) => Ok(None),
            Some(value) => Ok(Some(from_bson_value(value.clone())?)),
        }
    }

    async fn remove_legacy(&self, key: &SlotKey) -> Result<()> {
        self.collection
            .delete_one(legacy_filter(key), None)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_all_legacy(&self) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "session": { "$exists": false } }, None)
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count)
    }
}

fn legacy_filter(key: &SlotKey) -> Document {
    doc! {
        "_id": key.legacy_document_id(),
        "session": { "$exists": false },
    }
}

/// Fields written on every upsert (everything but `_id`).
fn slot_fields(key: &SlotKey, value: Bson) -> Document {
    let mut fields = doc! {
        "session": key.session(),
        "value": value,
        "updated_at": iso_timestamp_utc(),
    };
    if let Some(category) = key.category() {
        fields.insert("category", category);
    }
    if let Some(id) = key.id() {
        fields.insert("key", id);
    }
    fields
}

fn to_bson_value(value: &serde_json::Value) -> Result<Bson> {
    bson::to_bson(value).map_err(|e| Error::Encode(format!("bson: {e}")))
}

fn from_bson_value(value: Bson) -> Result<serde_json::Value> {
    bson::from_bson(value).map_err(|e| Error::Decode(format!("bson: {e}")))
}

fn storage_err(e: mongodb::error::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_slot_fields_carry_category_and_id() {
        let session = SessionId("main".to_string());
        let key = SlotKey::key(&session, "pre-key", "17").unwrap();
        let fields = slot_fields(&key, Bson::Int32(1));

        assert_eq!(fields.get_str("session").unwrap(), "main");
        assert_eq!(fields.get_str("category").unwrap(), "pre-key");
        assert_eq!(fields.get_str("key").unwrap(), "17");
        assert!(fields.get_str("updated_at").is_ok());
        assert!(!fields.contains_key("_id"));
    }

    #[test]
    fn legacy_filter_excludes_scoped_documents() {
        let key = SlotKey::key(&SessionId("default".to_string()), "pre-key", "3").unwrap();
        let filter = legacy_filter(&key);
        assert_eq!(filter.get_str("_id").unwrap(), "pre-key-3");
        assert_eq!(
            filter.get_document("session").unwrap(),
            &doc! { "$exists": false }
        );
    }

    #[test]
    fn creds_slot_fields_have_no_category() {
        let key = SlotKey::creds(&SessionId("main".to_string())).unwrap();
        let fields = slot_fields(&key, Bson::Null);
        assert!(!fields.contains_key("category"));
        assert!(!fields.contains_key("key"));
    }

    #[test]
    fn encoded_values_survive_bson_conversion() {
        let stored = json!({
            "noiseKey": { "private": { "__binary__": true, "data": "AQID" } },
            "registrationId": 4242,
            "processedHistoryMessages": [],
            "accountSettings": { "unarchiveChats": false },
            "ratio": 0.5,
            "me": null
        });
        let back = from_bson_value(to_bson_value(&stored).unwrap()).unwrap();
        assert_eq!(back, stored);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let mut settings = MongoSettings::new("mongodb://127.0.0.1:1", "whatsapp", "auth_states");
        settings.server_selection_timeout = Duration::from_millis(200);
        let err = MongoDocumentStore::connect(&settings).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn malformed_url_is_a_connection_error() {
        let settings = MongoSettings::new("not-a-uri", "whatsapp", "auth_states");
        let err = MongoDocumentStore::connect(&settings).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
