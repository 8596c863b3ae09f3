use crate::{domain::SessionId, errors::Error, Result};

/// Separator between the parts of a storage document id.
pub const KEY_SEPARATOR: char = '|';

const CREDS_SLOT: &str = "creds";

/// Address of one stored value: the session's creds or one `(category, id)` key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    session: String,
    slot: Slot,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Slot {
    Creds,
    Key { category: String, id: String },
}

impl SlotKey {
    pub fn creds(session: &SessionId) -> Result<Self> {
        validate_part(&session.0)?;
        Ok(Self {
            session: session.0.clone(),
            slot: Slot::Creds,
        })
    }

    pub fn key(session: &SessionId, category: &str, id: &str) -> Result<Self> {
        validate_part(&session.0)?;
        validate_part(category)?;
        validate_part(id)?;
        Ok(Self {
            session: session.0.clone(),
            slot: Slot::Key {
                category: category.to_string(),
                id: id.to_string(),
            },
        })
    }

    /// Unique document id: `<session>|creds` or `<session>|<category>|<id>`.
    ///
    /// The two shapes differ in separator count, so a `creds` category can never
    /// collide with the creds slot.
    pub fn document_id(&self) -> String {
        match &self.slot {
            Slot::Creds => format!("{}{KEY_SEPARATOR}{CREDS_SLOT}", self.session),
            Slot::Key { category, id } => {
                format!("{}{KEY_SEPARATOR}{category}{KEY_SEPARATOR}{id}", self.session)
            }
        }
    }

    /// Id used by deployments that kept a single unscoped session per
    /// collection: `creds` or `<category>-<id>`.
    pub fn legacy_document_id(&self) -> String {
        match &self.slot {
            Slot::Creds => CREDS_SLOT.to_string(),
            Slot::Key { category, id } => format!("{category}-{id}"),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn category(&self) -> Option<&str> {
        match &self.slot {
            Slot::Creds => None,
            Slot::Key { category, .. } => Some(category),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match &self.slot {
            Slot::Creds => None,
            Slot::Key { id, .. } => Some(id),
        }
    }
}

pub fn validate_part(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(Error::InvalidKey {
            part: part.to_string(),
            reason: "must not be empty",
        });
    }
    if part.contains(KEY_SEPARATOR) {
        return Err(Error::InvalidKey {
            part: part.to_string(),
            reason: "must not contain the '|' separator",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId("main".to_string())
    }

    #[test]
    fn document_ids_are_session_scoped() {
        let creds = SlotKey::creds(&session()).unwrap();
        assert_eq!(creds.document_id(), "main|creds");

        let key = SlotKey::key(&session(), "sender-key", "123@g.us::456::0").unwrap();
        assert_eq!(key.document_id(), "main|sender-key|123@g.us::456::0");
        assert_eq!(key.category(), Some("sender-key"));
        assert_eq!(key.id(), Some("123@g.us::456::0"));
    }

    #[test]
    fn legacy_ids_drop_the_session() {
        let creds = SlotKey::creds(&session()).unwrap();
        assert_eq!(creds.legacy_document_id(), "creds");

        let key = SlotKey::key(&session(), "pre-key", "17").unwrap();
        assert_eq!(key.legacy_document_id(), "pre-key-17");
    }

    #[test]
    fn creds_category_does_not_collide_with_creds_slot() {
        let creds = SlotKey::creds(&session()).unwrap();
        let key = SlotKey::key(&session(), "creds", "x").unwrap();
        assert_ne!(creds.document_id(), key.document_id());
    }

    #[test]
    fn separator_and_empty_parts_are_rejected() {
        assert!(matches!(
            SlotKey::key(&session(), "pre|key", "1"),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(
            SlotKey::key(&session(), "pre-key", ""),
            Err(Error::InvalidKey { .. })
        ));
        assert!(SlotKey::creds(&SessionId("a|b".to_string())).is_err());
    }
}
