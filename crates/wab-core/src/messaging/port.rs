use async_trait::async_trait;

use crate::{domain::ConversationId, Result};

/// Outbound port towards the messaging protocol client.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_text(&self, to: &ConversationId, text: &str) -> Result<()>;
}
