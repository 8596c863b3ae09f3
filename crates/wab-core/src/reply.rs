//! Reply pipeline run for every queued message.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    assistant::{AskRequest, Assistant, ConversationState},
    domain::InboundMessage,
    messaging::port::MessagingPort,
    queue::{BoxFuture, QueueHandler},
    utils::truncate_text,
    Result,
};

/// Everything one queued message needs to get answered.
pub struct QueueEntry {
    pub message: InboundMessage,
    pub replies: Arc<dyn MessagingPort>,
    pub state: ConversationState,
}

#[derive(Clone, Debug)]
pub struct ReplySettings {
    /// Empty means no assistant is configured.
    pub assistant_id: String,
    pub temporary_failure_reply: String,
    pub missing_assistant_reply: String,
}

pub struct ReplyPipeline {
    assistant: Arc<dyn Assistant>,
    settings: ReplySettings,
}

impl ReplyPipeline {
    pub fn new(assistant: Arc<dyn Assistant>, settings: ReplySettings) -> Arc<Self> {
        Arc::new(Self {
            assistant,
            settings,
        })
    }

    /// Queue handler that answers each entry with this pipeline.
    pub fn handler(self: &Arc<Self>) -> QueueHandler<QueueEntry> {
        let pipeline = Arc::clone(self);
        Arc::new(move |entry: QueueEntry| -> BoxFuture {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move { pipeline.handle(entry).await })
        })
    }

    /// Ask the assistant and send the answer chunk by chunk.
    ///
    /// Assistant failures become the generic failure reply; send failures are
    /// returned to the caller.
    pub async fn handle(&self, entry: QueueEntry) -> Result<()> {
        let QueueEntry {
            message,
            replies,
            state,
        } = entry;
        let to = &message.from;
        debug!(
            conversation = %to,
            message_id = message.message_id.as_deref().unwrap_or("-"),
            sender = message.push_name.as_deref().unwrap_or("-"),
            "handling message"
        );

        if self.settings.assistant_id.trim().is_empty() {
            return replies
                .send_text(to, &self.settings.missing_assistant_reply)
                .await;
        }

        let answer = self
            .assistant
            .ask(
                AskRequest {
                    assistant_id: &self.settings.assistant_id,
                    conversation: to,
                    prompt: &message.body,
                },
                &state,
            )
            .await;

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                warn!(conversation = %to, error = %truncate_text(&e.to_string(), 300), "assistant call failed");
                return replies
                    .send_text(to, &self.settings.temporary_failure_reply)
                    .await;
            }
        };

        let chunks = split_reply(&answer);
        info!(
            conversation = %to,
            message_id = message.message_id.as_deref().unwrap_or("-"),
            chunks = chunks.len(),
            "sending reply"
        );
        for chunk in chunks {
            replies.send_text(to, &chunk).await?;
        }
        Ok(())
    }
}

/// Split an answer on blank lines and drop citation markers like `【4:0†source】`.
pub fn split_reply(answer: &str) -> Vec<String> {
    static PARAGRAPHS: OnceLock<Regex> = OnceLock::new();
    static CITATIONS: OnceLock<Regex> = OnceLock::new();
    let paragraphs = PARAGRAPHS.get_or_init(|| Regex::new(r"\n\n+").expect("valid regex"));
    let citations = CITATIONS.get_or_init(|| Regex::new(r"【.*?】\s*").expect("valid regex"));

    paragraphs
        .split(answer)
        .map(|chunk| citations.replace_all(chunk.trim(), "").trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}
