mod bridge;
mod messenger;

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use wab_assistant_cli::{CommandAssistant, CommandAssistantConfig};
use wab_core::{
    assistant::{AskRequest, Assistant, ConversationState},
    config::Config,
    errors::Error,
    messaging::throttled::{ThrottleConfig, ThrottledMessenger},
    queue::MessageQueueManager,
    reply::{ReplyPipeline, ReplySettings},
};
use wab_mongo::{open_auth_state, MongoSettings};

use crate::{
    bridge::{Bridge, BridgeSettings, Shutdown},
    messenger::BridgeMessenger,
};

const OUTBOUND_BUFFER: usize = 256;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Stand-in used when no completion command is configured.
struct Unconfigured;

#[async_trait]
impl Assistant for Unconfigured {
    async fn ask(&self, _req: AskRequest<'_>, _state: &ConversationState) -> wab_core::Result<String> {
        Err(Error::Config("ASSISTANT_COMMAND is not set".to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    wab_core::logging::init("wab")?;

    let cfg = Config::load().context("load configuration")?;

    let mongo = MongoSettings::new(&cfg.mongo_url, &cfg.mongo_db, &cfg.mongo_collection);
    let auth = open_auth_state(&mongo, cfg.session_id.clone())
        .await
        .context("open auth state")?;
    info!(session = %cfg.session_id, "auth state ready");

    let mut assistant_id = cfg.assistant_id.clone();
    let assistant: Arc<dyn Assistant> = match &cfg.assistant_command {
        Some(program) => Arc::new(CommandAssistant::new(CommandAssistantConfig {
            program: program.clone(),
            args: cfg.assistant_args.clone(),
            timeout: cfg.assistant_timeout,
        })),
        None => {
            warn!("ASSISTANT_COMMAND is not set; every message gets the missing-assistant reply");
            assistant_id.clear();
            Arc::new(Unconfigured)
        }
    };
    if assistant_id.is_empty() && cfg.assistant_command.is_some() {
        warn!("ASSISTANT_ID is not set; every message gets the missing-assistant reply");
    }

    let pipeline = ReplyPipeline::new(
        assistant,
        ReplySettings {
            assistant_id,
            temporary_failure_reply: cfg.temporary_failure_reply.clone(),
            missing_assistant_reply: cfg.missing_assistant_reply.clone(),
        },
    );
    let queue = MessageQueueManager::new(pipeline.handler(), cfg.handler_timeout);

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(bridge::write_frames(out_rx, tokio::io::stdout()));

    let replies = Arc::new(ThrottledMessenger::new(
        Arc::new(BridgeMessenger::new(out_tx.clone())),
        ThrottleConfig {
            per_conversation_min_interval: cfg.outbound_min_interval,
            ..ThrottleConfig::default()
        },
    ));

    let bridge = Bridge::new(
        Arc::new(auth),
        queue,
        replies,
        out_tx,
        BridgeSettings {
            groups_ignore: cfg.groups_ignore,
            clear_session_on_logout: cfg.clear_session_on_logout,
        },
    );

    info!("bridge running on stdio");
    let outcome = bridge::run(&bridge, tokio::io::stdin(), cfg.bridge_max_line_bytes).await;

    // Closing every sender lets the writer finish the frames already queued.
    drop(bridge);
    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "bridge output failed"),
        Ok(Err(e)) => warn!(error = %e, "bridge writer task failed"),
        Err(_) => warn!("timed out flushing bridge output"),
        Ok(Ok(Ok(()))) => {}
    }

    match outcome.context("bridge failed")? {
        Shutdown::InputClosed => {
            info!("bridge input closed; exiting");
            Ok(ExitCode::SUCCESS)
        }
        Shutdown::LoggedOut => Ok(ExitCode::FAILURE),
    }
}
