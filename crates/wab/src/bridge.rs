//! Newline-delimited JSON bridge to the protocol client process.
//!
//! The client owns the WhatsApp connection. It forwards inbound messages and
//! auth state requests on our stdin and receives answers and outbound sends on
//! our stdout. Binary values travel in the storage codec form.

use std::{
    collections::{BTreeMap, HashMap},
    ops::ControlFlow,
    sync::Arc,
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use wab_core::{
    assistant::ConversationStates,
    auth_state::{AuthStateStore, KeyUpdates},
    codec,
    domain::{ConversationId, InboundMessage},
    errors::Error,
    messaging::port::MessagingPort,
    queue::MessageQueueManager,
    reply::QueueEntry,
    Result, Value,
};

/// Close status the protocol uses when the device was logged out.
const LOGGED_OUT: u16 = 401;

type Json = serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "message")]
    Message {
        from: String,
        body: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        push_name: Option<String>,
    },
    #[serde(rename = "creds.get")]
    CredsGet { req: Json },
    #[serde(rename = "creds.update")]
    CredsUpdate {
        #[serde(default)]
        req: Option<Json>,
        creds: Json,
    },
    #[serde(rename = "keys.get")]
    KeysGet {
        req: Json,
        category: String,
        ids: Vec<String>,
    },
    #[serde(rename = "keys.set")]
    KeysSet {
        req: Json,
        data: BTreeMap<String, BTreeMap<String, Option<Json>>>,
    },
    #[serde(rename = "connection.update")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        qr: Option<String>,
    },
    #[serde(rename = "auth.failure")]
    AuthFailure {
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "creds")]
    Creds { req: Json, creds: Json },
    #[serde(rename = "keys")]
    Keys {
        req: Json,
        data: BTreeMap<String, Json>,
    },
    #[serde(rename = "ack")]
    Ack { req: Json },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        req: Option<Json>,
        message: String,
    },
    #[serde(rename = "send")]
    Send { to: String, body: String },
}

/// Why the bridge stopped reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    InputClosed,
    LoggedOut,
}

#[derive(Clone, Copy, Debug)]
pub struct BridgeSettings {
    pub groups_ignore: bool,
    pub clear_session_on_logout: bool,
}

pub struct Bridge {
    auth: Arc<AuthStateStore>,
    queue: MessageQueueManager<QueueEntry>,
    states: Arc<ConversationStates>,
    replies: Arc<dyn MessagingPort>,
    out: mpsc::Sender<Outbound>,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        auth: Arc<AuthStateStore>,
        queue: MessageQueueManager<QueueEntry>,
        replies: Arc<dyn MessagingPort>,
        out: mpsc::Sender<Outbound>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            auth,
            queue,
            states: ConversationStates::new(),
            replies,
            out,
            settings,
        }
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub async fn handle_line(&self, line: &str) -> ControlFlow<Shutdown> {
        let line = line.trim();
        if line.is_empty() {
            return ControlFlow::Continue(());
        }

        match serde_json::from_str::<Inbound>(line) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                warn!(error = %e, "ignoring malformed bridge frame");
                self.emit(Outbound::Error {
                    req: request_id_of(line),
                    message: format!("malformed frame: {e}"),
                })
                .await;
                ControlFlow::Continue(())
            }
        }
    }

    pub async fn handle(&self, event: Inbound) -> ControlFlow<Shutdown> {
        match event {
            Inbound::Message {
                from,
                body,
                id,
                push_name,
            } => {
                self.on_message(InboundMessage {
                    from: ConversationId(from),
                    body,
                    message_id: id,
                    push_name,
                })
                .await;
            }
            Inbound::CredsGet { req } => {
                let frame = match codec::encode(&self.auth.creds().await) {
                    Ok(creds) => Outbound::Creds { req, creds },
                    Err(e) => error_frame(Some(req), &e),
                };
                self.emit(frame).await;
            }
            Inbound::CredsUpdate { req, creds } => match self.update_creds(&creds).await {
                Ok(()) => {
                    if let Some(req) = req {
                        self.emit(Outbound::Ack { req }).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "credential update failed");
                    self.emit(error_frame(req, &e)).await;
                }
            },
            Inbound::KeysGet { req, category, ids } => {
                let found = self.auth.get_keys(&category, &ids).await;
                let data = encode_keys(&category, found);
                self.emit(Outbound::Keys { req, data }).await;
            }
            Inbound::KeysSet { req, data } => {
                let (updates, rejected) = decode_key_updates(data);
                let summary = self.auth.set_keys(&updates).await;
                debug!(
                    upserted = summary.upserted,
                    deleted = summary.deleted,
                    failed = summary.failed + rejected,
                    "signal keys written"
                );
                self.emit(Outbound::Ack { req }).await;
            }
            Inbound::ConnectionUpdate {
                connection,
                status_code,
                qr,
            } => {
                return self
                    .on_connection(connection.as_deref(), status_code, qr.as_deref())
                    .await;
            }
            Inbound::AuthFailure { message } => {
                error!(
                    details = message.as_deref().unwrap_or("none"),
                    "protocol client reported an authentication failure"
                );
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_message(&self, message: InboundMessage) {
        if self.settings.groups_ignore && message.from.is_group() {
            debug!(conversation = %message.from, "ignoring group message");
            return;
        }
        if message.body.trim().is_empty() {
            debug!(conversation = %message.from, "ignoring message without text");
            return;
        }

        let conversation = message.from.clone();
        let entry = QueueEntry {
            state: self.states.scope(conversation.clone()),
            replies: Arc::clone(&self.replies),
            message,
        };
        self.queue.enqueue(conversation, entry).await;
    }

    async fn update_creds(&self, partial: &Json) -> Result<()> {
        let partial = codec::decode(partial)?;
        self.auth.update_creds(partial).await?;
        self.auth.save_creds().await
    }

    async fn on_connection(
        &self,
        connection: Option<&str>,
        status_code: Option<u16>,
        qr: Option<&str>,
    ) -> ControlFlow<Shutdown> {
        if let Some(qr) = qr {
            info!(qr, "scan this QR code with WhatsApp to link the session");
        }

        match connection {
            Some("open") => info!(session = %self.auth.session_id(), "connection open"),
            Some("close") if status_code == Some(LOGGED_OUT) => {
                warn!(session = %self.auth.session_id(), "session was logged out");
                if self.settings.clear_session_on_logout {
                    if let Err(e) = self.auth.clear().await {
                        error!(error = %e, "failed to clear the stored session");
                    }
                } else {
                    warn!("remove the stored credentials and restart to link again");
                }
                return ControlFlow::Break(Shutdown::LoggedOut);
            }
            Some("close") => {
                info!(status_code, "connection closed; the client will reconnect");
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    async fn emit(&self, frame: Outbound) {
        if self.out.send(frame).await.is_err() {
            warn!("bridge output is closed; dropping frame");
        }
    }
}

/// Read frames until the input closes or the session is logged out.
///
/// Queued messages are drained before returning on end of input.
pub async fn run<R>(bridge: &Bridge, input: R, max_line_bytes: usize) -> Result<Shutdown>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(input, LinesCodec::new_with_max_length(max_line_bytes));

    while let Some(frame) = frames.next().await {
        let line = frame.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => {
                Error::External(format!("bridge frame exceeds {max_line_bytes} bytes"))
            }
            LinesCodecError::Io(e) => Error::Io(e),
        })?;

        if let ControlFlow::Break(reason) = bridge.handle_line(&line).await {
            return Ok(reason);
        }
    }

    info!("bridge input closed; waiting for queued messages");
    bridge.wait_idle().await;
    Ok(Shutdown::InputClosed)
}

/// Serialize outbound frames, one JSON object per line.
pub async fn write_frames<W>(mut frames: mpsc::Receiver<Outbound>, output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(output, LinesCodec::new());
    while let Some(frame) = frames.recv().await {
        let line = serde_json::to_string(&frame)?;
        sink.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => Error::Io(e),
            other => Error::External(other.to_string()),
        })?;
    }
    Ok(())
}

fn encode_keys(category: &str, found: HashMap<String, Value>) -> BTreeMap<String, Json> {
    found
        .into_iter()
        .filter_map(|(id, value)| match codec::encode(&value) {
            Ok(encoded) => Some((id, encoded)),
            Err(e) => {
                warn!(category, id = %id, error = %e, "dropping unencodable signal key");
                None
            }
        })
        .collect()
}

/// Decode every value; undecodable entries are skipped and counted.
fn decode_key_updates(data: BTreeMap<String, BTreeMap<String, Option<Json>>>) -> (KeyUpdates, usize) {
    let mut rejected = 0;
    let mut updates = KeyUpdates::new();

    for (category, entries) in data {
        let mut decoded = BTreeMap::new();
        for (id, value) in entries {
            match value.filter(|v| !v.is_null()).map(|v| codec::decode(&v)) {
                None => {
                    decoded.insert(id, None);
                }
                Some(Ok(value)) => {
                    decoded.insert(id, Some(value));
                }
                Some(Err(e)) => {
                    warn!(category = %category, id = %id, error = %e, "rejecting undecodable signal key");
                    rejected += 1;
                }
            }
        }
        updates.insert(category, decoded);
    }
    (updates, rejected)
}

fn error_frame(req: Option<Json>, err: &Error) -> Outbound {
    Outbound::Error {
        req,
        message: err.to_string(),
    }
}

fn request_id_of(line: &str) -> Option<Json> {
    serde_json::from_str::<Json>(line)
        .ok()
        .and_then(|v| v.get("req").cloned())
}
