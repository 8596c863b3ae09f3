use async_trait::async_trait;
use tokio::sync::mpsc;

use wab_core::{domain::ConversationId, errors::Error, messaging::port::MessagingPort, Result};

use crate::bridge::Outbound;

/// Sends replies by asking the protocol client to deliver them.
#[derive(Clone, Debug)]
pub struct BridgeMessenger {
    out: mpsc::Sender<Outbound>,
}

impl BridgeMessenger {
    pub fn new(out: mpsc::Sender<Outbound>) -> Self {
        Self { out }
    }
}

#[async_trait]
impl MessagingPort for BridgeMessenger {
    async fn send_text(&self, to: &ConversationId, text: &str) -> Result<()> {
        self.out
            .send(Outbound::Send {
                to: to.as_str().to_string(),
                body: text.to_string(),
            })
            .await
            .map_err(|_| Error::External("bridge output is closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_becomes_a_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let messenger = BridgeMessenger::new(tx);
        messenger
            .send_text(&ConversationId::from("1@s.whatsapp.net"), "hi")
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Send { to, body } => {
                assert_eq!(to, "1@s.whatsapp.net");
                assert_eq!(body, "hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_output_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let messenger = BridgeMessenger::new(tx);
        assert!(messenger
            .send_text(&ConversationId::from("a"), "hi")
            .await
            .is_err());
    }
}
