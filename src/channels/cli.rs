//! CLI channel — reads `contact: text` lines from stdin, prints responses to
//! stdout. For local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::error::{ChannelError, DeliveryError};
use crate::inbound::InboundMessage;
use crate::outbound::Transport;

/// Contact used for lines without a `contact:` prefix.
pub const DEFAULT_CONTACT: &str = "local-user";

type Input = Box<dyn AsyncRead + Send + Unpin>;

/// Line-oriented inbound channel. Each line is `contact: text`; a line with
/// no prefix belongs to [`DEFAULT_CONTACT`].
pub struct CliChannel {
    input: Mutex<Option<Input>>,
}

impl CliChannel {
    /// Read from stdin.
    pub fn new() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            input: Mutex::new(Some(Box::new(reader))),
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<IncomingMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (contact, text) = match line.split_once(':') {
        Some((contact, text))
            if !contact.trim().is_empty()
                && !contact.trim().contains(char::is_whitespace)
                && !text.trim().is_empty() =>
        {
            (contact.trim(), text.trim())
        }
        _ => (DEFAULT_CONTACT, line),
    };

    Some(IncomingMessage {
        contact_id: contact.to_string(),
        message: InboundMessage::text(text).with_metadata(serde_json::json!({ "channel": "cli" })),
    })
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let input = self
            .input
            .lock()
            .map_err(|_| ChannelError::StartupFailed {
                name: "cli".into(),
                reason: "input lock poisoned".into(),
            })?
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "cli".into(),
                reason: "already started".into(),
            })?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(msg) = parse_line(&line) else {
                            continue;
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }
}

/// Prints responses to stdout.
pub struct StdoutTransport;

#[async_trait]
impl Transport for StdoutTransport {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(
        &self,
        to: &str,
        content: &str,
        _metadata: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        println!("[{to}] {content}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn parses_contact_prefix() {
        let msg = parse_line("alice: what time works?").unwrap();
        assert_eq!(msg.contact_id, "alice");
        assert_eq!(msg.message.text, "what time works?");
        assert_eq!(msg.message.metadata["channel"], "cli");
    }

    #[test]
    fn unprefixed_line_uses_default_contact() {
        let msg = parse_line("just text").unwrap();
        assert_eq!(msg.contact_id, DEFAULT_CONTACT);
        assert_eq!(msg.message.text, "just text");
    }

    #[test]
    fn prefix_with_spaces_is_not_a_contact() {
        let msg = parse_line("see you at: 3pm").unwrap();
        assert_eq!(msg.contact_id, DEFAULT_CONTACT);
        assert_eq!(msg.message.text, "see you at: 3pm");
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("   ").is_none());
    }

    #[tokio::test]
    async fn streams_lines_from_reader() {
        let input: &[u8] = b"alice: hi\n\nbob: hey\n";
        let channel = CliChannel::from_reader(input);

        let stream = channel.start().await.unwrap();
        let messages: Vec<_> = stream.collect().await;

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].contact_id, "alice");
        assert_eq!(messages[1].contact_id, "bob");
        assert_eq!(messages[1].message.text, "hey");
    }

    #[tokio::test]
    async fn second_start_fails() {
        let input: &[u8] = b"";
        let channel = CliChannel::from_reader(input);
        channel.start().await.unwrap();
        assert!(matches!(
            channel.start().await,
            Err(ChannelError::StartupFailed { .. })
        ));
    }

    #[tokio::test]
    async fn stdout_transport_always_delivers() {
        StdoutTransport
            .deliver("alice", "hello", &serde_json::Value::Null)
            .await
            .unwrap();
    }
}
