//! Stdin source — one job message per line, for local runs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::{Message, MessageSource};
use crate::error::QueueError;

/// How long `receive` waits for a line before reporting an empty queue.
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Reads line-delimited JSON messages. EOF means the queue stays empty.
pub struct StdinSource {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            lines: Mutex::new(rx),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for StdinSource {
    async fn receive(&self) -> Result<Option<Message>, QueueError> {
        let mut lines = self.lines.lock().await;
        let line = match tokio::time::timeout(RECEIVE_WAIT, lines.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return Ok(None),
        };
        Ok(Some(Message {
            id: Uuid::new_v4().to_string(),
            body: line,
        }))
    }

    async fn delete(&self, message: &Message) -> Result<(), QueueError> {
        debug!(message_id = %message.id, "Message processed");
        Ok(())
    }
}
