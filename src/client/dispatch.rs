//! Fire-and-forget enqueueing for callers on a latency-sensitive path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::Connector;
use crate::client::producer::Producer;
use crate::transport::MemoryMessage;

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Success,
    Error,
}

/// Outcome of a background send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReport {
    pub status: SendStatus,
    pub message: String,
}

impl SendReport {
    pub fn is_success(&self) -> bool {
        self.status == SendStatus::Success
    }
}

/// Sends `message` on a background task. The caller never waits on the
/// broker; failures end up in the logs and in the returned report.
pub fn spawn_send<C: Connector>(
    producer: Arc<Producer<C>>,
    message: MemoryMessage,
) -> JoinHandle<SendReport> {
    tokio::spawn(async move { send_with_report(&producer, &message).await })
}

pub async fn send_with_report<C: Connector>(
    producer: &Producer<C>,
    message: &MemoryMessage,
) -> SendReport {
    info!("sending memory message: {}", message.preview(PREVIEW_CHARS));

    match producer.send(message).await {
        Ok(()) => {
            info!("memory message sent");
            SendReport {
                status: SendStatus::Success,
                message: format!("message sent to queue '{}'", producer.queue()),
            }
        }
        Err(e) => {
            error!("failed to send memory message: {e}");
            SendReport {
                status: SendStatus::Error,
                message: e.to_string(),
            }
        }
    }
}
