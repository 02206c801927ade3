// Control channel between the controller and the workload worker.
//
// Frames are JSON text. The controller sends a command, the worker answers
// "status" with the serialized snapshot of all aggregates and clears them.
// Both directions hold a single frame, so at most one request is in flight.

use crate::error::HarnessError;
use crate::registry::{AggregationRegistry, Snapshot};
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const STATUS: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Unknown(String),
}

pub fn encode_command(command: &str) -> Result<String, HarnessError> {
    Ok(serde_json::to_string(command)?)
}

pub fn decode_command(frame: &str) -> Result<Command, HarnessError> {
    let command: String = serde_json::from_str(frame)?;
    Ok(match command.as_str() {
        STATUS => Command::Status,
        _ => Command::Unknown(command),
    })
}

/// Creates a connected controller / worker pair.
pub fn channel() -> (ControlChannel, ControlEndpoint) {
    let (req_tx, req_rx) = mpsc::channel(1);
    let (rep_tx, rep_rx) = mpsc::channel(1);
    (
        ControlChannel { requests: req_tx, replies: rep_rx },
        ControlEndpoint { requests: req_rx, replies: rep_tx },
    )
}

/// Controller side.
#[derive(Debug)]
pub struct ControlChannel {
    requests: mpsc::Sender<String>,
    replies: mpsc::Receiver<String>,
}

impl ControlChannel {
    /// Sends a raw frame without waiting for a reply.
    pub async fn send_frame(&self, frame: String) -> Result<(), HarnessError> {
        self.requests
            .send(frame)
            .await
            .map_err(|_| HarnessError::ChannelClosed("worker is gone".to_string()))
    }

    /// Asks for the current aggregates; the worker clears them as it answers.
    pub async fn request_status(&mut self) -> Result<Snapshot, HarnessError> {
        self.send_frame(encode_command(STATUS)?).await?;
        let frame = self
            .replies
            .recv()
            .await
            .ok_or_else(|| HarnessError::ChannelClosed("no reply to status request".to_string()))?;
        Ok(serde_json::from_str(&frame)?)
    }
}

/// Worker side.
#[derive(Debug)]
pub struct ControlEndpoint {
    requests: mpsc::Receiver<String>,
    replies: mpsc::Sender<String>,
}

impl ControlEndpoint {
    /// Answers requests until the controller drops its side.
    pub async fn serve(self, registry: Arc<AggregationRegistry>) {
        self.serve_with(registry, |snapshot| serde_json::to_string(snapshot)).await
    }

    // A status that cannot be encoded closes the endpoint, so the pending
    // request fails instead of waiting for a reply that never comes.
    async fn serve_with<F>(mut self, registry: Arc<AggregationRegistry>, encode: F)
    where
        F: Fn(&Snapshot) -> serde_json::Result<String>,
    {
        while let Some(frame) = self.requests.recv().await {
            match decode_command(&frame) {
                Ok(Command::Status) => {
                    let snapshot = registry.snapshot_and_clear();
                    let reply = match encode(&snapshot) {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!("evloop: failed to encode status: {}", e);
                            break;
                        }
                    };
                    if self.replies.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(Command::Unknown(other)) => warn!("evloop: unknown message {}", other),
                Err(e) => warn!("evloop: malformed message {:?}: {}", frame, e),
            }
        }
        debug!("evloop: control channel closed");
    }
}
