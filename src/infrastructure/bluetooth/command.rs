//! Control Command Channel
//!
//! Thin front-end handle for writing to the control characteristic. Each
//! call submits one request; retrying a rejected write is the supervisor's
//! business.

use crate::domain::models::{BluetoothCommand, CommandOutcome, CommandRequest};
use crate::infrastructure::bluetooth::protocol::ControlCommand;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CommandChannel {
    bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
}

impl CommandChannel {
    pub fn new(bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>) -> Self {
        Self { bluetooth_tx }
    }

    /// Write `payload` and wait for the outcome
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> CommandOutcome {
        let (request, reply) = CommandRequest::with_reply(payload);
        if self
            .bluetooth_tx
            .send(BluetoothCommand::WriteControl(request))
            .is_err()
        {
            warn!("Bluetooth worker is gone, command dropped");
            return CommandOutcome::NotReady;
        }
        // A dropped reply means the worker shut down mid-write
        reply.await.unwrap_or(CommandOutcome::ConnectionLost)
    }

    pub async fn send_command(&self, command: ControlCommand) -> CommandOutcome {
        self.send(command.as_bytes()).await
    }

    /// Fire-and-forget variant; the outcome still arrives as `AppEvent::CommandResult`
    pub fn submit(&self, command: ControlCommand) -> bool {
        self.bluetooth_tx
            .send(BluetoothCommand::WriteControl(CommandRequest::new(
                command.as_bytes(),
            )))
            .is_ok()
    }
}
