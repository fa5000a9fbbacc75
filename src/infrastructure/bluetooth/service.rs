//! Bluetooth Service Module
//!
//! Event loop that owns the connection supervisor. Front-end commands,
//! transport completions and fired retry timers are merged into one stream
//! and handled one at a time on the worker's runtime.

use crate::domain::models::{AppEvent, BluetoothCommand};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{ConnectionSupervisor, PendingRetry};
use crate::infrastructure::bluetooth::retry::RetryPolicy;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<T: GattTransport> {
    supervisor: ConnectionSupervisor<T>,
    timer_tx: mpsc::UnboundedSender<PendingRetry>,
    timer_rx: mpsc::UnboundedReceiver<PendingRetry>,
}

impl<T: GattTransport> BluetoothService<T> {
    /// Create a new Bluetooth service
    pub fn new(
        transport: T,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            supervisor: ConnectionSupervisor::new(
                transport,
                settings.ble.clone(),
                RetryPolicy::new(&settings.retry),
                event_sender,
            ),
            timer_tx,
            timer_rx,
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<T> {
        &self.supervisor
    }

    /// Run until `Shutdown` arrives or the command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Bluetooth worker started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(BluetoothCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport_events.recv() => self.supervisor.handle_event(event),
                Some(retry) = self.timer_rx.recv() => self.supervisor.on_retry_due(retry),
            }
            self.schedule_retries();
        }

        self.supervisor.disconnect();
        info!("Bluetooth worker stopped");
    }

    fn handle_command(&mut self, command: BluetoothCommand) {
        debug!("Bluetooth command: {:?}", command);
        match command {
            BluetoothCommand::StartScan => self.supervisor.start_scan(),
            BluetoothCommand::StopScan => self.supervisor.stop_scan(),
            BluetoothCommand::WriteControl(request) => self.supervisor.write_control(request),
            BluetoothCommand::ReadControl => self.supervisor.read_control(),
            BluetoothCommand::Disconnect => self.supervisor.disconnect(),
            BluetoothCommand::Reset => self.supervisor.reset(),
            BluetoothCommand::Shutdown => {}
        }
    }

    /// Timers are never cancelled; the supervisor re-checks state when they fire
    fn schedule_retries(&mut self) {
        for retry in self.supervisor.take_pending_retries() {
            let timer_tx = self.timer_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retry.delay).await;
                let _ = timer_tx.send(retry);
            });
        }
    }
}
