//! Headless front end: owns the bluetooth worker thread, routes samples to
//! the CSV exporter and turns console lines into worker commands.

use crate::domain::models::{
    AppEvent, BluetoothCommand, MessageSeverity, Sample, SampleSink, SessionState,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::ControlCommand;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use crate::infrastructure::bluetooth::{BluetoothService, CommandChannel};
use crate::infrastructure::export::CsvExporter;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Console commands accepted on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Scan,
    StopScan,
    Start,
    Stop,
    Read,
    Disconnect,
    Reset,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "scan" => Some(Self::Scan),
            "stopscan" | "stop-scan" => Some(Self::StopScan),
            "start" | "on" => Some(Self::Start),
            "stop" | "off" => Some(Self::Stop),
            "read" => Some(Self::Read),
            "disconnect" => Some(Self::Disconnect),
            "reset" => Some(Self::Reset),
            "quit" | "exit" | "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
    commands: CommandChannel,
}

impl Dispatcher {
    pub fn send(&self, command: BluetoothCommand) -> bool {
        let sent = self.bluetooth_tx.send(command).is_ok();
        if !sent {
            warn!("Bluetooth worker is not running");
        }
        sent
    }

    /// Returns `false` once the worker has gone away
    pub fn dispatch(&self, command: ConsoleCommand) -> bool {
        match command {
            ConsoleCommand::Scan => self.send(BluetoothCommand::StartScan),
            ConsoleCommand::StopScan => self.send(BluetoothCommand::StopScan),
            ConsoleCommand::Start => self.commands.submit(ControlCommand::Enable),
            ConsoleCommand::Stop => self.commands.submit(ControlCommand::Disable),
            ConsoleCommand::Read => self.send(BluetoothCommand::ReadControl),
            ConsoleCommand::Disconnect => self.send(BluetoothCommand::Disconnect),
            ConsoleCommand::Reset => self.send(BluetoothCommand::Reset),
            ConsoleCommand::Quit => self.send(BluetoothCommand::Shutdown),
        }
    }
}

pub struct SensorApp {
    bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
    events_rx: mpsc::UnboundedReceiver<AppEvent>,
    commands: CommandChannel,
    exporter: Option<Box<dyn SampleSink>>,
    state: SessionState,
    latest_sample: Option<Sample>,
    samples_received: u64,
    worker: Option<JoinHandle<()>>,
}

impl SensorApp {
    /// Spawn the bluetooth worker on its own thread with a current-thread runtime
    ///
    /// `make_transport` runs on the worker thread and receives the channel
    /// its completions must be sent on.
    pub fn start<T, F>(settings: &Settings, make_transport: F) -> anyhow::Result<Self>
    where
        T: GattTransport + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> T + Send + 'static,
    {
        let exporter: Option<Box<dyn SampleSink>> = if settings.export.enabled {
            Some(Box::new(CsvExporter::create(&settings.export.directory)?))
        } else {
            None
        };

        let (event_tx, events_rx) = mpsc::unbounded_channel();
        let (bluetooth_tx, bluetooth_rx) = mpsc::unbounded_channel();
        let worker_settings = settings.clone();

        let worker = std::thread::Builder::new()
            .name("bluetooth".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime for Bluetooth: {}", e);
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
                    let transport = make_transport(transport_tx);
                    BluetoothService::new(transport, &worker_settings, event_tx)
                        .run(bluetooth_rx, transport_rx)
                        .await;
                });
            })?;

        Ok(Self {
            commands: CommandChannel::new(bluetooth_tx.clone()),
            bluetooth_tx,
            events_rx,
            exporter,
            state: SessionState::Idle,
            latest_sample: None,
            samples_received: 0,
            worker: Some(worker),
        })
    }

    /// Replace the sample consumer (the CSV exporter by default)
    pub fn set_sink(&mut self, sink: Option<Box<dyn SampleSink>>) {
        self.exporter = sink;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn latest_sample(&self) -> Option<Sample> {
        self.latest_sample
    }

    pub fn samples_received(&self) -> u64 {
        self.samples_received
    }

    /// Clonable handle for threads that feed the worker (stdin reader)
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            bluetooth_tx: self.bluetooth_tx.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Block until the worker reports something; `None` once it has stopped
    pub fn next_event_blocking(&mut self) -> Option<AppEvent> {
        self.events_rx.blocking_recv()
    }

    pub async fn next_event(&mut self) -> Option<AppEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::StateChanged(state) => {
                self.state = state;
                println!("[state] {}", state);
            }
            AppEvent::Sample(sample) => {
                self.samples_received += 1;
                self.latest_sample = Some(sample);
                if let Some(sink) = self.exporter.as_mut() {
                    if let Err(e) = sink.on_sample(sample) {
                        error!("Export failed, disabling CSV output: {:#}", e);
                        self.exporter = None;
                    }
                }
            }
            AppEvent::CommandResult(outcome) => {
                println!("[command] {:?}", outcome);
            }
            AppEvent::ControlValue(value) => {
                println!("[control] {:02x?}", value);
            }
            AppEvent::LogMessage(status) => match status.severity {
                MessageSeverity::Error => println!("[error] {}", status.message),
                MessageSeverity::Warning => println!("[warn] {}", status.message),
                MessageSeverity::Info | MessageSeverity::Success => {
                    println!("[info] {}", status.message)
                }
            },
        }
    }

    /// Ask the worker to stop and wait for its thread
    pub fn shutdown(&mut self) {
        let _ = self.bluetooth_tx.send(BluetoothCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Bluetooth worker panicked");
            }
        }
        info!("Session ended after {} samples", self.samples_received);
    }
}

impl Drop for SensorApp {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}
