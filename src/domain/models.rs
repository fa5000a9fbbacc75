use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// One decoded IMU reading from the sensor characteristic
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    // Device clock (milliseconds since the device started streaming)
    pub elapsed_time_millis: i64,

    // Accelerometer data
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,

    // Gyroscope data
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
}

/// The single peripheral a session targets, captured from its advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralIdentity {
    /// 48-bit Bluetooth device address
    pub address: u64,
    /// Service identifier the match was made on
    pub service: Uuid,
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.address.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Externally visible lifecycle of a connection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    EnablingNotifications,
    Ready,
    Disconnected,
    Failed,
}

impl SessionState {
    /// States in which the transport holds (or is acquiring) a link
    pub fn is_link_active(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::NegotiatingMtu
                | Self::DiscoveringServices
                | Self::EnablingNotifications
                | Self::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::NegotiatingMtu => "negotiating MTU",
            Self::DiscoveringServices => "discovering services",
            Self::EnablingNotifications => "enabling notifications",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Completion of a control characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Written,
    /// Every write attempt allowed by the retry policy was rejected
    RetriesExhausted,
    /// The session was not in `Ready` when the command was submitted
    NotReady,
    /// The link dropped before the write completed
    ConnectionLost,
}

impl CommandOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Written
    }
}

/// A control payload plus an optional completion slot for the caller
#[derive(Debug)]
pub struct CommandRequest {
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

impl CommandRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            reply: None,
        }
    }

    pub fn with_reply(payload: impl Into<Vec<u8>>) -> (Self, oneshot::Receiver<CommandOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload: payload.into(),
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Deliver the outcome to whoever submitted the request
    pub fn complete(self, outcome: CommandOutcome) {
        if let Some(reply) = self.reply {
            // Caller may have stopped waiting
            let _ = reply.send(outcome);
        }
    }
}

/// Everything the bluetooth worker reports to the front end
#[derive(Debug, Clone)]
pub enum AppEvent {
    StateChanged(SessionState),
    Sample(Sample),
    CommandResult(CommandOutcome),
    ControlValue(Vec<u8>),
    LogMessage(StatusMessage),
}

/// Requests the front end sends to the bluetooth worker
#[derive(Debug)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    WriteControl(CommandRequest),
    ReadControl,
    Disconnect,
    Reset,
    Shutdown,
}

/// Consumer of decoded samples (UI state, file export)
pub trait SampleSink {
    fn on_sample(&mut self, sample: Sample) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
