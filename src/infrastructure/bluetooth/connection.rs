//! BLE Connection Supervisor
//!
//! Owns the GATT session lifecycle for one sensor board:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> NegotiatingMtu -> DiscoveringServices
//!      -> EnablingNotifications -> Ready
//!
//! any active state --link lost--> Disconnected --retry--> Connecting
//!                                              --exhausted--> Failed
//! ```
//!
//! Every input (transport completion, front-end command, retry timer) enters
//! through exactly one `&mut self` method, so the machine is never mutated
//! from two callbacks at once. Retry delays are not slept here: they are
//! queued as [`PendingRetry`] values that the caller schedules and feeds back
//! through [`ConnectionSupervisor::on_retry_due`], where the current state is
//! re-checked before acting.

use crate::domain::models::{
    AppEvent, CommandOutcome, CommandRequest, MessageSeverity, PeripheralIdentity, SessionState,
    StatusMessage,
};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::retry::{OperationKind, RetryCounters, RetryPolicy};
use crate::infrastructure::bluetooth::scanner::ScanSession;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, CharacteristicRef, DiscoveredService, GattStatus, GattTransport,
    TransportEvent,
};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Why the supervisor entered `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    #[error("profile mismatch: {0}")]
    ProfileMismatch(String),

    #[error("{0} retries exhausted")]
    PolicyExhausted(OperationKind),
}

/// A retry the caller must fire after `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRetry {
    pub kind: OperationKind,
    pub delay: Duration,
    /// Session generation the retry was scheduled in
    pub generation: u64,
}

/// Characteristic handles; only exist while the link is being enabled or ready
#[derive(Debug, Clone, Copy)]
struct GattLink {
    control: CharacteristicRef,
    data: CharacteristicRef,
}

#[derive(Debug)]
enum Stage {
    Idle,
    Scanning,
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    EnablingNotifications(GattLink),
    Ready(GattLink),
    Disconnected,
    Failed(FailureCause),
}

impl Stage {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Scanning => SessionState::Scanning,
            Self::Connecting => SessionState::Connecting,
            Self::NegotiatingMtu => SessionState::NegotiatingMtu,
            Self::DiscoveringServices => SessionState::DiscoveringServices,
            Self::EnablingNotifications(_) => SessionState::EnablingNotifications,
            Self::Ready(_) => SessionState::Ready,
            Self::Disconnected => SessionState::Disconnected,
            Self::Failed(_) => SessionState::Failed,
        }
    }
}

pub struct ConnectionSupervisor<T: GattTransport> {
    transport: T,
    scanner: ScanSession,
    profile: BleSettings,
    policy: RetryPolicy,
    counters: RetryCounters,
    stage: Stage,
    peripheral: Option<PeripheralIdentity>,
    mtu: Option<u16>,
    /// Bumped whenever a link is released or the session is reset, so timers
    /// queued against an older link are ignored
    generation: u64,
    /// Front of the queue is the write in flight
    commands: VecDeque<CommandRequest>,
    read_in_flight: bool,
    pending_retries: Vec<PendingRetry>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: GattTransport> ConnectionSupervisor<T> {
    pub fn new(
        transport: T,
        profile: BleSettings,
        policy: RetryPolicy,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            scanner: ScanSession::new(profile.service_uuid),
            profile,
            policy,
            counters: RetryCounters::default(),
            stage: Stage::Idle,
            peripheral: None,
            mtu: None,
            generation: 0,
            commands: VecDeque::new(),
            read_in_flight: false,
            pending_retries: Vec::new(),
            event_sender,
        }
    }

    pub fn state(&self) -> SessionState {
        self.stage.state()
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match &self.stage {
            Stage::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn peripheral(&self) -> Option<PeripheralIdentity> {
        self.peripheral
    }

    /// MTU reported by the last successful negotiation on this link
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn retry_count(&self, kind: OperationKind) -> u32 {
        self.counters.get(kind)
    }

    /// Retries queued since the last call; the caller owns their timers
    pub fn take_pending_retries(&mut self) -> Vec<PendingRetry> {
        std::mem::take(&mut self.pending_retries)
    }

    // ----------------------------------------------------------------------
    // Front-end requests
    // ----------------------------------------------------------------------

    pub fn start_scan(&mut self) {
        if !matches!(self.stage, Stage::Idle) {
            warn!("Scan requested while {}, ignoring", self.state());
            return;
        }
        match self.scanner.start(&mut self.transport) {
            Ok(()) => {
                self.send_log("Scanning for sensor board...", MessageSeverity::Info);
                self.transition(Stage::Scanning);
            }
            Err(e) => {
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
            }
        }
    }

    /// Cancel discovery; never touches an established link
    pub fn stop_scan(&mut self) {
        self.scanner.stop(&mut self.transport);
        if matches!(self.stage, Stage::Scanning) {
            self.transition(Stage::Idle);
        }
    }

    /// Queue a control write. Exactly one transport write per attempt.
    pub fn write_control(&mut self, request: CommandRequest) {
        if !matches!(self.stage, Stage::Ready(_)) {
            warn!("Command rejected: session is {}", self.state());
            self.finish_command(request, CommandOutcome::NotReady);
            return;
        }
        self.commands.push_back(request);
        if self.commands.len() == 1 {
            self.counters.reset(OperationKind::CharacteristicWrite);
            self.submit_write();
        }
    }

    pub fn read_control(&mut self) {
        if !matches!(self.stage, Stage::Ready(_)) {
            warn!("Read rejected: session is {}", self.state());
            return;
        }
        if self.read_in_flight {
            debug!("Control read already in flight");
            return;
        }
        self.read_in_flight = true;
        self.submit_read();
    }

    /// Drop the link on request. Pending retries are invalidated.
    pub fn disconnect(&mut self) {
        if matches!(self.stage, Stage::Idle | Stage::Failed(_)) {
            return;
        }
        info!("Disconnecting from sensor board");
        self.scanner.stop(&mut self.transport);
        self.release_link(CommandOutcome::ConnectionLost);
        self.counters.reset_all();
        self.send_log("Disconnected from device", MessageSeverity::Info);
        self.transition(Stage::Idle);
    }

    /// Leave `Failed` (or any state) and return to `Idle`
    pub fn reset(&mut self) {
        info!("Resetting session from {}", self.state());
        self.scanner.stop(&mut self.transport);
        if self.state().is_link_active() {
            self.release_link(CommandOutcome::ConnectionLost);
        }
        self.generation += 1;
        self.counters.reset_all();
        self.peripheral = None;
        self.transition(Stage::Idle);
    }

    // ----------------------------------------------------------------------
    // Transport events
    // ----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(adv) => self.on_advertisement(&adv),
            TransportEvent::ScanFailed { code } => self.on_scan_failed(code),
            TransportEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state(status, connected)
            }
            TransportEvent::MtuChanged { mtu, success } => self.on_mtu_changed(mtu, success),
            TransportEvent::ServicesDiscovered { success, services } => {
                self.on_services_discovered(success, &services)
            }
            TransportEvent::DescriptorWritten { success, .. } => {
                self.on_descriptor_written(success)
            }
            TransportEvent::CharacteristicRead {
                characteristic,
                success,
                value,
            } => {
                if characteristic == self.profile.control_char_uuid {
                    self.on_control_read(success, value);
                }
            }
            TransportEvent::CharacteristicWritten {
                characteristic,
                success,
            } => {
                if characteristic == self.profile.control_char_uuid {
                    self.on_control_written(success);
                }
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
        }
    }

    fn on_advertisement(&mut self, adv: &Advertisement) {
        if !matches!(self.stage, Stage::Scanning) {
            return;
        }
        if let Some(identity) = self.scanner.on_advertisement(&mut self.transport, adv) {
            self.peripheral = Some(identity);
            self.begin_connect();
        }
    }

    fn on_scan_failed(&mut self, code: i32) {
        self.scanner.on_scan_failed(code);
        if matches!(self.stage, Stage::Scanning) {
            self.send_log(
                &format!("Scan failed with error code {}", code),
                MessageSeverity::Error,
            );
            self.transition(Stage::Idle);
        }
    }

    fn on_connection_state(&mut self, status: GattStatus, connected: bool) {
        if status.is_success() && connected {
            if !matches!(self.stage, Stage::Connecting) {
                debug!("Connected event while {}, ignoring", self.state());
                return;
            }
            info!("Connected to GATT server");
            self.counters.reset(OperationKind::Reconnect);
            self.transition(Stage::NegotiatingMtu);
            if let Err(e) = self.transport.request_mtu(self.profile.requested_mtu) {
                // MTU is an optimisation; carry on with the default
                warn!("MTU request not submitted: {}", e);
                self.begin_discovery();
            }
            return;
        }

        if !self.state().is_link_active() {
            debug!(
                "Connection change (status {}, connected {}) while {}, ignoring",
                status.0,
                connected,
                self.state()
            );
            return;
        }

        if status == GattStatus::LINK_TIMEOUT {
            warn!("Connection timed out (status 133), treating as disconnect");
        } else if !status.is_success() {
            warn!("Connection state error: status {}", status.0);
        } else {
            warn!("Disconnected from GATT server");
        }
        self.on_link_lost();
    }

    fn on_mtu_changed(&mut self, mtu: u16, success: bool) {
        if !matches!(self.stage, Stage::NegotiatingMtu) {
            return;
        }
        if success {
            info!("MTU negotiated: {}", mtu);
            self.mtu = Some(mtu);
        } else {
            warn!("MTU negotiation failed, continuing with default");
        }
        self.begin_discovery();
    }

    fn on_services_discovered(&mut self, success: bool, services: &[DiscoveredService]) {
        if !matches!(self.stage, Stage::DiscoveringServices) {
            return;
        }
        if !success {
            warn!("Service discovery failed");
            self.on_link_lost();
            return;
        }

        let link = match self.locate_characteristics(services) {
            Ok(link) => link,
            Err(cause) => {
                self.fail(cause);
                return;
            }
        };

        self.transition(Stage::EnablingNotifications(link));
        self.submit_descriptor_write();
    }

    fn locate_characteristics(
        &self,
        services: &[DiscoveredService],
    ) -> Result<GattLink, FailureCause> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.profile.service_uuid)
            .ok_or_else(|| {
                FailureCause::ProfileMismatch(format!(
                    "service {} not found",
                    self.profile.service_uuid
                ))
            })?;
        info!("Found sensor service");

        let find = |uuid: uuid::Uuid, what: &str| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .copied()
                .ok_or_else(|| {
                    FailureCause::ProfileMismatch(format!("{} characteristic {} not found", what, uuid))
                })
        };
        let control = find(self.profile.control_char_uuid, "control")?;
        let data = find(self.profile.data_char_uuid, "data")?;

        if !data.properties.can_notify() {
            return Err(FailureCause::ProfileMismatch(
                "data characteristic does not support notifications".to_string(),
            ));
        }
        Ok(GattLink { control, data })
    }

    fn on_descriptor_written(&mut self, success: bool) {
        let Stage::EnablingNotifications(link) = self.stage else {
            return;
        };
        if success {
            info!("Notifications enabled successfully");
            self.counters.reset(OperationKind::DescriptorWrite);
            self.send_log("Connection established!", MessageSeverity::Success);
            self.transition(Stage::Ready(link));
            if link.control.properties.can_read() {
                self.read_control();
            }
            return;
        }
        self.retry_or_fail(OperationKind::DescriptorWrite);
    }

    fn on_control_read(&mut self, success: bool, value: Vec<u8>) {
        if !matches!(self.stage, Stage::Ready(_)) || !self.read_in_flight {
            return;
        }
        if success {
            debug!("Control value: {:02X?}", value);
            self.counters.reset(OperationKind::CharacteristicRead);
            self.read_in_flight = false;
            let _ = self.event_sender.send(AppEvent::ControlValue(value));
            return;
        }
        match self
            .counters
            .next_retry(&self.policy, OperationKind::CharacteristicRead)
        {
            Some(delay) => {
                warn!("Control read failed, retrying in {:?}", delay);
                self.schedule(OperationKind::CharacteristicRead, delay);
            }
            None => {
                error!("Maximum control read attempts reached");
                self.counters.reset(OperationKind::CharacteristicRead);
                self.read_in_flight = false;
                self.send_log("Control read failed", MessageSeverity::Error);
            }
        }
    }

    fn on_control_written(&mut self, success: bool) {
        if !matches!(self.stage, Stage::Ready(_)) || self.commands.is_empty() {
            return;
        }
        if success {
            self.counters.reset(OperationKind::CharacteristicWrite);
            if let Some(request) = self.commands.pop_front() {
                info!("Control value written: {:02X?}", request.payload);
                self.finish_command(request, CommandOutcome::Written);
            }
            self.submit_write();
            return;
        }
        self.on_write_failed();
    }

    fn on_write_failed(&mut self) {
        match self
            .counters
            .next_retry(&self.policy, OperationKind::CharacteristicWrite)
        {
            Some(delay) => {
                warn!("Control write failed, retrying in {:?}", delay);
                self.schedule(OperationKind::CharacteristicWrite, delay);
            }
            None => {
                error!("Maximum control write attempts reached");
                self.counters.reset(OperationKind::CharacteristicWrite);
                if let Some(request) = self.commands.pop_front() {
                    self.finish_command(request, CommandOutcome::RetriesExhausted);
                }
                self.submit_write();
            }
        }
    }

    fn on_notification(&mut self, characteristic: uuid::Uuid, value: &[u8]) {
        let Stage::Ready(link) = &self.stage else {
            return;
        };
        if characteristic != link.data.uuid {
            return;
        }
        match protocol::decode_frame(value) {
            Ok(sample) => {
                trace!("Sample: {:?}", sample);
                let _ = self.event_sender.send(AppEvent::Sample(sample));
            }
            Err(rejection) => {
                debug!(
                    "Dropped frame {:?}: {}",
                    String::from_utf8_lossy(value),
                    rejection
                );
            }
        }
    }

    // ----------------------------------------------------------------------
    // Retry timers
    // ----------------------------------------------------------------------

    /// A scheduled retry fired. State may have moved on since it was queued.
    pub fn on_retry_due(&mut self, retry: PendingRetry) {
        if retry.generation != self.generation {
            debug!("Stale {} retry ignored", retry.kind);
            return;
        }
        match (retry.kind, &self.stage) {
            (OperationKind::Reconnect, Stage::Disconnected) => {
                info!(
                    "Reconnect attempt {}",
                    self.counters.get(OperationKind::Reconnect)
                );
                self.begin_connect();
            }
            (OperationKind::DescriptorWrite, Stage::EnablingNotifications(_)) => {
                info!("Retrying notification descriptor write");
                self.submit_descriptor_write();
            }
            (OperationKind::CharacteristicRead, Stage::Ready(_)) if self.read_in_flight => {
                info!("Retrying control read");
                self.submit_read();
            }
            (OperationKind::CharacteristicWrite, Stage::Ready(_)) if !self.commands.is_empty() => {
                info!("Retrying control write");
                self.submit_write();
            }
            (kind, _) => debug!("{} retry no longer applies in {}", kind, self.state()),
        }
    }

    // ----------------------------------------------------------------------
    // Internals
    // ----------------------------------------------------------------------

    fn begin_connect(&mut self) {
        let Some(peripheral) = self.peripheral else {
            error!("No peripheral to connect to");
            self.transition(Stage::Idle);
            return;
        };
        // One outstanding attempt: only Scanning/Disconnected may start one
        if !matches!(self.stage, Stage::Scanning | Stage::Disconnected) {
            debug!("Connect requested while {}, ignoring", self.state());
            return;
        }

        info!("Connecting to sensor board {}", peripheral);
        self.transition(Stage::Connecting);
        if let Err(e) = self.transport.connect(&peripheral, false) {
            warn!("Connect request failed: {}", e);
            self.on_link_lost();
        }
    }

    fn begin_discovery(&mut self) {
        self.transition(Stage::DiscoveringServices);
        if let Err(e) = self.transport.discover_services() {
            warn!("Service discovery not submitted: {}", e);
            self.on_link_lost();
        }
    }

    fn submit_descriptor_write(&mut self) {
        let Stage::EnablingNotifications(link) = self.stage else {
            return;
        };
        if let Err(e) = self.transport.enable_notifications(&link.data) {
            warn!("Descriptor write not submitted: {}", e);
            self.retry_or_fail(OperationKind::DescriptorWrite);
        }
    }

    fn submit_read(&mut self) {
        let Stage::Ready(link) = self.stage else {
            return;
        };
        if let Err(e) = self.transport.read_characteristic(&link.control) {
            warn!("Control read not submitted: {}", e);
            self.on_control_read(false, Vec::new());
        }
    }

    fn submit_write(&mut self) {
        let Stage::Ready(link) = self.stage else {
            return;
        };
        let Some(request) = self.commands.front() else {
            return;
        };
        if let Err(e) = self.transport.write_characteristic(&link.control, &request.payload) {
            warn!("Control write not submitted: {}", e);
            self.on_write_failed();
        }
    }

    /// Retry `kind` later, or enter `Failed` once its budget is spent
    fn retry_or_fail(&mut self, kind: OperationKind) {
        match self.counters.next_retry(&self.policy, kind) {
            Some(delay) => {
                warn!(
                    "{} failed, retrying in {:?} (attempt {}/{})",
                    kind,
                    delay,
                    self.counters.get(kind),
                    self.policy.limit(kind).max_attempts
                );
                self.schedule(kind, delay);
            }
            None => {
                error!("Maximum {} attempts reached", kind);
                self.fail(FailureCause::PolicyExhausted(kind));
            }
        }
    }

    /// Transient link fault: close, enter `Disconnected`, then retry or fail.
    /// Reconnect is scheduled after the release so its timer stays current.
    fn on_link_lost(&mut self) {
        self.release_link(CommandOutcome::ConnectionLost);
        self.transition(Stage::Disconnected);
        self.retry_or_fail(OperationKind::Reconnect);
    }

    fn release_link(&mut self, outcome: CommandOutcome) {
        self.transport.close();
        self.generation += 1;
        self.mtu = None;
        self.read_in_flight = false;
        while let Some(request) = self.commands.pop_front() {
            self.finish_command(request, outcome);
        }
    }

    fn fail(&mut self, cause: FailureCause) {
        error!("Session failed: {}", cause);
        self.release_link(CommandOutcome::ConnectionLost);
        self.send_log(&format!("Connection failed: {}", cause), MessageSeverity::Error);
        self.transition(Stage::Failed(cause));
    }

    fn schedule(&mut self, kind: OperationKind, delay: Duration) {
        self.pending_retries.push(PendingRetry {
            kind,
            delay,
            generation: self.generation,
        });
    }

    fn finish_command(&self, request: CommandRequest, outcome: CommandOutcome) {
        let _ = self.event_sender.send(AppEvent::CommandResult(outcome));
        request.complete(outcome);
    }

    fn transition(&mut self, next: Stage) {
        let from = self.state();
        self.stage = next;
        let to = self.state();
        if from != to {
            info!("Session state: {} -> {}", from, to);
            let _ = self.event_sender.send(AppEvent::StateChanged(to));
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Sample;
    use crate::domain::settings::RetrySettings;
    use crate::infrastructure::bluetooth::mock::{MockTransport, TransportCall};
    use crate::infrastructure::bluetooth::protocol::{
        CONTROL_CHAR_UUID, DATA_CHAR_UUID, SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::transport::CharProperties;

    const ADDRESS: u64 = 0xA1B2C3D4E5F6;

    struct Harness {
        supervisor: ConnectionSupervisor<MockTransport>,
        radio: MockTransport,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let radio = MockTransport::new();
            let (tx, events) = mpsc::unbounded_channel();
            let supervisor = ConnectionSupervisor::new(
                radio.clone(),
                BleSettings::default(),
                RetryPolicy::new(&RetrySettings::default()),
                tx,
            );
            Self {
                supervisor,
                radio,
                events,
            }
        }

        fn drain(&mut self) -> Vec<AppEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn states(&mut self) -> Vec<SessionState> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e {
                    AppEvent::StateChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }

        fn event(&mut self, event: TransportEvent) {
            self.supervisor.handle_event(event);
        }

        fn fire_pending(&mut self) -> Vec<PendingRetry> {
            let retries = self.supervisor.take_pending_retries();
            for retry in &retries {
                self.supervisor.on_retry_due(*retry);
            }
            retries
        }

        fn advertise(&mut self) {
            self.event(TransportEvent::Advertisement(Advertisement {
                address: ADDRESS,
                local_name: Some("IMU".to_string()),
                service_uuids: vec![SERVICE_UUID],
                rssi: -50,
            }));
        }

        fn connected(&mut self) {
            self.event(TransportEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                connected: true,
            });
        }

        fn disconnected(&mut self) {
            self.event(TransportEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                connected: false,
            });
        }

        fn link_timeout(&mut self) {
            self.event(TransportEvent::ConnectionStateChanged {
                status: GattStatus::LINK_TIMEOUT,
                connected: false,
            });
        }

        fn discovered(&mut self, services: Vec<DiscoveredService>) {
            self.event(TransportEvent::MtuChanged {
                mtu: 40,
                success: true,
            });
            self.event(TransportEvent::ServicesDiscovered {
                success: true,
                services,
            });
        }

        fn descriptor(&mut self, success: bool) {
            self.event(TransportEvent::DescriptorWritten {
                characteristic: DATA_CHAR_UUID,
                success,
            });
        }

        fn to_ready(&mut self) {
            self.supervisor.start_scan();
            self.advertise();
            self.connected();
            self.discovered(vec![sensor_service(CharProperties::READ)]);
            self.descriptor(true);
            assert_eq!(self.supervisor.state(), SessionState::Ready);
        }
    }

    fn sensor_service(control_props: u8) -> DiscoveredService {
        DiscoveredService {
            uuid: SERVICE_UUID,
            characteristics: vec![
                CharacteristicRef {
                    service: SERVICE_UUID,
                    uuid: CONTROL_CHAR_UUID,
                    properties: CharProperties(control_props | CharProperties::WRITE),
                },
                CharacteristicRef {
                    service: SERVICE_UUID,
                    uuid: DATA_CHAR_UUID,
                    properties: CharProperties(CharProperties::NOTIFY),
                },
            ],
        }
    }

    #[test]
    fn test_happy_path_order() {
        let mut h = Harness::new();
        h.to_ready();
        assert_eq!(
            h.states(),
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::NegotiatingMtu,
                SessionState::DiscoveringServices,
                SessionState::EnablingNotifications,
                SessionState::Ready,
            ]
        );
        assert_eq!(h.supervisor.mtu(), Some(40));
        assert_eq!(
            h.radio.calls(),
            vec![
                TransportCall::StartScan(SERVICE_UUID),
                TransportCall::StopScan,
                TransportCall::Connect {
                    address: ADDRESS,
                    auto_connect: false
                },
                TransportCall::RequestMtu(40),
                TransportCall::DiscoverServices,
                TransportCall::EnableNotifications(DATA_CHAR_UUID),
                TransportCall::Read(CONTROL_CHAR_UUID),
            ]
        );
    }

    #[test]
    fn test_discovery_runs_when_mtu_fails() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        h.event(TransportEvent::MtuChanged {
            mtu: 23,
            success: false,
        });
        assert_eq!(h.supervisor.state(), SessionState::DiscoveringServices);
        assert_eq!(h.supervisor.mtu(), None);
    }

    #[test]
    fn test_single_connect_per_scan() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.advertise();
        h.advertise();
        assert_eq!(
            h.radio.count(|c| matches!(c, TransportCall::Connect { .. })),
            1
        );
    }

    #[test]
    fn test_disconnect_from_ready_goes_through_disconnected() {
        let mut h = Harness::new();
        h.to_ready();
        h.drain();

        h.disconnected();
        assert_eq!(h.states(), vec![SessionState::Disconnected]);
        let retries = h.fire_pending();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].delay, Duration::from_millis(2000));
        assert_eq!(h.states(), vec![SessionState::Connecting]);
    }

    #[test]
    fn test_link_timeout_funnels_into_reconnect() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.link_timeout();
        assert_eq!(h.supervisor.state(), SessionState::Disconnected);
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 1);
        h.fire_pending();
        assert_eq!(h.supervisor.state(), SessionState::Connecting);
    }

    #[test]
    fn test_reconnect_exhaustion_fails() {
        let mut h = Harness::new();
        h.to_ready();
        h.drain();

        // Five failures each earn a retry
        h.disconnected();
        for _ in 0..4 {
            assert_eq!(h.fire_pending().len(), 1);
            h.link_timeout();
        }
        assert_eq!(h.fire_pending().len(), 1);
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 5);

        // Sixth failure does not
        h.link_timeout();
        assert_eq!(h.supervisor.state(), SessionState::Failed);
        assert!(h.supervisor.take_pending_retries().is_empty());
        assert_eq!(
            h.supervisor.failure(),
            Some(&FailureCause::PolicyExhausted(OperationKind::Reconnect))
        );
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 5);
    }

    #[test]
    fn test_successful_connect_resets_reconnect_budget() {
        let mut h = Harness::new();
        h.to_ready();
        h.disconnected();
        h.fire_pending();
        h.link_timeout();
        h.fire_pending();
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 2);
        h.connected();
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 0);
    }

    #[test]
    fn test_descriptor_retry_then_ready() {
        let mut h = Harness::new();
        h.to_ready();
        h.event(TransportEvent::CharacteristicRead {
            characteristic: CONTROL_CHAR_UUID,
            success: false,
            value: Vec::new(),
        });
        h.disconnected();
        h.fire_pending();
        h.connected();
        h.discovered(vec![sensor_service(0)]);
        let reads_before = h.supervisor.retry_count(OperationKind::CharacteristicRead);
        assert_eq!(reads_before, 1);

        h.descriptor(false);
        assert_eq!(h.supervisor.state(), SessionState::EnablingNotifications);
        let retries = h.fire_pending();
        assert_eq!(retries[0].kind, OperationKind::DescriptorWrite);
        assert_eq!(retries[0].delay, Duration::from_millis(3000));
        assert_eq!(
            h.radio
                .count(|c| *c == TransportCall::EnableNotifications(DATA_CHAR_UUID)),
            3
        );

        h.descriptor(true);
        assert_eq!(h.supervisor.state(), SessionState::Ready);
        assert_eq!(h.supervisor.retry_count(OperationKind::DescriptorWrite), 0);
        assert_eq!(
            h.supervisor.retry_count(OperationKind::CharacteristicRead),
            reads_before
        );
    }

    #[test]
    fn test_read_timer_from_dropped_link_is_ignored() {
        let mut h = Harness::new();
        h.to_ready();
        h.event(TransportEvent::CharacteristicRead {
            characteristic: CONTROL_CHAR_UUID,
            success: false,
            value: Vec::new(),
        });
        let stale = h.supervisor.take_pending_retries();
        assert_eq!(stale[0].kind, OperationKind::CharacteristicRead);

        h.disconnected();
        h.fire_pending();
        h.connected();
        h.discovered(vec![sensor_service(CharProperties::READ)]);
        h.descriptor(true);
        assert_eq!(h.supervisor.state(), SessionState::Ready);
        h.radio.take_calls();

        h.supervisor.on_retry_due(stale[0]);
        assert_eq!(h.radio.count(|c| matches!(c, TransportCall::Read(_))), 0);
    }

    #[test]
    fn test_descriptor_timer_from_dropped_link_is_ignored() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        h.discovered(vec![sensor_service(0)]);
        h.descriptor(false);
        let stale = h.supervisor.take_pending_retries();
        assert_eq!(stale[0].kind, OperationKind::DescriptorWrite);

        h.disconnected();
        h.fire_pending();
        h.connected();
        h.discovered(vec![sensor_service(0)]);
        assert_eq!(h.supervisor.state(), SessionState::EnablingNotifications);
        h.radio.take_calls();

        h.supervisor.on_retry_due(stale[0]);
        assert!(h.radio.calls().is_empty());
        assert_eq!(h.supervisor.state(), SessionState::EnablingNotifications);
    }

    #[test]
    fn test_descriptor_exhaustion_fails() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        h.discovered(vec![sensor_service(0)]);
        for _ in 0..5 {
            h.descriptor(false);
            h.fire_pending();
        }
        h.descriptor(false);
        assert_eq!(
            h.supervisor.failure(),
            Some(&FailureCause::PolicyExhausted(OperationKind::DescriptorWrite))
        );
    }

    #[test]
    fn test_missing_characteristic_is_not_retried() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        let mut service = sensor_service(0);
        service.characteristics.retain(|c| c.uuid != CONTROL_CHAR_UUID);
        h.discovered(vec![service]);

        assert_eq!(h.supervisor.state(), SessionState::Failed);
        assert!(matches!(
            h.supervisor.failure(),
            Some(FailureCause::ProfileMismatch(_))
        ));
        assert!(h.supervisor.take_pending_retries().is_empty());
    }

    #[test]
    fn test_missing_service_is_profile_mismatch() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        h.discovered(Vec::new());
        assert!(matches!(
            h.supervisor.failure(),
            Some(FailureCause::ProfileMismatch(_))
        ));
    }

    #[test]
    fn test_failed_is_terminal_until_reset() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.advertise();
        h.connected();
        h.discovered(Vec::new());
        h.drain();

        h.disconnected();
        h.advertise();
        h.supervisor.start_scan();
        assert_eq!(h.supervisor.state(), SessionState::Failed);
        assert!(h.states().is_empty());

        h.supervisor.reset();
        assert_eq!(h.supervisor.state(), SessionState::Idle);
        h.supervisor.start_scan();
        assert_eq!(h.supervisor.state(), SessionState::Scanning);
    }

    #[test]
    fn test_notifications_become_samples() {
        let mut h = Harness::new();
        h.to_ready();
        h.drain();

        for raw in [
            &b"120,0.01,9.81,0.02,0.1,0.0,-0.1"[..],
            b"121,0.01",
            b"122,-,9.81,0.02,0.1,0.0,-0.1",
            b"123,1,2,3,4,5,6",
        ] {
            h.event(TransportEvent::Notification {
                characteristic: DATA_CHAR_UUID,
                value: raw.to_vec(),
            });
        }

        let samples: Vec<Sample> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::Sample(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].elapsed_time_millis, 120);
        assert_eq!(samples[1].elapsed_time_millis, 123);
        assert_eq!(h.supervisor.state(), SessionState::Ready);
    }

    #[test]
    fn test_write_retry_is_independent_of_reconnect() {
        let mut h = Harness::new();
        h.to_ready();
        let (request, mut reply) = CommandRequest::with_reply(vec![0x00]);
        h.supervisor.write_control(request);

        h.event(TransportEvent::CharacteristicWritten {
            characteristic: CONTROL_CHAR_UUID,
            success: false,
        });
        assert_eq!(h.supervisor.retry_count(OperationKind::CharacteristicWrite), 1);
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 0);
        h.fire_pending();

        h.event(TransportEvent::CharacteristicWritten {
            characteristic: CONTROL_CHAR_UUID,
            success: true,
        });
        assert_eq!(reply.try_recv().unwrap(), CommandOutcome::Written);
        assert_eq!(h.supervisor.retry_count(OperationKind::CharacteristicWrite), 0);
        assert_eq!(
            h.radio
                .count(|c| *c == TransportCall::Write(CONTROL_CHAR_UUID, vec![0x00])),
            2
        );
    }

    #[test]
    fn test_write_exhaustion_reports_failure() {
        let mut h = Harness::new();
        h.to_ready();
        let (request, mut reply) = CommandRequest::with_reply(vec![0x01]);
        h.supervisor.write_control(request);
        for _ in 0..5 {
            h.event(TransportEvent::CharacteristicWritten {
                characteristic: CONTROL_CHAR_UUID,
                success: false,
            });
            h.fire_pending();
        }
        h.event(TransportEvent::CharacteristicWritten {
            characteristic: CONTROL_CHAR_UUID,
            success: false,
        });
        assert_eq!(reply.try_recv().unwrap(), CommandOutcome::RetriesExhausted);
        // The session itself is unaffected
        assert_eq!(h.supervisor.state(), SessionState::Ready);
    }

    #[test]
    fn test_commands_are_written_in_order() {
        let mut h = Harness::new();
        h.to_ready();
        h.radio.take_calls();
        h.supervisor.write_control(CommandRequest::new(vec![0x00]));
        h.supervisor.write_control(CommandRequest::new(vec![0x01]));
        assert_eq!(
            h.radio.calls(),
            vec![TransportCall::Write(CONTROL_CHAR_UUID, vec![0x00])]
        );
        h.event(TransportEvent::CharacteristicWritten {
            characteristic: CONTROL_CHAR_UUID,
            success: true,
        });
        assert_eq!(
            h.radio.calls(),
            vec![
                TransportCall::Write(CONTROL_CHAR_UUID, vec![0x00]),
                TransportCall::Write(CONTROL_CHAR_UUID, vec![0x01]),
            ]
        );
    }

    #[test]
    fn test_command_when_not_ready() {
        let mut h = Harness::new();
        let (request, mut reply) = CommandRequest::with_reply(vec![0x00]);
        h.supervisor.write_control(request);
        assert_eq!(reply.try_recv().unwrap(), CommandOutcome::NotReady);
        assert!(h.radio.calls().is_empty());
    }

    #[test]
    fn test_disconnect_fails_pending_commands() {
        let mut h = Harness::new();
        h.to_ready();
        let (request, mut reply) = CommandRequest::with_reply(vec![0x00]);
        h.supervisor.write_control(request);
        h.disconnected();
        assert_eq!(reply.try_recv().unwrap(), CommandOutcome::ConnectionLost);
    }

    #[test]
    fn test_read_failure_retries_and_publishes_value() {
        let mut h = Harness::new();
        h.to_ready();
        h.event(TransportEvent::CharacteristicRead {
            characteristic: CONTROL_CHAR_UUID,
            success: false,
            value: Vec::new(),
        });
        assert_eq!(h.supervisor.retry_count(OperationKind::CharacteristicRead), 1);
        assert_eq!(h.supervisor.retry_count(OperationKind::DescriptorWrite), 0);
        h.fire_pending();
        h.event(TransportEvent::CharacteristicRead {
            characteristic: CONTROL_CHAR_UUID,
            success: true,
            value: vec![0x01],
        });
        assert_eq!(h.supervisor.retry_count(OperationKind::CharacteristicRead), 0);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, AppEvent::ControlValue(v) if v == &vec![0x01])));
    }

    #[test]
    fn test_stale_timer_after_manual_disconnect() {
        let mut h = Harness::new();
        h.to_ready();
        h.disconnected();
        let retries = h.supervisor.take_pending_retries();
        assert_eq!(retries.len(), 1);

        h.supervisor.disconnect();
        assert_eq!(h.supervisor.state(), SessionState::Idle);
        h.radio.take_calls();

        h.supervisor.on_retry_due(retries[0]);
        assert_eq!(h.supervisor.state(), SessionState::Idle);
        assert!(h.radio.calls().is_empty());
    }

    #[test]
    fn test_timer_rechecks_state() {
        let mut h = Harness::new();
        h.to_ready();
        h.disconnected();
        let retries = h.supervisor.take_pending_retries();
        h.supervisor.on_retry_due(retries[0]);
        assert_eq!(h.supervisor.state(), SessionState::Connecting);

        // Same timer firing twice must not start a second attempt
        h.supervisor.on_retry_due(retries[0]);
        assert_eq!(
            h.radio.count(|c| matches!(c, TransportCall::Connect { .. })),
            2
        );
    }

    #[test]
    fn test_rejected_connect_counts_as_failure() {
        let mut h = Harness::new();
        h.radio.reject_connects(1);
        h.supervisor.start_scan();
        h.advertise();
        assert_eq!(h.supervisor.state(), SessionState::Disconnected);
        assert_eq!(h.supervisor.retry_count(OperationKind::Reconnect), 1);
        h.fire_pending();
        assert_eq!(h.supervisor.state(), SessionState::Connecting);
    }

    #[test]
    fn test_scan_failure_returns_to_idle() {
        let mut h = Harness::new();
        h.supervisor.start_scan();
        h.event(TransportEvent::ScanFailed { code: 2 });
        assert_eq!(h.supervisor.state(), SessionState::Idle);

        h.radio.reject_scan(true);
        h.supervisor.start_scan();
        assert_eq!(h.supervisor.state(), SessionState::Idle);
    }

    #[test]
    fn test_stop_scan_keeps_established_link() {
        let mut h = Harness::new();
        h.to_ready();
        h.supervisor.stop_scan();
        assert_eq!(h.supervisor.state(), SessionState::Ready);
    }
}
