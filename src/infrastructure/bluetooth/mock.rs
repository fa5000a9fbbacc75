//! In-memory transport for tests.
//!
//! Records every request and lets the test decide which completions to
//! deliver. Clones share state so a test can keep a handle after giving the
//! transport to a supervisor.

use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicRef, GattTransport, TransportError, TransportEvent,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Uuid),
    StopScan,
    Connect { address: u64, auto_connect: bool },
    RequestMtu(u16),
    DiscoverServices,
    EnableNotifications(Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<TransportCall>,
    reject_scan: bool,
    reject_connect: u32,
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            events: None,
        }
    }

    /// Transport whose completions can be pushed through [`MockTransport::emit`]
    pub fn with_events(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Arc::default(),
            events: Some(events),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn reject_scan(&self, reject: bool) {
        self.lock().reject_scan = reject;
    }

    /// Refuse the next `n` connect submissions
    pub fn reject_connects(&self, n: u32) {
        self.lock().reject_connect = n;
    }

    /// Deliver a completion as if the radio produced it
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for MockTransport {
    fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        if self.lock().reject_scan {
            return Err(TransportError::AdapterUnavailable);
        }
        self.record(TransportCall::StartScan(service));
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(TransportCall::StopScan);
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
        auto_connect: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            address: peripheral.address,
            auto_connect,
        });
        let mut state = self.lock();
        if state.reject_connect > 0 {
            state.reject_connect -= 1;
            return Err(TransportError::Rejected("connect refused".to_string()));
        }
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        self.record(TransportCall::RequestMtu(mtu));
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::DiscoverServices);
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::EnableNotifications(characteristic.uuid));
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Read(characteristic.uuid));
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Write(characteristic.uuid, value.to_vec()));
        Ok(())
    }

    fn close(&mut self) {
        self.record(TransportCall::Close);
    }
}
