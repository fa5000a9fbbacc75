//! BLE Scanner Module
//!
//! Watches advertisements for the sensor board's service and hands the first
//! match to the connection supervisor.

use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::transport::{Advertisement, GattTransport, TransportError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One scan at a time, one match per scan
pub struct ScanSession {
    target: Uuid,
    scanning: bool,
}

impl ScanSession {
    pub fn new(target: Uuid) -> Self {
        Self {
            target,
            scanning: false,
        }
    }

    /// Start scanning for the target service
    ///
    /// Calling this while a scan is already running is a no-op. A start
    /// failure is returned once and never retried here.
    pub fn start(&mut self, radio: &mut dyn GattTransport) -> Result<(), TransportError> {
        if self.scanning {
            debug!("Scan already running");
            return Ok(());
        }

        info!("Starting BLE scan for service UUID: {}", self.target);
        radio.start_scan(self.target).inspect_err(|e| {
            warn!("Scan failed to start: {}", e);
        })?;
        self.scanning = true;
        Ok(())
    }

    /// Stop scanning; safe to call when no scan is running
    pub fn stop(&mut self, radio: &mut dyn GattTransport) {
        if self.scanning {
            info!("Stopping BLE scan...");
            radio.stop_scan();
            self.scanning = false;
        }
    }

    /// Inspect an advertisement. Returns the peripheral on the first match
    /// and stops the scan so no further advertisements are considered.
    pub fn on_advertisement(
        &mut self,
        radio: &mut dyn GattTransport,
        adv: &Advertisement,
    ) -> Option<PeripheralIdentity> {
        if !self.scanning {
            return None;
        }

        for uuid in &adv.service_uuids {
            debug!(
                "Device: {:012X}, UUID: {}, RSSI: {}",
                adv.address, uuid, adv.rssi
            );
        }

        if !adv.service_uuids.contains(&self.target) {
            return None;
        }

        let identity = PeripheralIdentity {
            address: adv.address,
            service: self.target,
        };
        info!(
            "Found sensor board {} ({})",
            identity,
            adv.local_name.as_deref().unwrap_or("Unknown")
        );
        self.stop(radio);
        Some(identity)
    }

    /// The radio aborted the scan on its own
    pub fn on_scan_failed(&mut self, code: i32) {
        warn!("Scan failed with error code {}", code);
        self.scanning = false;
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}
