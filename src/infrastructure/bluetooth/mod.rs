//! Bluetooth Module
//!
//! BLE link to the IMU sensor board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │     (event loop: commands, transport events, timers)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!            ┌─────────────────────┐        ┌─────────────┐
//!            │ ConnectionSupervisor│───────▶│ RetryPolicy │
//!            │   (state machine)   │        └─────────────┘
//!            └──┬───────┬───────┬──┘
//!               │       │       │
//!               ▼       ▼       ▼
//!     ┌───────────┐ ┌────────┐ ┌──────────────┐
//!     │ScanSession│ │Protocol│ │ GattTransport│
//!     │           │ │ frames │ │ (WinRT/mock) │
//!     └───────────┘ └────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - identifiers, control opcodes and frame decoding
//! - [`retry`] - bounded constant-delay retry decisions
//! - [`transport`] - radio seam and its completion events
//! - [`scanner`] - advertisement filtering
//! - [`connection`] - session state machine
//! - [`command`] - control write handle for the front end
//! - [`service`] - worker event loop

pub mod command;
pub mod connection;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod retry;
pub mod scanner;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use command::CommandChannel;
pub use service::BluetoothService;
