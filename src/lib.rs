//! BLE link to an IMU sensor board: scanning, a supervised GATT session with
//! bounded retries, frame decoding and CSV export of the samples.

pub mod app;
pub mod domain;
pub mod infrastructure;
