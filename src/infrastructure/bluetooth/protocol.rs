//! Sensor Board Protocol
//!
//! GATT identifiers, control opcodes and the text frame format streamed by
//! the IMU characteristic.

use crate::domain::models::Sample;
use thiserror::Error;
use uuid::Uuid;

/// Primary service advertised by the sensor board
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x88888888_4abd_ba0d_b7c6_ff0a00200021);

/// Control characteristic - mode commands are written here
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x88888888_4abd_ba0d_b7c6_ff0a00200022);

/// Accelerometer/gyroscope characteristic - frames arrive as notifications
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x88888888_4abd_ba0d_b7c6_ff0a00200023);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// MTU requested right after connecting
pub const REQUESTED_MTU: u16 = 40;

/// Field delimiter inside a frame
pub const FIELD_DELIMITER: char = ',';

/// Token the firmware sends in place of an invalid reading
pub const SENTINEL_TOKEN: &str = "-";

/// elapsed time + 3 accel + 3 gyro
pub const REQUIRED_FIELDS: usize = 7;

/// Control commands understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start streaming
    Enable,
    /// Stop streaming
    Disable,
}

impl ControlCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Enable => &[0x00],
            Self::Disable => &[0x01],
        }
    }
}

/// Why a notification payload did not produce a [`Sample`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameRejection {
    #[error("empty frame")]
    EmptyFrame,

    #[error("incomplete frame: {found} of 7 fields")]
    IncompleteFrame { found: usize },

    #[error("invalid reading sentinel in field {field}")]
    SentinelValue { field: usize },

    #[error("malformed number in field {field}: {token:?}")]
    MalformedNumber { field: usize, token: String },
}

/// Decode one notification payload
///
/// # Frame Structure
///
/// ```text
/// <elapsed_ms>,<accel_x>,<accel_y>,<accel_z>,<gyro_x>,<gyro_y>,<gyro_z>
/// ```
///
/// UTF-8 text, surrounding whitespace ignored, empty tokens from repeated
/// delimiters dropped. Tokens past the seventh are ignored.
pub fn decode_frame(raw: &[u8]) -> Result<Sample, FrameRejection> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(FrameRejection::EmptyFrame);
    }

    let tokens: Vec<&str> = text
        .split(FIELD_DELIMITER)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.len() < REQUIRED_FIELDS {
        return Err(FrameRejection::IncompleteFrame {
            found: tokens.len(),
        });
    }

    if let Some(field) = tokens.iter().position(|t| *t == SENTINEL_TOKEN) {
        return Err(FrameRejection::SentinelValue { field });
    }

    let elapsed_time_millis =
        tokens[0]
            .parse::<i64>()
            .map_err(|_| FrameRejection::MalformedNumber {
                field: 0,
                token: tokens[0].to_string(),
            })?;

    let mut axes = [0f32; REQUIRED_FIELDS - 1];
    for (i, slot) in axes.iter_mut().enumerate() {
        let field = i + 1;
        *slot = parse_axis(field, tokens[field])?;
    }

    Ok(Sample {
        elapsed_time_millis,
        accel_x: axes[0],
        accel_y: axes[1],
        accel_z: axes[2],
        gyro_x: axes[3],
        gyro_y: axes[4],
        gyro_z: axes[5],
    })
}

fn parse_axis(field: usize, token: &str) -> Result<f32, FrameRejection> {
    match token.parse::<f32>() {
        // "NaN"/"inf" parse as floats but are never sent by the firmware
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(FrameRejection::MalformedNumber {
            field,
            token: token.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scenario_frame() {
        let sample = decode_frame(b"120,0.01,9.81,0.02,0.1,0.0,-0.1").unwrap();
        assert_eq!(
            sample,
            Sample {
                elapsed_time_millis: 120,
                accel_x: 0.01,
                accel_y: 9.81,
                accel_z: 0.02,
                gyro_x: 0.1,
                gyro_y: 0.0,
                gyro_z: -0.1,
            }
        );
    }

    #[test]
    fn test_sentinel_rejected() {
        assert_eq!(
            decode_frame(b"120,-,9.81,0.02,0.1,0.0,-0.1"),
            Err(FrameRejection::SentinelValue { field: 1 })
        );
        assert_eq!(
            decode_frame(b"120,0.01,9.81,0.02,0.1,0.0,-"),
            Err(FrameRejection::SentinelValue { field: 6 })
        );
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(decode_frame(b""), Err(FrameRejection::EmptyFrame));
        assert_eq!(decode_frame(b"  \r\n"), Err(FrameRejection::EmptyFrame));
    }

    #[test]
    fn test_short_frames_are_incomplete() {
        let partials: [&[u8]; 4] = [
            b"120",
            b"120,0.01,9.81",
            b"120,0.01,9.81,0.02,0.1,0.0",
            b",,,120,,0.01,,",
        ];
        for raw in partials {
            assert!(
                matches!(decode_frame(raw), Err(FrameRejection::IncompleteFrame { .. })),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
        // Sentinel inside a short frame still reports the short frame
        assert_eq!(
            decode_frame(b"120,-,9.81"),
            Err(FrameRejection::IncompleteFrame { found: 3 })
        );
    }

    #[test]
    fn test_repeated_delimiters_and_trailing_newline() {
        let sample = decode_frame(b"  7,,1.5,2.5,,3.5,4.5,5.5,6.5\n").unwrap();
        assert_eq!(sample.elapsed_time_millis, 7);
        assert_eq!(sample.accel_x, 1.5);
        assert_eq!(sample.gyro_z, 6.5);
    }

    #[test]
    fn test_malformed_numbers() {
        assert_eq!(
            decode_frame(b"12.5,0,0,0,0,0,0"),
            Err(FrameRejection::MalformedNumber {
                field: 0,
                token: "12.5".to_string()
            })
        );
        assert_eq!(
            decode_frame(b"12,0,0,abc,0,0,0"),
            Err(FrameRejection::MalformedNumber {
                field: 3,
                token: "abc".to_string()
            })
        );
        assert!(matches!(
            decode_frame(b"12,0,0,0,NaN,0,0"),
            Err(FrameRejection::MalformedNumber { field: 4, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_never_panics() {
        let result = decode_frame(&[0xFF, 0xFE, b',', b'1']);
        assert!(result.is_err());
    }

    #[test]
    fn test_parsed_fields_match_tokens() {
        let frames = [
            (-5i64, [1.0f32, -2.25, 3.5, 1e-3, 123.456, -0.0]),
            (9_000_000_000, [0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
        ];
        for (elapsed, axes) in frames {
            let raw = format!(
                "{},{},{},{},{},{},{}",
                elapsed, axes[0], axes[1], axes[2], axes[3], axes[4], axes[5]
            );
            let sample = decode_frame(raw.as_bytes()).unwrap();
            assert_eq!(sample.elapsed_time_millis, elapsed);
            assert_eq!(
                [
                    sample.accel_x,
                    sample.accel_y,
                    sample.accel_z,
                    sample.gyro_x,
                    sample.gyro_y,
                    sample.gyro_z
                ],
                axes
            );
        }
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(ControlCommand::Enable.as_bytes(), &[0x00]);
        assert_eq!(ControlCommand::Disable.as_bytes(), &[0x01]);
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "88888888-4abd-ba0d-b7c6-ff0a00200021"
        );
        assert_eq!(
            CCCD_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
