//! Messages exchanged with the actuator firmware over serial.
//!
//! Each message is one line of JSON. Every request is answered by exactly
//! one response.

use serde::{Deserialize, Serialize};

use crate::FloatType;

/// Version number for the bridge datatypes
pub const BRIDGE_PROTOCOL_VERSION: u16 = 3; // Increment this if you change definitions here

/// A JSON + newline representation of the version response
pub const VERSION_RESPONSE_JSON_NEWLINE: &[u8] = b"{\"VersionResponse\":3}\n";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PanTiltRequest {
    VersionRequest,
    SetTorque(bool),
    /// Both axes start and finish moving together.
    SetAngles {
        pan_deg: FloatType,
        tilt_deg: FloatType,
    },
    ReadAngles,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PanTiltResponse {
    VersionResponse(u16),
    Ack,
    Angles {
        pan_deg: FloatType,
        tilt_deg: FloatType,
    },
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LensRequest {
    VersionRequest,
    /// Relative move in steps
    MoveAxis { channel: u8, steps: i32 },
    SetAbsolutePosition { channel: u8, position: i32 },
    ReadStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LensResponse {
    VersionResponse(u16),
    /// Absolute position of `channel` after a move
    Position { channel: u8, position: i32 },
    Ack,
    Status(LensStatus),
    Error(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LensStatus {
    /// Absolute position per channel
    pub positions: Vec<i32>,
    pub moving: bool,
}

impl LensStatus {
    pub fn position(&self, channel: u8) -> Option<i32> {
        self.positions.get(usize::from(channel)).copied()
    }
}

#[test]
fn test_json_newline_version() -> eyre::Result<()> {
    // Keeps `VERSION_RESPONSE_JSON_NEWLINE` in step with
    // `BRIDGE_PROTOCOL_VERSION` for both devices.
    assert!(VERSION_RESPONSE_JSON_NEWLINE.ends_with(b"\n"));
    let decoded: PanTiltResponse = serde_json::from_slice(VERSION_RESPONSE_JSON_NEWLINE)?;
    assert_eq!(PanTiltResponse::VersionResponse(BRIDGE_PROTOCOL_VERSION), decoded);
    let decoded: LensResponse = serde_json::from_slice(VERSION_RESPONSE_JSON_NEWLINE)?;
    assert_eq!(LensResponse::VersionResponse(BRIDGE_PROTOCOL_VERSION), decoded);
    Ok(())
}

#[test]
fn test_lens_status_position() {
    let status = LensStatus {
        positions: vec![10, 20],
        moving: false,
    };
    assert_eq!(status.position(1), Some(20));
    assert_eq!(status.position(2), None);
}
