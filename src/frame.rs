//! 802.11 frame classification
//!
//! This module reads the frame-control field of raw 802.11 frames and
//! extracts the addressing needed for capture statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{MctError, Result};

/// Minimum length of an 802.11 header carrying three addresses
pub const MIN_ADDRESSED_HEADER_LEN: usize = 24;

/// Offset of address 1 (receiver / destination)
pub const DST_ADDR_OFFSET: usize = 4;

/// Offset of address 2 (transmitter / source)
pub const SRC_ADDR_OFFSET: usize = 10;

/// Management frame subtypes
pub const SUBTYPE_PROBE_REQ: u8 = 0x04;
pub const SUBTYPE_PROBE_RESP: u8 = 0x05;
pub const SUBTYPE_BEACON: u8 = 0x08;
pub const SUBTYPE_DEAUTH: u8 = 0x0C;

/// 802.11 frame type (bits 2-3 of frame control)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Management = 0,
    Control = 1,
    Data = 2,
    Extension = 3,
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Management,
            1 => Self::Control,
            2 => Self::Data,
            _ => Self::Extension,
        }
    }
}

/// Management subtypes the capture engine keeps counters for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementKind {
    Beacon,
    ProbeRequest,
    ProbeResponse,
    Deauthentication,
    Other(u8),
}

impl From<u8> for ManagementKind {
    fn from(subtype: u8) -> Self {
        match subtype {
            SUBTYPE_BEACON => Self::Beacon,
            SUBTYPE_PROBE_REQ => Self::ProbeRequest,
            SUBTYPE_PROBE_RESP => Self::ProbeResponse,
            SUBTYPE_DEAUTH => Self::Deauthentication,
            other => Self::Other(other),
        }
    }
}

/// Decoded frame control field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub raw: u16,
    pub frame_type: FrameType,
    pub subtype: u8,
}

impl FrameControl {
    /// Parse the frame control field from the first two bytes of a frame
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 2 {
            return None;
        }

        let raw = u16::from_le_bytes([frame[0], frame[1]]);
        Some(Self::from_raw(raw))
    }

    pub fn from_raw(raw: u16) -> Self {
        Self {
            raw,
            frame_type: FrameType::from(((raw & 0x000C) >> 2) as u8),
            subtype: ((raw & 0x00F0) >> 4) as u8,
        }
    }

    pub fn management_kind(&self) -> Option<ManagementKind> {
        match self.frame_type {
            FrameType::Management => Some(ManagementKind::from(self.subtype)),
            _ => None,
        }
    }
}

/// MAC address (6 bytes), serialized as `AA:BB:CC:DD:EE:FF`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
    pub const ZERO: MacAddress = MacAddress([0x00; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Read six bytes at `offset`, if the buffer is long enough
    pub fn read_at(buf: &[u8], offset: usize) -> Option<Self> {
        let bytes: [u8; 6] = buf.get(offset..offset + 6)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Locally administered bit of the first octet
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = MctError;

    /// Accepts `AA:BB:CC:DD:EE:FF` or `AA-BB-CC-DD-EE-FF`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(MctError::InvalidParameter(format!(
                "Invalid MAC address '{}'",
                s
            )));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(MctError::InvalidParameter(format!(
                    "Invalid MAC octet '{}'",
                    part
                )));
            }
            bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
                MctError::InvalidParameter(format!("Invalid MAC octet '{}'", part))
            })?;
        }

        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MctError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Per-frame summary produced by the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub frame_type: FrameType,
    pub subtype: u8,
    pub channel: u8,
    pub rssi: i8,
    pub src_mac: Option<MacAddress>,
    pub dst_mac: Option<MacAddress>,
    pub timestamp_ms: u32,
    pub length: u16,
}

impl PacketInfo {
    /// Classify a raw frame. Returns `None` when the frame is too short to
    /// carry a frame control field.
    pub fn classify(frame: &[u8], channel: u8, rssi: i8, timestamp_ms: u32) -> Option<Self> {
        let fc = FrameControl::parse(frame)?;

        let (src_mac, dst_mac) = if frame.len() >= MIN_ADDRESSED_HEADER_LEN {
            (
                MacAddress::read_at(frame, SRC_ADDR_OFFSET),
                MacAddress::read_at(frame, DST_ADDR_OFFSET),
            )
        } else {
            (None, None)
        };

        Some(Self {
            frame_type: fc.frame_type,
            subtype: fc.subtype,
            channel,
            rssi,
            src_mac,
            dst_mac,
            timestamp_ms,
            length: frame.len().min(u16::MAX as usize) as u16,
        })
    }

    pub fn management_kind(&self) -> Option<ManagementKind> {
        match self.frame_type {
            FrameType::Management => Some(ManagementKind::from(self.subtype)),
            _ => None,
        }
    }
}
