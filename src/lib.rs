//! # MCT2032 radio core
//!
//! Command/mode engine and 802.11 radio frame subsystem for the MCT2032
//! handheld. A paired controller sends JSON commands over a short-range
//! control link; the device answers with JSON responses and drives the radio
//! for promiscuous capture, frame injection and PCAP recording.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `frame`: 802.11 frame-control parsing and packet classification
//! - `wire`: PCAP capture-file encoding
//! - `inject`: deauthentication / beacon frame construction and transmission
//! - `phy`: radio driver seam and the simulated radio
//! - `monitor`: promiscuous capture engine, statistics and capture writer
//! - `chunk`: multi-part payload reassembly
//! - `state`: exclusive device mode state machine
//! - `protocol`: command and response envelopes
//! - `router`: command registry and dispatch
//! - `handlers`: command handlers
//! - `scan`, `host`: scan producer and host executor seams
//! - `daemon`: device runtime, transport, configuration and events

pub mod chunk;
pub mod frame;
pub mod handlers;
pub mod host;
pub mod inject;
pub mod monitor;
pub mod phy;
pub mod protocol;
pub mod router;
pub mod scan;
pub mod state;
pub mod wire;

// Daemon modules
pub mod daemon;

// Re-export commonly used types
pub use crate::{
    chunk::{ChunkReassembler, ReassemblyStatus},
    frame::{FrameType, MacAddress, PacketInfo},
    inject::FrameInjector,
    monitor::{CaptureEngine, CaptureStats},
    phy::{RadioDriver, RadioError, RxFrame, SimRadio},
    protocol::{CommandEnvelope, ResponseEnvelope, Status},
    router::CommandRouter,
    state::{DeviceMode, ModeState},
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MctError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("{0} not available")]
    NotAvailable(String),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, MctError>;

// Constants
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_CHANNEL: u8 = 1;
pub const MAX_CHANNEL: u8 = 14;
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_COMMAND_SIZE: usize = 512;

/// Whether `channel` is a valid 2.4 GHz channel number.
pub fn is_valid_channel(channel: u8) -> bool {
    (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel)
}
