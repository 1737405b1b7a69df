//! Radio driver abstraction
//!
//! The capture engine and frame injector talk to the radio through
//! [`RadioDriver`]. Hardware drivers only accept a free function as the
//! promiscuous receive hook, so the callback type is a plain `fn` pointer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::is_valid_channel;

/// Errors that can occur in radio operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Invalid channel: {channel}")]
    InvalidChannel { channel: u8 },

    #[error("Promiscuous mode unavailable: {message}")]
    PromiscuousUnavailable { message: String },

    #[error("Frame transmission failed: {message}")]
    Transmit { message: String },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Hardware error: {message}")]
    Hardware { message: String },
}

/// Largest frame the radio accepts for injection
pub const MAX_TX_FRAME: usize = 1500;

/// A frame delivered by the radio in promiscuous mode
#[derive(Debug, Clone, Copy)]
pub struct RxFrame<'a> {
    /// Raw 802.11 frame starting at the frame control field
    pub payload: &'a [u8],
    pub channel: u8,
    pub rssi: i8,
}

/// Promiscuous receive hook
pub type RxCallback = fn(&RxFrame<'_>);

/// Radio hardware seam
pub trait RadioDriver: Send + Sync {
    /// Enable or disable promiscuous reception
    fn set_promiscuous(&self, enabled: bool) -> Result<(), RadioError>;

    /// Install (or clear) the receive hook used while promiscuous
    fn set_rx_callback(&self, callback: Option<RxCallback>);

    fn set_channel(&self, channel: u8) -> Result<(), RadioError>;

    fn channel(&self) -> u8;

    /// Transmit a raw 802.11 frame
    fn transmit(&self, frame: &[u8]) -> Result<(), RadioError>;

    /// Time since the radio was brought up
    fn uptime(&self) -> Duration;
}

/// In-process radio used when no hardware is attached and in tests.
///
/// Transmitted frames are recorded, and [`SimRadio::deliver`] feeds a frame
/// to the installed receive hook as the hardware would.
#[derive(Debug)]
pub struct SimRadio {
    booted: Instant,
    promiscuous: AtomicBool,
    channel: AtomicU8,
    callback: Mutex<Option<RxCallback>>,
    transmitted: Mutex<Vec<Vec<u8>>>,
    fail_transmits: AtomicU32,
    refuse_promiscuous: AtomicBool,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            booted: Instant::now(),
            promiscuous: AtomicBool::new(false),
            channel: AtomicU8::new(1),
            callback: Mutex::new(None),
            transmitted: Mutex::new(Vec::new()),
            fail_transmits: AtomicU32::new(0),
            refuse_promiscuous: AtomicBool::new(false),
        }
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Acquire)
    }

    /// Make the next `count` transmissions fail
    pub fn fail_next_transmits(&self, count: u32) {
        self.fail_transmits.store(count, Ordering::Release);
    }

    /// Make `set_promiscuous(true)` fail
    pub fn refuse_promiscuous(&self, refuse: bool) {
        self.refuse_promiscuous.store(refuse, Ordering::Release);
    }

    /// Frames successfully transmitted so far
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.transmitted
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    pub fn clear_transmitted(&self) {
        if let Ok(mut frames) = self.transmitted.lock() {
            frames.clear();
        }
    }

    /// Hand a frame to the receive hook. Returns false when the radio is
    /// not promiscuous or no hook is installed.
    pub fn deliver(&self, payload: &[u8], rssi: i8) -> bool {
        if !self.is_promiscuous() {
            return false;
        }
        let callback = match self.callback.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        };
        match callback {
            Some(cb) => {
                cb(&RxFrame {
                    payload,
                    channel: self.channel(),
                    rssi,
                });
                true
            }
            None => false,
        }
    }
}

impl RadioDriver for SimRadio {
    fn set_promiscuous(&self, enabled: bool) -> Result<(), RadioError> {
        if enabled && self.refuse_promiscuous.load(Ordering::Acquire) {
            return Err(RadioError::PromiscuousUnavailable {
                message: "simulated refusal".to_string(),
            });
        }
        self.promiscuous.store(enabled, Ordering::Release);
        Ok(())
    }

    fn set_rx_callback(&self, callback: Option<RxCallback>) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = callback;
        }
    }

    fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        if !is_valid_channel(channel) {
            return Err(RadioError::InvalidChannel { channel });
        }
        self.channel.store(channel, Ordering::Release);
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.channel.load(Ordering::Acquire)
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > MAX_TX_FRAME {
            return Err(RadioError::FrameTooLarge {
                size: frame.len(),
                max: MAX_TX_FRAME,
            });
        }

        let should_fail = self
            .fail_transmits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RadioError::Transmit {
                message: "simulated failure".to_string(),
            });
        }

        self.transmitted
            .lock()
            .map_err(|_| RadioError::Hardware {
                message: "tx log poisoned".to_string(),
            })?
            .push(frame.to_vec());
        Ok(())
    }

    fn uptime(&self) -> Duration {
        self.booted.elapsed()
    }
}
