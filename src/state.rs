//! Device mode state machine
//!
//! The device runs at most one activity at a time. Every activity claims its
//! mode from `Idle` and hands it back when it finishes, fails or is
//! cancelled.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Exclusive device mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceMode {
    /// Nothing running
    Idle = 0,
    /// Passive network scan
    Scanning = 1,
    /// Promiscuous capture
    Monitoring = 2,
    /// Deauthentication attack
    Attacking = 3,
    /// Beacon injection
    BeaconSpam = 4,
    EvilPortal = 5,
    /// Monitor started on behalf of a capture file
    PcapCapture = 6,
    /// Host keystroke script running
    UsbHid = 7,
    HostRecon = 8,
    Exfiltrating = 9,
}

impl Default for DeviceMode {
    fn default() -> Self {
        Self::Idle
    }
}

impl From<u8> for DeviceMode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Monitoring,
            3 => Self::Attacking,
            4 => Self::BeaconSpam,
            5 => Self::EvilPortal,
            6 => Self::PcapCapture,
            7 => Self::UsbHid,
            8 => Self::HostRecon,
            9 => Self::Exfiltrating,
            _ => Self::Idle,
        }
    }
}

impl DeviceMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::Monitoring => "MONITORING",
            Self::Attacking => "ATTACKING",
            Self::BeaconSpam => "BEACON_SPAM",
            Self::EvilPortal => "EVIL_PORTAL",
            Self::PcapCapture => "PCAP_CAPTURE",
            Self::UsbHid => "USB_HID",
            Self::HostRecon => "HOST_RECON",
            Self::Exfiltrating => "EXFILTRATING",
        }
    }

    /// Modes in which the radio is promiscuous
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Self::Monitoring | Self::PcapCapture)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Single-owner device mode
#[derive(Debug, Default)]
pub struct ModeState {
    mode: AtomicU8,
}

impl ModeState {
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(DeviceMode::Idle as u8),
        }
    }

    pub fn current(&self) -> DeviceMode {
        DeviceMode::from(self.mode.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.current() == DeviceMode::Idle
    }

    /// Claim `mode`. Only succeeds from `Idle`; claiming `Idle` itself is
    /// rejected.
    pub fn try_enter(&self, mode: DeviceMode) -> bool {
        if mode == DeviceMode::Idle {
            return false;
        }

        let claimed = self
            .mode
            .compare_exchange(
                DeviceMode::Idle as u8,
                mode as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if claimed {
            log::debug!("Mode: IDLE -> {}", mode);
        }
        claimed
    }

    /// Return to `Idle`. Always legal.
    pub fn exit(&self) {
        let previous = DeviceMode::from(self.mode.swap(DeviceMode::Idle as u8, Ordering::AcqRel));
        if previous != DeviceMode::Idle {
            log::debug!("Mode: {} -> IDLE", previous);
        }
    }

    /// Release `mode` only if it is still the current one
    pub fn exit_from(&self, mode: DeviceMode) -> bool {
        self.mode
            .compare_exchange(
                mode as u8,
                DeviceMode::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim `mode` for the lifetime of the returned lease
    pub fn lease(self: &Arc<Self>, mode: DeviceMode) -> Option<ModeLease> {
        if self.try_enter(mode) {
            Some(ModeLease {
                state: Arc::clone(self),
                mode,
            })
        } else {
            None
        }
    }
}

/// Mode claim released on drop
#[derive(Debug)]
pub struct ModeLease {
    state: Arc<ModeState>,
    mode: DeviceMode,
}

impl ModeLease {
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }
}

impl Drop for ModeLease {
    fn drop(&mut self) {
        if self.state.exit_from(self.mode) {
            log::debug!("Mode lease released: {} -> IDLE", self.mode);
        }
    }
}
