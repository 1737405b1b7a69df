//! Command handlers
//!
//! Each handler owns the admission rules for its command: mode checks,
//! collaborator availability and parameter validation all happen before any
//! state changes.

pub mod attack;
pub mod capture;
pub mod monitor;
pub mod scan;
pub mod script;
pub mod status;

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::chunk::ChunkReassembler;
use crate::daemon::config::DaemonConfig;
use crate::daemon::event::{ActivityManager, StatusDisplay};
use crate::daemon::io::Storage;
use crate::frame::MacAddress;
use crate::host::HostExecutor;
use crate::inject::FrameInjector;
use crate::monitor::CaptureEngine;
use crate::protocol::OutboundMessage;
use crate::router::CommandHandler;
use crate::scan::{NetworkInfo, ScanProducer};
use crate::state::ModeState;
use crate::{is_valid_channel, MctError, Result};

/// How long a stop command waits for a worker before aborting it
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Everything a handler may touch
pub struct DeviceContext {
    pub config: DaemonConfig,
    pub mode: Arc<ModeState>,
    pub engine: Arc<CaptureEngine>,
    pub injector: FrameInjector,
    pub reassembler: Mutex<ChunkReassembler>,
    pub storage: Option<Arc<dyn Storage>>,
    pub executor: Option<Arc<dyn HostExecutor>>,
    pub scanner: Option<Arc<dyn ScanProducer>>,
    pub activities: ActivityManager,
    pub outbox: mpsc::UnboundedSender<OutboundMessage>,
    pub scan_cache: Arc<Mutex<Vec<NetworkInfo>>>,
    pub started_at: Instant,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("mode", &self.mode.current())
            .field("engine", &self.engine)
            .field("storage", &self.storage.as_ref().map(|s| s.name().to_string()))
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .field("scanner", &self.scanner.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl DeviceContext {
    pub fn new(
        config: DaemonConfig,
        engine: Arc<CaptureEngine>,
        injector: FrameInjector,
        display: Arc<dyn StatusDisplay>,
        outbox: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let reassembler = ChunkReassembler::new(config.timing.chunk_timeout());
        Self {
            config,
            mode: Arc::new(ModeState::new()),
            engine,
            injector,
            reassembler: Mutex::new(reassembler),
            storage: None,
            executor: None,
            scanner: None,
            activities: ActivityManager::new(outbox.clone(), display),
            outbox,
            scan_cache: Arc::new(Mutex::new(Vec::new())),
            started_at: Instant::now(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn HostExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn ScanProducer>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn display(&self) -> &Arc<dyn StatusDisplay> {
        self.activities.display()
    }

    pub fn require_storage(&self) -> Result<Arc<dyn Storage>> {
        self.storage
            .clone()
            .ok_or_else(|| MctError::NotAvailable("Storage".to_string()))
    }

    pub fn require_executor(&self) -> Result<Arc<dyn HostExecutor>> {
        self.executor
            .clone()
            .ok_or_else(|| MctError::NotAvailable("HID".to_string()))
    }

    pub fn require_scanner(&self) -> Result<Arc<dyn ScanProducer>> {
        self.scanner
            .clone()
            .ok_or_else(|| MctError::NotAvailable("Scanner".to_string()))
    }

    pub fn cached_networks(&self) -> usize {
        self.scan_cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

/// Every built-in command
pub fn default_handlers() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(status::GetStatus),
        Arc::new(status::ClearData),
        Arc::new(scan::ScanWifi),
        Arc::new(monitor::MonitorStart),
        Arc::new(monitor::MonitorStop),
        Arc::new(monitor::SetChannel),
        Arc::new(monitor::ChannelHop),
        Arc::new(attack::DeauthAttack),
        Arc::new(attack::BeaconSpam),
        Arc::new(attack::AttackStop),
        Arc::new(capture::PcapStart),
        Arc::new(capture::PcapStop),
        Arc::new(script::DuckyScript),
        Arc::new(script::DuckyChunk),
        Arc::new(script::DuckyStop),
    ]
}

/// Run an engine call that may wait on the capture writer thread. Keeps the
/// command loop's worker free while the writer acknowledges.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MctError::Capture(format!("Capture task failed: {}", e)))?
}

// Parameter helpers

pub(crate) fn optional_u64(params: &Value, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| MctError::InvalidParameter(format!("Invalid {}", key))),
    }
}

pub(crate) fn required_u64(params: &Value, key: &str) -> Result<u64> {
    optional_u64(params, key)?
        .ok_or_else(|| MctError::InvalidParameter(format!("Missing {}", key)))
}

pub(crate) fn optional_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MctError::InvalidParameter(format!("Missing {}", key)))
}

/// Optional channel; zero or absent means "keep current"
pub(crate) fn optional_channel(params: &Value) -> Result<Option<u8>> {
    match optional_u64(params, "channel") {
        Ok(None) | Ok(Some(0)) => Ok(None),
        Ok(Some(channel)) if channel <= u8::MAX as u64 && is_valid_channel(channel as u8) => {
            Ok(Some(channel as u8))
        }
        _ => Err(MctError::InvalidParameter("Invalid channel".to_string())),
    }
}

pub(crate) fn required_mac(params: &Value, key: &str) -> Result<MacAddress> {
    required_str(params, key)?
        .parse()
        .map_err(|_| MctError::InvalidParameter(format!("Invalid {} MAC address", key)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::daemon::event::LogDisplay;
    use crate::phy::{RxFrame, SimRadio};
    use serde_json::json;

    fn noop_hook(_: &RxFrame<'_>) {}

    /// Context over a simulated radio with no collaborators attached
    pub(crate) fn test_context() -> (Arc<DeviceContext>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (ctx, outbox) = bare_context();
        (Arc::new(ctx), outbox)
    }

    pub(crate) fn bare_context() -> (DeviceContext, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (radio, ctx, outbox) = context_with_radio();
        drop(radio);
        (ctx, outbox)
    }

    pub(crate) fn context_with_radio() -> (
        Arc<SimRadio>,
        DeviceContext,
        mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        let radio = Arc::new(SimRadio::new());
        let engine = CaptureEngine::new(radio.clone(), 64)
            .unwrap()
            .with_rx_hook(noop_hook);
        let injector = FrameInjector::new(radio.clone()).with_burst(5, Duration::ZERO);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = DaemonConfig::default();
        config.timing.scan_poll_ms = 5;
        config.timing.deauth_interval_ms = 5;
        config.timing.beacon_interval_ms = 1;
        let ctx = DeviceContext::new(config, Arc::new(engine), injector, Arc::new(LogDisplay), tx);
        (radio, ctx, rx)
    }

    pub(crate) fn decode(message: &OutboundMessage) -> Value {
        serde_json::from_slice(message.bytes()).unwrap()
    }

    #[test]
    fn test_param_helpers() {
        let params = json!({
            "channel": 6,
            "bad_channel": 20,
            "ap": "AA:BB:CC:DD:EE:FF",
            "flag": true,
            "text": ""
        });
        assert_eq!(optional_channel(&params).unwrap(), Some(6));
        assert_eq!(optional_channel(&json!({})).unwrap(), None);
        assert_eq!(optional_channel(&json!({"channel": 0})).unwrap(), None);
        assert!(optional_channel(&json!({"channel": 15})).is_err());
        assert!(optional_channel(&json!({"channel": "six"})).is_err());
        assert_eq!(required_mac(&params, "ap").unwrap(), MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        assert!(required_mac(&params, "target").is_err());
        assert!(optional_bool(&params, "flag"));
        assert!(!optional_bool(&params, "missing"));
        assert!(required_str(&params, "text").is_err());
        assert!(required_u64(&params, "missing").is_err());
    }

    #[test]
    fn test_missing_collaborators() {
        let (ctx, _rx) = test_context();
        assert_eq!(
            ctx.require_storage().err().map(|e| e.to_string()),
            Some("Storage not available".to_string())
        );
        assert!(ctx.require_executor().is_err());
        assert!(ctx.require_scanner().is_err());
    }
}
