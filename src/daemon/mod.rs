//! Device daemon
//!
//! Runtime pieces around the command router: configuration, the control-link
//! transport and storage seams, activity supervision, and the command loop.

pub mod config;
pub mod core;
pub mod event;
pub mod io;

pub use self::core::{DaemonState, Device, DeviceStats};
pub use config::{ConfigManager, DaemonConfig};
pub use event::{ActivityKind, ActivityManager, LogDisplay, StatusDisplay};
pub use io::{ChannelTransport, ControllerLink, FsStorage, Storage, Transport, UdpTransport};

use crate::handlers::DeviceContext;
use crate::host::HostExecutor;
use crate::inject::FrameInjector;
use crate::monitor::{self, CaptureEngine};
use crate::phy::{RadioDriver, RxCallback, SimRadio};
use crate::router::CommandRouter;
use crate::scan::ScanProducer;
use crate::{is_valid_channel, MctError, Result};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Assembles a [`Device`] from its collaborators
#[derive(Default)]
pub struct DeviceBuilder {
    config: Option<DaemonConfig>,
    radio: Option<Arc<dyn RadioDriver>>,
    rx_hook: Option<RxCallback>,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
    executor: Option<Arc<dyn HostExecutor>>,
    scanner: Option<Arc<dyn ScanProducer>>,
    display: Option<Arc<dyn StatusDisplay>>,
}

impl std::fmt::Debug for DeviceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_string()))
            .field("storage", &self.storage.is_some())
            .field("executor", &self.executor.is_some())
            .field("scanner", &self.scanner.is_some())
            .finish()
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DaemonConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Radio to drive; a simulated one when unset
    pub fn with_radio(mut self, radio: Arc<dyn RadioDriver>) -> Self {
        self.radio = Some(radio);
        self
    }

    /// Receive hook handed to the radio. When unset the engine is registered
    /// as the process-wide receive target and the trampoline is used.
    pub fn with_rx_hook(mut self, hook: RxCallback) -> Self {
        self.rx_hook = Some(hook);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
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

    pub fn with_display(mut self, display: Arc<dyn StatusDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn build(self) -> Result<Device> {
        let config = self.config.unwrap_or_default();
        let validation = ConfigManager::new().validate_config(&config)?;
        for warning in &validation.warnings {
            log::warn!("Config: {}", warning);
        }
        if !validation.valid {
            return Err(MctError::Config(validation.errors.join("; ")));
        }

        let transport = self
            .transport
            .ok_or_else(|| MctError::Config("No transport configured".to_string()))?;
        let radio: Arc<dyn RadioDriver> = match self.radio {
            Some(radio) => radio,
            None => Arc::new(SimRadio::new()),
        };
        if is_valid_channel(config.radio.default_channel) {
            radio.set_channel(config.radio.default_channel)?;
        }

        let engine = CaptureEngine::new(Arc::clone(&radio), config.radio.capture_queue_depth)?;
        let engine = match self.rx_hook {
            Some(hook) => Arc::new(engine.with_rx_hook(hook)),
            None => {
                let engine = Arc::new(engine);
                if !monitor::register_global(Arc::clone(&engine)) {
                    log::warn!("A capture engine is already registered; received frames go there");
                }
                engine
            }
        };

        let injector = FrameInjector::new(radio).with_burst(
            config.radio.deauth_burst,
            Duration::from_millis(config.radio.deauth_gap_ms),
        );
        let display = self.display.unwrap_or_else(|| Arc::new(LogDisplay));

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let mut ctx = DeviceContext::new(config.clone(), engine, injector, display, outbox_tx);
        if let Some(storage) = self.storage {
            ctx = ctx.with_storage(storage);
        }
        if let Some(executor) = self.executor {
            ctx = ctx.with_executor(executor);
        }
        if let Some(scanner) = self.scanner {
            ctx = ctx.with_scanner(scanner);
        }

        let router = CommandRouter::with_default_handlers(Arc::new(ctx));
        Ok(Device::new(config, router, transport, outbox_rx))
    }
}
