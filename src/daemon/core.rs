//! Device runtime
//!
//! Owns the command loop: inbound messages from the transport are routed one
//! at a time, replies go back through `send`, and worker output queued on the
//! outbox is forwarded as it arrives.

use crate::handlers::run_blocking;
use crate::protocol::{OutboundMessage, ResponseEnvelope};
use crate::router::{self, CommandRouter};
use crate::Result;
use super::config::DaemonConfig;
use super::io::Transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use serde::{Deserialize, Serialize};

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Command loop statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Uptime in seconds
    pub uptime: u64,
    pub commands_received: u64,
    pub commands_rejected: u64,
    pub replies_sent: u64,
    pub notifications_sent: u64,
    pub send_errors: u64,
    pub last_error: Option<String>,
}

/// The device: a router bound to a transport
pub struct Device {
    config: DaemonConfig,
    state: Arc<RwLock<DaemonState>>,
    router: CommandRouter,
    transport: Arc<dyn Transport>,
    outbox: mpsc::UnboundedReceiver<OutboundMessage>,
    stats: Arc<RwLock<DeviceStats>>,
    start_time: std::time::Instant,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("router", &self.router)
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl Device {
    pub fn new(
        config: DaemonConfig,
        router: CommandRouter,
        transport: Arc<dyn Transport>,
        outbox: mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(DaemonState::Initializing)),
            router,
            transport,
            outbox,
            stats: Arc::new(RwLock::new(DeviceStats::default())),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    pub async fn get_state(&self) -> DaemonState {
        *self.state.read().await
    }

    pub async fn get_stats(&self) -> DeviceStats {
        let mut stats = self.stats.read().await.clone();
        stats.uptime = self.start_time.elapsed().as_secs();
        stats
    }

    /// Serve commands until `shutdown` resolves or the transport closes
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        *self.state.write().await = DaemonState::Running;
        log::info!(
            "{} running on {} transport ({} commands)",
            self.config.general.device_name,
            self.transport.name(),
            self.router.commands().len()
        );
        self.router.context().display().show("Ready");

        let heartbeat = Duration::from_millis(self.config.general.heartbeat_interval.max(1));
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                inbound = self.transport.recv() => match inbound {
                    Some(bytes) => self.handle_inbound(&bytes).await,
                    None => {
                        log::info!("Transport closed");
                        break;
                    }
                },
                Some(message) = self.outbox.recv() => self.deliver(message).await,
                _ = ticker.tick() => self.heartbeat(),
            }
        }

        self.stop().await
    }

    async fn handle_inbound(&self, bytes: &[u8]) {
        self.stats.write().await.commands_received += 1;

        let limit = self.config.transport.max_message_size;
        if bytes.len() > limit {
            log::warn!("Dropping {} byte command (limit {})", bytes.len(), limit);
            self.stats.write().await.commands_rejected += 1;
            let response = ResponseEnvelope::error("", "Command too large");
            if let Some(message) = router::reply(&response) {
                self.deliver(message).await;
            }
            return;
        }

        for message in self.router.route(bytes).await {
            self.deliver(message).await;
        }
    }

    async fn deliver(&self, message: OutboundMessage) {
        let (sent, notify) = match &message {
            OutboundMessage::Reply(bytes) => (self.transport.send(bytes).await, false),
            OutboundMessage::Notify(bytes) => (self.transport.notify(bytes).await, true),
        };

        let mut stats = self.stats.write().await;
        match sent {
            Ok(()) if notify => stats.notifications_sent += 1,
            Ok(()) => stats.replies_sent += 1,
            Err(e) => {
                log::warn!("Failed to send message: {}", e);
                stats.send_errors += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }

    fn heartbeat(&self) {
        let ctx = self.router.context();
        log::debug!(
            "Heartbeat - mode: {}, packets: {}, idle: {}ms",
            ctx.mode.current(),
            ctx.engine.stats().total_packets,
            ctx.engine.idle_for().as_millis()
        );
    }

    /// Cancel running work and release the radio
    pub async fn stop(&mut self) -> Result<()> {
        log::info!("Stopping device...");
        *self.state.write().await = DaemonState::Stopping;

        let ctx = self.router.context();
        ctx.activities.shutdown().await;
        // closes any open capture and joins the writer thread
        let engine = Arc::clone(&ctx.engine);
        if let Err(e) = run_blocking(move || {
            engine.shutdown();
            Ok(())
        })
        .await
        {
            log::warn!("Capture engine shutdown failed: {}", e);
        }
        ctx.mode.exit();

        // forward whatever the workers reported on the way out
        while let Ok(message) = self.outbox.try_recv() {
            self.deliver(message).await;
        }

        *self.state.write().await = DaemonState::Stopped;
        log::info!("Device stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::io::{ChannelTransport, ControllerLink};
    use crate::daemon::DeviceBuilder;
    use crate::phy::{RxFrame, SimRadio};
    use crate::state::DeviceMode;
    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn noop_hook(_: &RxFrame<'_>) {}

    fn start() -> (ControllerLink, oneshot::Sender<()>, JoinHandle<Device>) {
        let (transport, link) = ChannelTransport::pair();
        let mut device = DeviceBuilder::new()
            .with_radio(Arc::new(SimRadio::new()))
            .with_rx_hook(noop_hook)
            .with_transport(Arc::new(transport))
            .build()
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            device
                .run(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
            device
        });
        (link, tx, handle)
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let (mut link, tx, handle) = start();

        link.send_command(&json!({"cmd": "GET_STATUS"})).unwrap();
        let reply = link.next_reply().await.unwrap();
        assert_eq!(reply["cmd"], "GET_STATUS");
        assert_eq!(reply["status"], "success");

        link.send_raw(&b"not json"[..]).unwrap();
        let reply = link.next_reply().await.unwrap();
        assert_eq!(reply["error"], "Invalid JSON");

        tx.send(()).unwrap();
        let device = handle.await.unwrap();
        assert_eq!(device.get_state().await, DaemonState::Stopped);
        let stats = device.get_stats().await;
        assert_eq!(stats.commands_received, 2);
        assert_eq!(stats.replies_sent, 2);
    }

    #[tokio::test]
    async fn test_oversized_command_rejected() {
        let (mut link, tx, handle) = start();

        let padding = "x".repeat(600);
        link.send_command(&json!({"cmd": "GET_STATUS", "params": {"pad": padding}}))
            .unwrap();
        let reply = link.next_reply().await.unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "Command too large");

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_output_reaches_transport() {
        let (mut link, tx, handle) = start();

        link.send_command(&json!({
            "cmd": "BEACON_SPAM",
            "params": {"ssids": ["a", "b"], "interval": 1}
        }))
        .unwrap();
        let reply = link.next_reply().await.unwrap();
        assert_eq!(reply["status"], "success");

        let note = link.next_notification().await.unwrap();
        assert_eq!(note["type"], "status");
        assert_eq!(note["cmd"], "BEACON_SPAM");
        assert_eq!(note["data"]["beacons_sent"], 2);

        tx.send(()).unwrap();
        let device = handle.await.unwrap();
        assert_eq!(device.get_stats().await.notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_stop_releases_mode() {
        let (mut link, tx, handle) = start();

        link.send_command(&json!({"cmd": "MONITOR_START", "params": {"channel": 6}}))
            .unwrap();
        assert_eq!(link.next_reply().await.unwrap()["status"], "success");
        link.send_command(&json!({"cmd": "MONITOR_START"})).unwrap();
        assert_eq!(link.next_reply().await.unwrap()["status"], "busy");

        tx.send(()).unwrap();
        let device = handle.await.unwrap();
        let ctx = device.router().context();
        assert_eq!(ctx.mode.current(), DeviceMode::Idle);
        assert!(!ctx.engine.is_monitoring());
    }

    #[tokio::test]
    async fn test_transport_close_ends_loop() {
        let (link, _tx, handle) = start();
        drop(link.close());
        let device = handle.await.unwrap();
        assert_eq!(device.get_state().await, DaemonState::Stopped);
    }
}
