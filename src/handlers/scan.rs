//! SCAN_WIFI
//!
//! The scan runs as a worker; its result is the command's response, sent
//! through the outbox once the producer finishes (chunked when it does not
//! fit a single message).

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{optional_channel, DeviceContext};
use crate::daemon::event::{ActivityKind, ActivityOutcome, CancelToken};
use crate::protocol::{ItemStream, OutboundMessage, ResponseEnvelope};
use crate::router::{self, CommandHandler, Reply};
use crate::scan::{NetworkInfo, ScanPoll, ScanProducer};
use crate::state::DeviceMode;
use crate::{MctError, Result};

const COMMAND: &str = "SCAN_WIFI";

struct ScanJob {
    scanner: Arc<dyn ScanProducer>,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
    cache: Arc<Mutex<Vec<NetworkInfo>>>,
    ceiling: usize,
    timeout: Duration,
    poll: Duration,
}

impl ScanJob {
    /// Queue one message for the transport. False once the outbox is closed.
    fn send(&self, message: OutboundMessage) -> bool {
        if self.outbox.send(message).is_err() {
            log::warn!("Outbox closed, dropping {} response", COMMAND);
            return false;
        }
        true
    }

    fn respond(&self, response: &ResponseEnvelope) {
        if let Some(message) = router::reply(response) {
            self.send(message);
        }
    }

    fn deliver(&self, networks: Vec<NetworkInfo>) -> ActivityOutcome {
        let count = networks.len();
        let items = networks
            .iter()
            .filter_map(|n| serde_json::to_value(n).ok())
            .collect();
        let stream = ItemStream {
            list_key: "networks",
            item_key: "network",
            items,
            summary: Map::new(),
        };

        let delivered = match stream.encode(COMMAND, self.ceiling) {
            Ok(messages) => messages
                .into_iter()
                .all(|bytes| self.send(OutboundMessage::Reply(bytes))),
            Err(e) => {
                log::error!("Failed to encode scan results: {}", e);
                self.respond(&ResponseEnvelope::error(COMMAND, "Failed to encode results"));
                return ActivityOutcome::Failed(e.to_string());
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            *cache = networks;
        }
        if !delivered {
            return ActivityOutcome::Failed("Controller link closed".to_string());
        }
        log::info!("Scan complete: {} networks", count);
        ActivityOutcome::Completed(serde_json::json!({ "count": count }))
    }

    async fn run(self, mut cancel: CancelToken) -> ActivityOutcome {
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.scanner.poll().await {
                ScanPoll::Complete(networks) => return self.deliver(networks),
                ScanPoll::Failed(message) => {
                    self.respond(&ResponseEnvelope::error(COMMAND, message.as_str()));
                    return ActivityOutcome::Failed(message);
                }
                ScanPoll::Running => {}
            }

            if Instant::now() >= deadline {
                self.respond(&ResponseEnvelope::timeout(COMMAND, "Scan timed out"));
                return ActivityOutcome::TimedOut("Scan timed out".to_string());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = cancel.cancelled() => {
                    self.respond(&ResponseEnvelope::error(COMMAND, "Scan cancelled"));
                    return ActivityOutcome::Cancelled;
                }
            }
        }
    }
}

pub struct ScanWifi;

#[async_trait::async_trait]
impl CommandHandler for ScanWifi {
    fn name(&self) -> &'static str {
        COMMAND
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let scanner = ctx.require_scanner()?;
        let channel = optional_channel(params)?;

        let lease = ctx
            .mode
            .lease(DeviceMode::Scanning)
            .ok_or_else(|| MctError::Busy("Device busy".to_string()))?;
        scanner.start_scan(channel).await?;
        log::info!("WiFi scan started via {}", scanner.name());

        let job = ScanJob {
            scanner,
            outbox: ctx.outbox.clone(),
            cache: Arc::clone(&ctx.scan_cache),
            ceiling: ctx.config.transport.max_message_size,
            timeout: ctx.config.timing.scan_timeout(),
            poll: ctx.config.timing.scan_poll(),
        };
        ctx.activities
            .spawn(ActivityKind::Scan, self.name(), lease, false, move |cancel| job.run(cancel))?;

        Ok(Reply::Deferred)
    }
}
