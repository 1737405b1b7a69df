//! Capture-file commands
//!
//! Opening and closing a capture waits for the writer thread, so both run on
//! the blocking pool.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_channel, required_str, run_blocking, DeviceContext};
use crate::daemon::io::Storage;
use crate::protocol::ResponseEnvelope;
use crate::router::{CommandHandler, Reply};
use crate::state::DeviceMode;
use crate::{MctError, Result};

/// Delete a capture file whose start failed
fn discard(storage: &dyn Storage, filename: &str) {
    if let Err(e) = storage.remove(filename) {
        log::warn!("Failed to remove {}: {}", filename, e);
    }
}

/// Open `filename` and hand it to the writer. The file does not survive a
/// failure.
fn open_capture(ctx: &DeviceContext, storage: &dyn Storage, filename: &str) -> Result<()> {
    let sink = storage.open_sink(filename)?;
    if let Err(e) = ctx.engine.start_capture(sink) {
        discard(storage, filename);
        return Err(e);
    }
    Ok(())
}

pub struct PcapStart;

impl PcapStart {
    /// Claim the radio for a capture started from idle. Monitoring starts
    /// before any file is created; every failure after the claim undoes it.
    fn start_from_idle(ctx: &DeviceContext, storage: &dyn Storage, filename: &str, channel: u8) -> Result<()> {
        if !ctx.mode.try_enter(DeviceMode::PcapCapture) {
            return Err(MctError::Busy("Device busy".to_string()));
        }

        let started = ctx.engine.start_monitor(channel).and_then(|()| {
            open_capture(ctx, storage, filename).map_err(|e| {
                ctx.engine.stop_monitor();
                e
            })
        });

        if started.is_err() {
            ctx.mode.exit_from(DeviceMode::PcapCapture);
        }
        started
    }

    fn start_while_monitoring(ctx: &DeviceContext, storage: &dyn Storage, filename: &str, channel: u8) -> Result<()> {
        let previous = ctx.engine.channel();
        if channel != 0 {
            ctx.engine.set_channel(channel)?;
        }

        let started = open_capture(ctx, storage, filename);
        if started.is_err() && channel != 0 && channel != previous {
            if let Err(e) = ctx.engine.set_channel(previous) {
                log::warn!("Failed to restore channel {}: {}", previous, e);
            }
        }
        started
    }
}

#[async_trait::async_trait]
impl CommandHandler for PcapStart {
    fn name(&self) -> &'static str {
        "PCAP_START"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let storage = ctx.require_storage()?;
        if ctx.engine.is_capture_active() {
            return Err(MctError::Capture("Capture already active".to_string()));
        }
        let filename = required_str(params, "filename")?.to_string();
        let channel = optional_channel(params)?.unwrap_or(0);

        let worker = Arc::clone(ctx);
        let name = filename.clone();
        run_blocking(move || match worker.mode.current() {
            DeviceMode::Idle => Self::start_from_idle(&worker, storage.as_ref(), &name, channel),
            DeviceMode::Monitoring => {
                Self::start_while_monitoring(&worker, storage.as_ref(), &name, channel)
            }
            _ => Err(MctError::Busy("Device busy".to_string())),
        })
        .await?;

        log::info!("Capture started: {}", filename);
        ctx.display().show(&format!("PCAP {}", filename));
        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({
                "message": "Capture started",
                "filename": filename,
                "channel": ctx.engine.channel(),
            }),
        )))
    }
}

pub struct PcapStop;

#[async_trait::async_trait]
impl CommandHandler for PcapStop {
    fn name(&self) -> &'static str {
        "PCAP_STOP"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        if !ctx.engine.is_capture_active() {
            return Err(MctError::Capture("No capture active".to_string()));
        }

        let worker = Arc::clone(ctx);
        let summary = run_blocking(move || {
            let summary = worker.engine.stop_capture()?;
            if worker.mode.current() == DeviceMode::PcapCapture {
                worker.engine.stop_monitor();
                worker.mode.exit_from(DeviceMode::PcapCapture);
            }
            Ok(summary)
        })
        .await?;

        log::info!(
            "Capture stopped: {} records, {} bytes, {} dropped",
            summary.records,
            summary.bytes,
            summary.dropped
        );
        ctx.display().show("PCAP stopped");

        let mut data = serde_json::to_value(summary)?;
        data["message"] = json!("Capture stopped");
        Ok(Reply::Done(ResponseEnvelope::success(self.name(), data)))
    }
}
