//! Promiscuous monitor commands

use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_channel, run_blocking, DeviceContext};
use crate::protocol::ResponseEnvelope;
use crate::router::{CommandHandler, Reply};
use crate::state::DeviceMode;
use crate::{MctError, Result};

fn not_monitoring() -> MctError {
    MctError::Protocol("Not in monitor mode".to_string())
}

fn require_monitoring(ctx: &DeviceContext) -> Result<()> {
    if ctx.mode.current().is_monitoring() && ctx.engine.is_monitoring() {
        Ok(())
    } else {
        Err(not_monitoring())
    }
}

pub struct MonitorStart;

#[async_trait::async_trait]
impl CommandHandler for MonitorStart {
    fn name(&self) -> &'static str {
        "MONITOR_START"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let channel = optional_channel(params)?.unwrap_or(0);

        if !ctx.mode.try_enter(DeviceMode::Monitoring) {
            return Err(MctError::Busy("Device busy".to_string()));
        }
        if let Err(e) = ctx.engine.start_monitor(channel) {
            ctx.mode.exit_from(DeviceMode::Monitoring);
            return Err(e);
        }

        let channel = ctx.engine.channel();
        ctx.display().show(&format!("Monitoring ch {}", channel));
        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({ "message": "Monitor mode started", "channel": channel }),
        )))
    }
}

pub struct MonitorStop;

#[async_trait::async_trait]
impl CommandHandler for MonitorStop {
    fn name(&self) -> &'static str {
        "MONITOR_STOP"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        let mode = ctx.mode.current();
        if !mode.is_monitoring() {
            return Err(not_monitoring());
        }

        // closing an open capture waits on the writer
        let worker = Arc::clone(ctx);
        let stats = run_blocking(move || Ok(worker.engine.stop_monitor())).await?;
        ctx.mode.exit_from(mode);
        ctx.display().show("Monitor stopped");

        let mut data = serde_json::to_value(&stats)?;
        data["message"] = json!("Monitor mode stopped");
        Ok(Reply::Done(ResponseEnvelope::success(self.name(), data)))
    }
}

pub struct SetChannel;

#[async_trait::async_trait]
impl CommandHandler for SetChannel {
    fn name(&self) -> &'static str {
        "SET_CHANNEL"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let channel = optional_channel(params)?
            .ok_or_else(|| MctError::InvalidParameter("Invalid channel".to_string()))?;
        require_monitoring(ctx)?;

        ctx.engine.set_channel(channel)?;
        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({ "channel": channel }),
        )))
    }
}

pub struct ChannelHop;

#[async_trait::async_trait]
impl CommandHandler for ChannelHop {
    fn name(&self) -> &'static str {
        "CHANNEL_HOP"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        require_monitoring(ctx)?;

        let channel = ctx.engine.hop_channel()?;
        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({ "channel": channel }),
        )))
    }
}
