//! GET_STATUS and CLEAR_DATA

use serde_json::{json, Value};
use std::sync::Arc;

use super::DeviceContext;
use crate::protocol::ResponseEnvelope;
use crate::router::{CommandHandler, Reply};
use crate::{Result, FIRMWARE_VERSION};

pub struct GetStatus;

#[async_trait::async_trait]
impl CommandHandler for GetStatus {
    fn name(&self) -> &'static str {
        "GET_STATUS"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        let mode = ctx.mode.current();
        let mut data = json!({
            "device": ctx.config.general.device_name,
            "firmware": FIRMWARE_VERSION,
            "uptime": ctx.started_at.elapsed().as_millis() as u64,
            "mode": mode as u8,
            "mode_name": mode.name(),
            "storage": ctx.storage.is_some(),
            "executor": ctx.executor.is_some(),
            "scanner": ctx.scanner.is_some(),
            "networks_cached": ctx.cached_networks(),
        });

        if let Some(activity) = ctx.activities.current() {
            data["activity"] = serde_json::to_value(activity)?;
        }

        // flatten the capture snapshot into the top level
        if let (Some(target), Value::Object(stats)) =
            (data.as_object_mut(), serde_json::to_value(ctx.engine.stats())?)
        {
            target.extend(stats);
        }

        Ok(Reply::Done(ResponseEnvelope::success(self.name(), data)))
    }
}

pub struct ClearData;

#[async_trait::async_trait]
impl CommandHandler for ClearData {
    fn name(&self) -> &'static str {
        "CLEAR_DATA"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        let cleared = match ctx.scan_cache.lock() {
            Ok(mut cache) => {
                let n = cache.len();
                cache.clear();
                n
            }
            Err(_) => 0,
        };
        log::info!("Cleared {} cached networks", cleared);

        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({ "message": "Data cleared", "cleared": cleared }),
        )))
    }
}
