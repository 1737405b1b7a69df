//! Activity supervision and status events
//!
//! Long-running commands (timed attacks, beacon spam, scans, host scripts)
//! run as tokio tasks. At most one runs at a time; it holds the device mode
//! through a [`ModeLease`] and is cancelled through a watch channel.

use crate::protocol::{OutboundMessage, ResponseEnvelope, Status};
use crate::state::{DeviceMode, ModeLease};
use crate::{MctError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Fire-and-forget status output (the device display)
pub trait StatusDisplay: Send + Sync {
    fn show(&self, text: &str);

    fn name(&self) -> &str;
}

/// Display that writes status lines to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&self, text: &str) {
        log::info!("[display] {}", text);
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Kind of supervised activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Scan,
    Deauth,
    BeaconSpam,
    Script,
}

impl ActivityKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scan => "WiFi scan",
            Self::Deauth => "Deauth attack",
            Self::BeaconSpam => "Beacon spam",
            Self::Script => "Script",
        }
    }
}

/// How an activity ended
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// Finished; carries summary fields for the notification
    Completed(Value),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

impl ActivityOutcome {
    fn state(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Description of a running activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub command: String,
    pub mode: DeviceMode,
    pub started_at: DateTime<Utc>,
}

/// Activity statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

/// Cancellation signal observed by a worker
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

struct RunningActivity {
    info: ActivityInfo,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<RunningActivity>>>;

/// Single-slot activity supervisor
pub struct ActivityManager {
    slot: Slot,
    stats: Arc<Mutex<ActivityStats>>,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
    display: Arc<dyn StatusDisplay>,
}

impl std::fmt::Debug for ActivityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityManager")
            .field("current", &self.current())
            .field("display", &self.display.name())
            .finish()
    }
}

impl ActivityManager {
    pub fn new(outbox: mpsc::UnboundedSender<OutboundMessage>, display: Arc<dyn StatusDisplay>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(ActivityStats::default())),
            outbox,
            display,
        }
    }

    pub fn display(&self) -> &Arc<dyn StatusDisplay> {
        &self.display
    }

    pub fn current(&self) -> Option<ActivityInfo> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|running| running.info.clone()))
    }

    pub fn get_stats(&self) -> ActivityStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Run `work` as a supervised task holding `lease`. When `notify` is
    /// set, the outcome is reported on the status channel.
    pub fn spawn<F, Fut>(
        &self,
        kind: ActivityKind,
        command: &str,
        lease: ModeLease,
        notify: bool,
        work: F,
    ) -> Result<ActivityInfo>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ActivityOutcome> + Send + 'static,
    {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| MctError::Busy("Activity slot unavailable".to_string()))?;
        if slot.is_some() {
            return Err(MctError::Busy("Device busy".to_string()));
        }

        let info = ActivityInfo {
            id: Uuid::new_v4(),
            kind,
            command: command.to_string(),
            mode: lease.mode(),
            started_at: Utc::now(),
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let job = work(CancelToken(cancel_rx));

        let task_info = info.clone();
        let task_slot = Arc::clone(&self.slot);
        let stats = Arc::clone(&self.stats);
        let outbox = self.outbox.clone();
        let display = Arc::clone(&self.display);

        display.show(&format!("{} running", kind.label()));
        log::info!("Activity {} ({:?}) started", info.id, kind);

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = job.await;
            Self::finish(&task_info, &outcome, started.elapsed(), &stats, &outbox, &*display, notify);

            if let Ok(mut slot) = task_slot.lock() {
                if slot.as_ref().map(|r| r.info.id) == Some(task_info.id) {
                    *slot = None;
                }
            }
            drop(lease);
        });

        if let Ok(mut stats) = self.stats.lock() {
            stats.started += 1;
        }
        *slot = Some(RunningActivity {
            info: info.clone(),
            cancel,
            handle,
        });

        Ok(info)
    }

    fn finish(
        info: &ActivityInfo,
        outcome: &ActivityOutcome,
        elapsed: Duration,
        stats: &Mutex<ActivityStats>,
        outbox: &mpsc::UnboundedSender<OutboundMessage>,
        display: &dyn StatusDisplay,
        notify: bool,
    ) {
        if let Ok(mut stats) = stats.lock() {
            match outcome {
                ActivityOutcome::Completed(_) => stats.completed += 1,
                ActivityOutcome::Failed(_) => stats.failed += 1,
                ActivityOutcome::TimedOut(_) => stats.timed_out += 1,
                ActivityOutcome::Cancelled => stats.cancelled += 1,
            }
        }

        log::info!(
            "Activity {} ({:?}) {} after {} ms",
            info.id,
            info.kind,
            outcome.state(),
            elapsed.as_millis()
        );
        display.show(&format!("{} {}", info.kind.label(), outcome.state()));

        if !notify {
            return;
        }

        let mut data = json!({
            "activity": info.id.to_string(),
            "kind": info.kind,
            "state": outcome.state(),
            "duration_ms": elapsed.as_millis() as u64,
        });
        let (status, error) = match outcome {
            ActivityOutcome::Completed(summary) => {
                if let (Some(target), Some(extra)) = (data.as_object_mut(), summary.as_object()) {
                    for (key, value) in extra {
                        target.insert(key.clone(), value.clone());
                    }
                }
                (Status::Success, None)
            }
            ActivityOutcome::Cancelled => (Status::Success, None),
            ActivityOutcome::Failed(message) => (Status::Error, Some(message.clone())),
            ActivityOutcome::TimedOut(message) => (Status::Timeout, Some(message.clone())),
        };

        let mut envelope = ResponseEnvelope::notification(&info.command, status, data);
        if let Some(message) = error {
            envelope = envelope.with_error(message);
        }
        match envelope.encode() {
            Ok(bytes) => {
                if outbox.send(OutboundMessage::Notify(bytes)).is_err() {
                    log::warn!("Outbox closed, dropping completion of activity {}", info.id);
                }
            }
            Err(e) => log::error!("Failed to encode activity notification: {}", e),
        }
    }

    /// Cancel the running activity if its kind is one of `kinds` and wait up
    /// to `grace` for it to wind down before aborting it.
    pub async fn stop(&self, kinds: &[ActivityKind], grace: Duration) -> Option<ActivityInfo> {
        let running = {
            let mut slot = self.slot.lock().ok()?;
            let matches = slot
                .as_ref()
                .map_or(false, |running| kinds.contains(&running.info.kind));
            if matches {
                slot.take()
            } else {
                None
            }
        }?;

        let RunningActivity {
            info,
            cancel,
            mut handle,
        } = running;
        if cancel.send(true).is_err() {
            log::debug!("Activity {} already finished", info.id);
        }

        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            log::warn!("Activity {} did not stop within {:?}, aborting", info.id, grace);
            handle.abort();
            let _ = handle.await;
        }
        Some(info)
    }

    /// Abort whatever is running
    pub async fn shutdown(&self) {
        let all = [
            ActivityKind::Scan,
            ActivityKind::Deauth,
            ActivityKind::BeaconSpam,
            ActivityKind::Script,
        ];
        if let Some(info) = self.stop(&all, Duration::from_millis(500)).await {
            log::info!("Stopped activity {} on shutdown", info.id);
        }
    }
}
