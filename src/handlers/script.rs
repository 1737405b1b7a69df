//! Host keystroke-script commands

use serde_json::{json, Value};
use std::sync::Arc;

use super::{optional_bool, optional_u64, required_str, required_u64, DeviceContext, STOP_GRACE};
use crate::chunk::ReassemblyStatus;
use crate::daemon::event::{ActivityKind, ActivityOutcome};
use crate::protocol::ResponseEnvelope;
use crate::router::{CommandHandler, Reply};
use crate::state::DeviceMode;
use crate::{MctError, Result};

/// Hand `script` to the executor as a supervised worker
fn launch(ctx: &DeviceContext, command: &'static str, script: String) -> Result<Reply> {
    let executor = ctx.require_executor()?;
    let lease = ctx
        .mode
        .lease(DeviceMode::UsbHid)
        .ok_or_else(|| MctError::Busy("Device busy".to_string()))?;

    let length = script.len();
    let lines = script.lines().filter(|l| !l.trim().is_empty()).count();
    let info = ctx.activities.spawn(
        ActivityKind::Script,
        command,
        lease,
        true,
        move |mut cancel| async move {
            tokio::select! {
                result = executor.execute(script) => match result {
                    Ok(()) => ActivityOutcome::Completed(json!({ "lines": lines })),
                    Err(e) => ActivityOutcome::Failed(e.to_string()),
                },
                _ = cancel.cancelled() => ActivityOutcome::Cancelled,
            }
        },
    )?;

    Ok(Reply::Done(ResponseEnvelope::success(
        command,
        json!({
            "message": "Script started",
            "length": length,
            "lines": lines,
            "activity": info.id.to_string(),
        }),
    )))
}

pub struct DuckyScript;

#[async_trait::async_trait]
impl CommandHandler for DuckyScript {
    fn name(&self) -> &'static str {
        "DUCKY_SCRIPT"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        ctx.require_executor()?;
        let script = required_str(params, "script")?;
        launch(ctx, self.name(), script.to_string())
    }
}

pub struct DuckyChunk;

#[async_trait::async_trait]
impl CommandHandler for DuckyChunk {
    fn name(&self) -> &'static str {
        "DUCKY_CHUNK"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply> {
        ctx.require_executor()?;

        let index = u32::try_from(required_u64(params, "chunkIndex")?)
            .map_err(|_| MctError::InvalidParameter("Invalid chunkIndex".to_string()))?;
        let total = u32::try_from(optional_u64(params, "totalChunks")?.unwrap_or(0))
            .map_err(|_| MctError::InvalidParameter("Invalid totalChunks".to_string()))?;
        let data = params
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| MctError::InvalidParameter("Missing data".to_string()))?;
        let is_first = optional_bool(params, "start");
        let is_last = optional_bool(params, "end");

        let status = ctx
            .reassembler
            .lock()
            .map_err(|_| MctError::Protocol("Chunk session unavailable".to_string()))?
            .begin_or_continue(index, total, data.as_bytes(), is_first, is_last);

        match status {
            ReassemblyStatus::InProgress { received, expected } => Ok(Reply::Done(
                ResponseEnvelope::success(
                    self.name(),
                    json!({ "received": received, "expected": expected }),
                ),
            )),
            ReassemblyStatus::Complete(bytes) => {
                let script = String::from_utf8(bytes).map_err(|_| {
                    MctError::InvalidParameter("Script is not valid UTF-8".to_string())
                })?;
                log::info!("Script reassembled: {} bytes", script.len());
                launch(ctx, self.name(), script)
            }
            ReassemblyStatus::TimedOut => {
                Err(MctError::Timeout("Chunk session timed out".to_string()))
            }
            ReassemblyStatus::Rejected(reason) => Err(MctError::InvalidParameter(reason)),
        }
    }
}

pub struct DuckyStop;

#[async_trait::async_trait]
impl CommandHandler for DuckyStop {
    fn name(&self) -> &'static str {
        "DUCKY_STOP"
    }

    async fn handle(&self, ctx: &Arc<DeviceContext>, _params: &Value) -> Result<Reply> {
        let had_session = match ctx.reassembler.lock() {
            Ok(mut reassembler) => {
                let active = reassembler.is_active();
                reassembler.abandon();
                active
            }
            Err(_) => false,
        };

        match ctx.activities.stop(&[ActivityKind::Script], STOP_GRACE).await {
            Some(info) => Ok(Reply::Done(ResponseEnvelope::success(
                self.name(),
                json!({ "message": "Script stopped", "activity": info.id.to_string() }),
            ))),
            None if had_session => Ok(Reply::Done(ResponseEnvelope::success(
                self.name(),
                json!({ "message": "Upload abandoned" }),
            ))),
            None => Err(MctError::Protocol("No script running".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkReassembler;
    use crate::handlers::tests::{decode, test_context};
    use crate::host::{HostExecutor, LogExecutor};
    use crate::protocol::{OutboundMessage, Status};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Executor that records scripts and optionally never finishes
    #[derive(Default)]
    struct Recorder {
        scripts: Mutex<Vec<String>>,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl HostExecutor for Recorder {
        async fn execute(&self, script: String) -> Result<()> {
            self.scripts.lock().unwrap().push(script);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn context(executor: Arc<dyn HostExecutor>) -> (Arc<DeviceContext>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (ctx, rx) = crate::handlers::tests::bare_context();
        (Arc::new(ctx.with_executor(executor)), rx)
    }

    async fn run(handler: &dyn CommandHandler, ctx: &Arc<DeviceContext>, params: Value) -> Result<ResponseEnvelope> {
        match handler.handle(ctx, &params).await? {
            Reply::Done(response) => Ok(response),
            other => panic!("expected a single response, got {:?}", other),
        }
    }

    async fn notification(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, OutboundMessage::Notify(_)));
        decode(&message)
    }

    #[tokio::test]
    async fn test_requires_executor() {
        let (ctx, _rx) = test_context();
        let err = run(&DuckyScript, &ctx, json!({"script": "STRING hi"})).await.unwrap_err();
        assert_eq!(err.to_string(), "HID not available");
        let err = run(&DuckyChunk, &ctx, json!({"chunkIndex": 0, "totalChunks": 1, "data": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MctError::NotAvailable(_)));
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_script_runs_and_notifies() {
        let recorder = Arc::new(Recorder::default());
        let (ctx, mut rx) = context(recorder.clone());

        let started = run(&DuckyScript, &ctx, json!({"script": "STRING hi\nENTER\n"}))
            .await
            .unwrap();
        assert_eq!(started.data.unwrap()["lines"], 2);

        let note = notification(&mut rx).await;
        assert_eq!(note["cmd"], "DUCKY_SCRIPT");
        assert_eq!(note["data"]["state"], "completed");
        assert_eq!(recorder.scripts.lock().unwrap()[0], "STRING hi\nENTER\n");

        for _ in 0..200 {
            if ctx.mode.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_chunked_upload() {
        let recorder = Arc::new(Recorder::default());
        let (ctx, mut rx) = context(recorder.clone());

        let parts = ["STRING ", "hello ", "world\n"];
        for (i, part) in parts.iter().enumerate() {
            let response = run(
                &DuckyChunk,
                &ctx,
                json!({
                    "chunkIndex": i,
                    "totalChunks": parts.len(),
                    "data": part,
                    "start": i == 0,
                    "end": i == parts.len() - 1,
                }),
            )
            .await
            .unwrap();
            assert_eq!(response.status, Status::Success);
            if i + 1 < parts.len() {
                assert_eq!(response.data.unwrap()["received"], i + 1);
            }
        }

        notification(&mut rx).await;
        assert_eq!(recorder.scripts.lock().unwrap()[0], "STRING hello world\n");
        assert!(!ctx.reassembler.lock().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_stale_upload_times_out_and_restarts_clean() {
        let recorder = Arc::new(Recorder::default());
        let (mut ctx, mut rx) = crate::handlers::tests::bare_context();
        ctx.reassembler = Mutex::new(ChunkReassembler::new(Duration::from_millis(50)));
        let ctx = Arc::new(ctx.with_executor(recorder.clone()));

        run(
            &DuckyChunk,
            &ctx,
            json!({"chunkIndex": 0, "totalChunks": 2, "data": "STALE ", "start": true}),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let err = run(
            &DuckyChunk,
            &ctx,
            json!({"chunkIndex": 1, "totalChunks": 2, "data": "x", "end": true}),
        )
        .await
        .unwrap_err();
        let response = crate::router::error_response("DUCKY_CHUNK", &err);
        assert_eq!(response.status, Status::Timeout);
        assert_eq!(response.error.as_deref(), Some("Chunk session timed out"));
        assert!(!ctx.reassembler.lock().unwrap().is_active());
        assert!(ctx.mode.is_idle());

        // the next upload starts from nothing
        let first = run(
            &DuckyChunk,
            &ctx,
            json!({"chunkIndex": 0, "totalChunks": 2, "data": "STRING ", "start": true}),
        )
        .await
        .unwrap();
        assert_eq!(first.data.unwrap()["received"], 1);
        run(
            &DuckyChunk,
            &ctx,
            json!({"chunkIndex": 1, "totalChunks": 2, "data": "fresh\n", "end": true}),
        )
        .await
        .unwrap();

        notification(&mut rx).await;
        assert_eq!(recorder.scripts.lock().unwrap()[0], "STRING fresh\n");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_rejected() {
        let (ctx, _rx) = context(Arc::new(LogExecutor::default()));
        run(&DuckyChunk, &ctx, json!({"chunkIndex": 0, "totalChunks": 3, "data": "a"}))
            .await
            .unwrap();
        let err = run(&DuckyChunk, &ctx, json!({"chunkIndex": 2, "totalChunks": 3, "data": "c"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MctError::InvalidParameter(_)));
        assert!(!ctx.reassembler.lock().unwrap().is_active());
        assert!(ctx.mode.is_idle());
    }

    #[tokio::test]
    async fn test_stop_running_script() {
        let recorder = Arc::new(Recorder {
            hang: true,
            ..Recorder::default()
        });
        let (ctx, mut rx) = context(recorder);

        run(&DuckyScript, &ctx, json!({"script": "DELAY 100000"})).await.unwrap();
        assert_eq!(ctx.mode.current(), DeviceMode::UsbHid);

        // a second script is refused while one runs
        let err = run(&DuckyScript, &ctx, json!({"script": "STRING x"})).await.unwrap_err();
        assert!(matches!(err, MctError::Busy(_)));

        let stopped = run(&DuckyStop, &ctx, json!({})).await.unwrap();
        assert_eq!(stopped.data.unwrap()["message"], "Script stopped");
        assert!(ctx.mode.is_idle());
        assert_eq!(notification(&mut rx).await["data"]["state"], "cancelled");

        let err = run(&DuckyStop, &ctx, json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: No script running");
    }

    #[tokio::test]
    async fn test_stop_abandons_upload() {
        let (ctx, _rx) = context(Arc::new(LogExecutor::default()));
        run(&DuckyChunk, &ctx, json!({"chunkIndex": 0, "totalChunks": 2, "data": "a"}))
            .await
            .unwrap();
        let stopped = run(&DuckyStop, &ctx, json!({})).await.unwrap();
        assert_eq!(stopped.data.unwrap()["message"], "Upload abandoned");
        assert!(!ctx.reassembler.lock().unwrap().is_active());
    }
}
