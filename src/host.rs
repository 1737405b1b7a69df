//! Host keystroke-script executor seam
//!
//! Scripts are opaque to the device core; the executor owns their meaning.

use std::time::Duration;

use crate::Result;

#[async_trait::async_trait]
pub trait HostExecutor: Send + Sync {
    /// Run `script` to completion. Dropping the future abandons execution.
    async fn execute(&self, script: String) -> Result<()>;

    fn name(&self) -> &str;
}

/// Executor that logs each script line instead of typing it
#[derive(Debug, Clone, Default)]
pub struct LogExecutor {
    line_delay: Duration,
}

impl LogExecutor {
    pub fn new(line_delay: Duration) -> Self {
        Self { line_delay }
    }
}

#[async_trait::async_trait]
impl HostExecutor for LogExecutor {
    async fn execute(&self, script: String) -> Result<()> {
        let lines: Vec<&str> = script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        log::info!("Executing host script ({} lines)", lines.len());

        for (n, line) in lines.iter().enumerate() {
            log::debug!("script[{}]: {}", n + 1, line);
            if !self.line_delay.is_zero() {
                tokio::time::sleep(self.line_delay).await;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_executor_completes() {
        let executor = LogExecutor::default();
        executor
            .execute("STRING hello\n\nENTER\n".to_string())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_executor_is_cancellable() {
        let executor = LogExecutor::new(Duration::from_secs(1));
        let run = executor.execute("A\nB\nC\n".to_string());
        let outcome = tokio::time::timeout(Duration::from_millis(1500), run).await;
        assert!(outcome.is_err());
    }
}
