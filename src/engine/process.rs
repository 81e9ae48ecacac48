// Subprocess execution with cancellation. The child is spawned with
// kill_on_drop, so abandoning the wait future on cancel terminates it.

use super::EngineError;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run a configured command to completion. Returns captured stdout when the
/// caller piped it, otherwise an empty buffer.
pub(crate) async fn run(
    mut command: Command,
    tool: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, EngineError> {
    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());

    debug!(tool = tool, "Launching engine tool");
    let child = command.spawn().map_err(|source| EngineError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(tool = tool, "Cancellation requested, terminating engine tool");
            return Err(EngineError::Cancelled);
        }
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(EngineError::ToolFailed {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_failure_captures_stderr() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo 'relation does not exist' >&2; exit 3").stdout(Stdio::null());

        let err = run(command, "sh", &CancellationToken::new()).await.unwrap_err();
        match err {
            EngineError::ToolFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "relation does not exist");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut command = Command::new("sleep");
        command.arg("30").stdout(Stdio::null());

        let started = Instant::now();
        let err = run(command, "sleep", &token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
