// Per-pipeline cancellation: operator cancel propagates from the parent token,
// and an optional deadline cancels the pipeline's own child token.

use crate::{Result, Stage, VaultError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) struct PipelineToken {
    token: CancellationToken,
    deadline: Option<JoinHandle<()>>,
}

impl PipelineToken {
    pub(crate) fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let deadline = timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout = ?limit, "Operation timed out, cancelling");
                token.cancel();
            })
        });
        Self { token, deadline }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PipelineToken {
    fn drop(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}

/// Fail with [`VaultError::Cancelled`] if `token` has fired; called between
/// pipeline steps that do not watch the token themselves
pub(crate) fn checkpoint(token: &CancellationToken, stage: Stage) -> Result<()> {
    if token.is_cancelled() {
        return Err(VaultError::Cancelled(stage));
    }
    Ok(())
}
