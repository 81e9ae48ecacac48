//! Shared runtime context
//!
//! One [`VaultContext`] per process wires configuration to the collaborators
//! every pipeline needs. Collaborators are trait objects so tests can swap in
//! fakes through [`VaultContextBuilder`].

use crate::backup::LocalStore;
use crate::config::{RemoteTarget, VaultConfig};
use crate::engine::{DatabaseEngine, PostgresTools};
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::oplog::OperationLog;
use crate::remote::{ObjectStore, RemoteSync};
use crate::resilience::RetryConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a pipeline runs against
pub struct VaultContext {
    /// Resolved configuration
    pub config: VaultConfig,
    /// Backup root on disk
    pub store: LocalStore,
    /// Remote tier; disabled when no bucket is configured
    pub remote: RemoteSync,
    /// Database tooling
    pub engine: Arc<dyn DatabaseEngine>,
    /// Completion sink
    pub notifier: Arc<dyn Notifier>,
    /// Append-only operation history
    pub oplog: OperationLog,
    /// Operator cancel; pipelines derive child tokens from it
    pub cancel: CancellationToken,
}

impl VaultContext {
    /// Start building a context for `config`
    pub fn builder(config: VaultConfig) -> VaultContextBuilder {
        VaultContextBuilder {
            config,
            engine: None,
            object_store: None,
            notifier: None,
            retry: None,
            cancel: None,
        }
    }
}

/// Builder for [`VaultContext`]
pub struct VaultContextBuilder {
    config: VaultConfig,
    engine: Option<Arc<dyn DatabaseEngine>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    retry: Option<RetryConfig>,
    cancel: Option<CancellationToken>,
}

impl VaultContextBuilder {
    /// Database tooling; PostgreSQL client tools by default
    pub fn engine(mut self, engine: Arc<dyn DatabaseEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Bucket backing the remote tier
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Completion sink; the configured webhook, or nothing, by default
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Retry policy for remote transfers
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Parent cancellation token
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Assemble the context
    pub fn build(self) -> VaultContext {
        let mut config = self.config;

        let remote = match (self.object_store, config.remote.clone()) {
            (Some(store), Some(target)) => RemoteSync::new(store, target),
            (Some(store), None) => {
                let target = RemoteTarget::new(store.bucket());
                config.remote = Some(target.clone());
                RemoteSync::new(store, target)
            }
            (None, Some(target)) => {
                warn!(bucket = %target.bucket, "Remote storage configured but no object store supplied, remote sync disabled");
                RemoteSync::disabled()
            }
            (None, None) => RemoteSync::disabled(),
        };
        let remote = match self.retry {
            Some(retry) => remote.with_retry(retry),
            None => remote,
        };

        let notifier = self.notifier.unwrap_or_else(|| match &config.notification_url {
            Some(url) => match WebhookNotifier::new(url.clone()) {
                Ok(webhook) => Arc::new(webhook) as Arc<dyn Notifier>,
                Err(e) => {
                    warn!(error = %e, "Notification webhook unusable, notifications disabled");
                    Arc::new(NoopNotifier)
                }
            },
            None => Arc::new(NoopNotifier),
        });

        VaultContext {
            store: LocalStore::new(config.backup_dir.clone()),
            oplog: OperationLog::new(&config.backup_dir),
            engine: self.engine.unwrap_or_else(|| Arc::new(PostgresTools::new())),
            cancel: self.cancel.unwrap_or_default(),
            remote,
            notifier,
            config,
        }
    }
}
