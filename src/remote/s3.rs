// S3 object store
// Works against AWS or an S3-compatible service (LocalStack/MinIO) via endpoint override

use super::{ObjectInfo, ObjectStore, PutOptions, RemoteError};
use crate::config::RemoteTarget;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ServerSideEncryption, StorageClass};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// [`ObjectStore`] backed by an S3 bucket
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the default AWS credential chain
    pub async fn new(target: &RemoteTarget) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(target.region.clone()));

        if let Some(ref endpoint) = target.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if target.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: target.bucket.clone(),
        }
    }
}

/// Throttling, 5xx and anything below the HTTP layer is transient
fn classify<E>(err: SdkError<E, HttpResponse>) -> RemoteError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RemoteError::Transfer(message)
        }
        _ => match err.raw_response().map(|r| r.status().as_u16()) {
            Some(status) if status >= 500 || status == 429 => RemoteError::Transfer(message),
            Some(404) => RemoteError::NotFound(message),
            _ => RemoteError::Rejected(message),
        },
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, source: &Path, options: &PutOptions) -> Result<(), RemoteError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| RemoteError::Transfer(format!("failed to read {}: {}", source.display(), e)))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body);

        if let Some(class) = &options.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        if options.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request.send().await.map_err(classify)?;
        debug!(bucket = %self.bucket, key = key, "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<(), RemoteError> {
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(service)) if service.err().is_no_such_key() => {
                return Err(RemoteError::NotFound(key.to_string()));
            }
            Err(e) => return Err(classify(e)),
        };

        let mut body = output.body;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| RemoteError::Transfer(format!("download of {} interrupted: {}", key, e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(classify)?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
