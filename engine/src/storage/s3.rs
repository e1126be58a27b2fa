//! S3-compatible object storage backend.

use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client,
};
use bytes::BytesMut;
use futures::future::join_all;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use chbackup::stream::read_chunk_async;

use super::{DeleteOutcome, ObjectEntry, StorageBackend};
use crate::error::{EngineError, EngineResult};

/// How many keys a single DeleteObjects request may carry.
const BULK_DELETE_CHUNK: usize = 1000;

/// Aborts an unfinished multipart upload when dropped.
///
/// An interrupted multipart upload keeps its parts billed until it is
/// aborted; the guard is disarmed once CompleteMultipartUpload goes
/// through. Drop cannot await, so the abort call is handed to the
/// runtime.
struct MultipartAbort {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    completed: bool,
}

impl MultipartAbort {
    fn disarm(mut self) {
        self.completed = true;
    }
}

impl Drop for MultipartAbort {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        tracing::warn!("Upload was interrupted - Aborting multipart upload");

        let request = self
            .client
            .abort_multipart_upload()
            .bucket(std::mem::take(&mut self.bucket))
            .key(std::mem::take(&mut self.key))
            .upload_id(std::mem::take(&mut self.upload_id));

        tokio::task::spawn(async move {
            if let Err(e) = request.send().await {
                tracing::warn!("Failed to abort multipart upload: {}", e);
            }
        });
    }
}

/// The S3 storage backend.
#[derive(Debug)]
pub struct S3Backend {
    client: Client,
    config: S3StorageConfig,

    /// Part size for multipart uploads. Uploads smaller than this are a
    /// single PutObject.
    chunk_size: usize,
}

/// S3 storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    pub region: String,

    /// The name of the bucket.
    pub bucket: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g.,
    /// Minio).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    #[serde(default)]
    pub credentials: Option<S3CredentialsConfig>,
}

/// S3 credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
    /// Access key ID.
    #[serde(rename = "access-key-id")]
    pub access_key_id: String,

    /// Secret access key.
    #[serde(rename = "secret-access-key")]
    pub secret_access_key: String,
}

impl S3Backend {
    pub async fn new(config: S3StorageConfig, chunk_size: usize) -> EngineResult<Self> {
        let client = build_client(&config).await;

        Ok(Self {
            client,
            config,
            chunk_size,
        })
    }
}

/// Builds an S3 client for arbitrary credentials and endpoint.
///
/// Also used by the cloud-storage restore path which talks to the source
/// bucket of another installation.
pub async fn build_client(config: &S3StorageConfig) -> Client {
    let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    let mut builder = S3ConfigBuilder::from(&shared_config);

    if let Some(credentials) = &config.credentials {
        builder = builder.credentials_provider(Credentials::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            None,
            None,
            "s3",
        ));
    }

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    let s3_config = builder
        .region(Region::new(config.region.to_owned()))
        .build();

    Client::from_conf(s3_config)
}

#[async_trait::async_trait]
impl StorageBackend for S3Backend {
    async fn upload_file(
        &self,
        key: String,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> EngineResult<()> {
        let buf = BytesMut::with_capacity(self.chunk_size);
        let first_chunk = read_chunk_async(&mut stream, buf)
            .await
            .map_err(EngineError::storage_error)?;

        if first_chunk.len() < self.chunk_size {
            // do a normal PutObject
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .body(first_chunk.into())
                .send()
                .await
                .map_err(EngineError::storage_error)?;

            return Ok(());
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(EngineError::storage_error)?;

        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| {
                EngineError::StorageError(anyhow::anyhow!("missing multipart upload id"))
            })?
            .to_owned();

        let cleanup = MultipartAbort {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            completed: false,
        };

        let mut part_number = 1;
        let mut parts = Vec::new();
        let mut first_chunk = Some(first_chunk);

        loop {
            let chunk = if part_number == 1 {
                first_chunk.take().unwrap()
            } else {
                let buf = BytesMut::with_capacity(self.chunk_size);
                read_chunk_async(&mut stream, buf)
                    .await
                    .map_err(EngineError::storage_error)?
            };

            if chunk.is_empty() {
                break;
            }

            let fut = tokio::task::spawn({
                self.client
                    .upload_part()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(chunk.into())
                    .send()
            });

            parts.push(fut);
            part_number += 1;
        }

        let completed_parts = join_all(parts)
            .await
            .into_iter()
            .map(|join_result| join_result.unwrap())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::storage_error)?
            .into_iter()
            .enumerate()
            .map(|(idx, part)| {
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .set_part_number(Some(idx as i32 + 1))
                    .build()
            })
            .collect::<Vec<_>>();

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(EngineError::storage_error)?;

        cleanup.disarm();

        Ok(())
    }

    async fn download_file(&self, key: String) -> EngineResult<Box<dyn AsyncRead + Unpin + Send>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(EngineError::storage_error)?;

        let stream = futures::stream::try_unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(bytes)) => Ok(Some((bytes, body))),
                Ok(None) => Ok(None),
                Err(e) => Err(IoError::new(IoErrorKind::Other, e)),
            }
        });

        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn list_prefix(&self, prefix: String) -> EngineResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix);

            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }

            let output = req.send().await.map_err(EngineError::storage_error)?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    entries.push(ObjectEntry {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete_files(&self, keys: Vec<String>) -> EngineResult<Vec<DeleteOutcome>> {
        let mut outcomes = Vec::with_capacity(keys.len());

        for batch in keys.chunks(BULK_DELETE_CHUNK) {
            let identifiers = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(EngineError::storage_error)
                })
                .collect::<EngineResult<Vec<_>>>()?;

            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(EngineError::storage_error)?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.config.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(EngineError::storage_error)?;

            let failed: std::collections::HashMap<String, String> = output
                .errors()
                .iter()
                .filter_map(|e| {
                    Some((
                        e.key()?.to_string(),
                        e.message().unwrap_or("unknown error").to_string(),
                    ))
                })
                .collect();

            for key in batch {
                let result = match failed.get(key) {
                    Some(message) => Err(EngineError::StorageError(anyhow::anyhow!(
                        "{}",
                        message.clone()
                    ))),
                    None => Ok(()),
                };
                outcomes.push(DeleteOutcome {
                    key: key.clone(),
                    result,
                });
            }
        }

        Ok(outcomes)
    }

    async fn exists(&self, key: String) -> EngineResult<bool> {
        Ok(self.object_size(key).await?.is_some())
    }

    async fn object_size(&self, key: String) -> EngineResult<Option<u64>> {
        let res = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await;

        match res {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(EngineError::storage_error(service_error))
                }
            }
        }
    }
}
