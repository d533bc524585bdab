//! Gateway to the project's object-store bucket.
//!
//! Wraps the S3 client behind the handful of operations the delivery
//! core needs: bucket existence, prefix-aware key lookup, folder
//! markers, multipart-aware puts fed from a `FileStream`, and downloads
//! materialised to a local path.

use std::path::Path;

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{DeliveryError, Result};
use crate::stream::FileStream;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Multipart thresholds are configuration, not protocol.
#[derive(Debug, Clone, Copy)]
pub struct MultipartConfig {
    /// Uploads above this size go through the multipart path.
    pub threshold: u64,
    /// Size of each uploaded part.
    pub part_size: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold: 5 * GB,
            part_size: 5 * MB,
        }
    }
}

pub struct ObjectStore {
    client: Client,
    bucket: String,
}

fn describe<E>(err: &SdkError<E>) -> String
where
    E: ProvideErrorMetadata,
{
    match err.as_service_error() {
        Some(svc) => format!(
            "{}: {}",
            svc.code().unwrap_or("unknown"),
            svc.message().unwrap_or("no message")
        ),
        None => err.to_string(),
    }
}

fn marker_key(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

impl ObjectStore {
    /// Connects using the ambient AWS environment. A non-AWS store is
    /// reached by setting `COURIER_S3_ENDPOINT`.
    pub async fn connect(bucket: &str) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Ok(endpoint) = std::env::var("COURIER_S3_ENDPOINT") {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// A project without a bucket cannot be delivered to; the caller
    /// treats `false` as session-fatal.
    pub async fn bucket_exists(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }

    /// Prefix-aware existence check. Returns whether anything matched
    /// and the full list of matching keys (a folder prefix matches all
    /// objects under it).
    pub async fn key_exists(&self, key: &str) -> Result<(bool, Vec<String>)> {
        let mut matching = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(key);
            if let Some(token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| DeliveryError::StorageConfig(describe(&e)))?;

            let is_truncated = resp.is_truncated().unwrap_or(false);
            let next_token = resp.next_continuation_token.clone();

            if let Some(contents) = resp.contents {
                for obj in contents {
                    if let Some(k) = obj.key {
                        matching.push(k);
                    }
                }
            }

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        Ok((!matching.is_empty(), matching))
    }

    /// Makes an empty "directory" visible in listings by placing a
    /// zero-byte marker object at the prefix. No-op if one is already
    /// there.
    pub async fn ensure_folder_marker(&self, prefix: &str) -> Result<()> {
        let marker = marker_key(prefix);
        let (_, matching) = self.key_exists(&marker).await?;
        if matching.iter().any(|k| k == &marker) {
            return Ok(());
        }

        debug!(%marker, "creating folder marker");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&marker)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| DeliveryError::Upload(describe(&e)))?;
        Ok(())
    }

    /// Streams the chunk sequence into the bucket under `key`.
    ///
    /// `size_hint` (the raw source size) decides whether to take the
    /// multipart path; the processed size is only known once the stream
    /// is exhausted, and is what this returns. An early-terminated
    /// stream is an upload failure, never a silent short object.
    pub async fn put_object(
        &self,
        stream: &mut FileStream,
        key: &str,
        size_hint: u64,
        config: &MultipartConfig,
    ) -> Result<u64> {
        if size_hint > config.threshold {
            self.put_multipart(stream, key, config).await
        } else {
            self.put_single(stream, key).await
        }
    }

    async fn put_single(&self, stream: &mut FileStream, key: &str) -> Result<u64> {
        let mut body = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        if !stream.completed() {
            return Err(DeliveryError::Upload(format!(
                "source stream for '{key}' ended early"
            )));
        }

        let size = stream.bytes_streamed();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| DeliveryError::Upload(describe(&e)))?;
        Ok(size)
    }

    async fn put_multipart(
        &self,
        stream: &mut FileStream,
        key: &str,
        config: &MultipartConfig,
    ) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| DeliveryError::Upload(describe(&e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| DeliveryError::Upload("no multipart upload id returned".into()))?
            .to_string();

        match self
            .upload_parts(stream, key, &upload_id, config.part_size)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Upload(describe(&e)))?;
                Ok(stream.bytes_streamed())
            }
            Err(e) => {
                // Leave nothing half-written behind the key.
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        stream: &mut FileStream,
        key: &str,
        upload_id: &str,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            let chunk = stream.next_chunk().await;
            if let Some(chunk) = &chunk {
                buffer.extend_from_slice(chunk);
            }
            let at_end = chunk.is_none();

            if at_end && !stream.completed() {
                return Err(DeliveryError::Upload(format!(
                    "source stream for '{key}' ended early"
                )));
            }

            while buffer.len() as u64 >= part_size || (at_end && !buffer.is_empty()) {
                let take = (part_size as usize).min(buffer.len());
                let part: Vec<u8> = buffer.drain(..take).collect();

                let uploaded = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(part))
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Upload(describe(&e)))?;
                let etag = uploaded
                    .e_tag()
                    .ok_or_else(|| DeliveryError::Upload("upload part returned no etag".into()))?;

                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(etag)
                        .build(),
                );
                part_number += 1;
            }

            if at_end {
                return Ok(parts);
            }
        }
    }

    /// Downloads `key` to `local_path`, creating parent directories.
    /// Returns `false` (and logs) when the target already exists, so
    /// repeated invocations stay idempotent.
    pub async fn get_object(&self, key: &str, local_path: &Path) -> Result<bool> {
        if local_path.exists() {
            info!(path = %local_path.display(), "already downloaded, skipping");
            return Ok(false);
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| DeliveryError::Download(describe(&e)))?;

        let mut body = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        Ok(true)
    }
}
