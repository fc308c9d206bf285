use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::unfold;
use tracing::warn;

use crate::config::S3Settings;
use crate::models::media::{
    MediaStorageResult, MediaType, MultipartSession, PresignedUpload, RangedStreamInfo, StoredMedia, UploadedPart,
    VideoMetadata,
};

use super::{clamp_range, content_key, sha256_url_safe, streaming_key, ByteStream, MediaStore, MediaStoreError, StrategyRegistry};

fn s3_byte_stream_to_io_stream(body: S3ByteStream) -> impl tokio_stream::Stream<Item = std::io::Result<Bytes>> {
    unfold(body, |mut body| async move {
        body.next()
            .await
            .map(|chunk| (chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())), body))
    })
}

struct PendingMultipart {
    upload_id: String,
    storage_key: String,
    content_type: String,
    /// Bytes of every uploaded part, keyed by part number, retained so
    /// `complete_multipart` can hash the concatenated body in sorted
    /// order rather than trusting S3's per-part `e_tag`s.
    part_bytes: Mutex<HashMap<u32, Bytes>>,
}

/// S3-compatible backend (spec.md §4.C), usable against AWS S3,
/// Cloudflare R2, or any S3-API-compatible service via `service_url`
/// and `force_path_style`.
pub struct S3MediaStore {
    client: Client,
    bucket: String,
    settings: S3Settings,
    strategies: StrategyRegistry,
    pending_multipart: DashMap<String, PendingMultipart>,
}

impl S3MediaStore {
    pub async fn new(settings: S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let shared_config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(settings.force_path_style);
        if let Some(url) = &settings.service_url {
            s3_config_builder = s3_config_builder.endpoint_url(url.clone());
        }

        let client = Client::from_conf(s3_config_builder.build());
        let bucket = settings.bucket_name.clone();

        Self {
            client,
            bucket,
            settings,
            strategies: StrategyRegistry::with_defaults(),
            pending_multipart: DashMap::new(),
        }
    }

    fn media_type_segment(content_type: &str) -> &'static str {
        if content_type.starts_with("image/") {
            "image"
        } else if content_type.starts_with("video/") {
            "video"
        } else if content_type.starts_with("audio/") {
            "audio"
        } else {
            "other"
        }
    }

    fn media_type_from_segment(segment: &str) -> MediaType {
        match segment {
            "image" => MediaType::Image,
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            _ => MediaType::Other,
        }
    }

    fn extension_for(content_type: &str) -> &'static str {
        match content_type {
            "video/mp4" => ".mp4",
            "video/webm" => ".webm",
            "image/png" => ".png",
            "image/jpeg" => ".jpg",
            "audio/mpeg" => ".mp3",
            "audio/wav" => ".wav",
            _ => "",
        }
    }

    fn map_sdk_error(err: impl std::fmt::Display) -> MediaStoreError {
        let message = err.to_string();
        if message.contains("NoSuchKey") || message.contains("NotFound") {
            MediaStoreError::NotFound(message)
        } else if message.contains("AccessDenied") || message.contains("Forbidden") {
            MediaStoreError::AccessDenied(message)
        } else if message.contains("SlowDown") || message.contains("Throttl") {
            MediaStoreError::Throttled(message)
        } else {
            MediaStoreError::Other(message)
        }
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn store(&self, bytes: Bytes, metadata: &VideoMetadata) -> Result<MediaStorageResult, MediaStoreError> {
        let segment = Self::media_type_segment(&metadata.content_type);
        let ext = Self::extension_for(&metadata.content_type);
        let key = content_key(segment, &bytes, ext);
        let hash = super::sha256_url_safe(&bytes);
        let size_bytes = bytes.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(&metadata.content_type)
            .body(S3ByteStream::from(bytes))
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        Ok(MediaStorageResult {
            storage_key: key,
            content_hash: hash,
            size_bytes,
            content_type: metadata.content_type.clone(),
        })
    }

    async fn store_video(
        &self,
        bytes: Bytes,
        metadata: &VideoMetadata,
    ) -> Result<MediaStorageResult, MediaStoreError> {
        self.store(bytes, metadata).await
    }

    async fn get_stream(&self, key: &str) -> Result<Option<ByteStream>, MediaStoreError> {
        let response = self.client.get_object().bucket(&self.bucket).key(key).send().await;
        match response {
            Ok(output) => {
                let stream = s3_byte_stream_to_io_stream(output.body);
                Ok(Some(Box::pin(stream)))
            }
            Err(err) => {
                let mapped = Self::map_sdk_error(err);
                if matches!(mapped, MediaStoreError::NotFound(_)) {
                    Ok(None)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn get_info(&self, key: &str) -> Result<Option<StoredMedia>, MediaStoreError> {
        let response = self.client.head_object().bucket(&self.bucket).key(key).send().await;
        match response {
            Ok(head) => {
                let segment = key.split('/').next().unwrap_or("other");
                Ok(Some(StoredMedia {
                    storage_key: key.to_string(),
                    content_type: head.content_type().unwrap_or("application/octet-stream").to_string(),
                    size_bytes: head.content_length().unwrap_or(0).max(0) as u64,
                    media_type: Self::media_type_from_segment(segment),
                    created_at: Utc::now(),
                    expires_at: None,
                    custom_metadata: head
                        .metadata()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .collect::<HashMap<_, _>>(),
                    content_hash: head.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                }))
            }
            Err(err) => {
                let mapped = Self::map_sdk_error(err);
                if matches!(mapped, MediaStoreError::NotFound(_)) {
                    Ok(None)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), MediaStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, MediaStoreError> {
        Ok(self.get_info(key).await?.is_some())
    }

    async fn generate_url(&self, key: &str, expiration_secs: Option<u64>) -> Result<String, MediaStoreError> {
        if let Some(base) = &self.settings.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }

        let expiry = expiration_secs.unwrap_or(self.settings.default_url_expiration_secs);
        let presign_config = PresigningConfig::expires_in(Duration::from_secs(expiry))
            .map_err(|e| MediaStoreError::Other(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(presigned.uri().to_string())
    }

    async fn get_video_stream(
        &self,
        key: &str,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> Result<(ByteStream, RangedStreamInfo), MediaStoreError> {
        let info = self
            .get_info(key)
            .await?
            .ok_or_else(|| MediaStoreError::NotFound(key.to_string()))?;

        let (start, end) = clamp_range(range_start, range_end, info.size_bytes);
        let range_header = format!("bytes={start}-{end}");

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range_header)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        let stream = s3_byte_stream_to_io_stream(response.body);

        Ok((
            Box::pin(stream),
            RangedStreamInfo {
                range_start: start,
                range_end: end,
                total_size: info.size_bytes,
                content_type: info.content_type,
            },
        ))
    }

    async fn initiate_multipart(&self, metadata: &VideoMetadata) -> Result<MultipartSession, MediaStoreError> {
        let segment = Self::media_type_segment(&metadata.content_type);
        let ext = Self::extension_for(&metadata.content_type);
        let storage_key = streaming_key(segment, ext);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&storage_key)
            .content_type(&metadata.content_type)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| MediaStoreError::Other("missing upload id".to_string()))?
            .to_string();

        let session_id = uuid::Uuid::new_v4().to_string();
        self.pending_multipart.insert(
            session_id.clone(),
            PendingMultipart {
                upload_id,
                storage_key: storage_key.clone(),
                content_type: metadata.content_type.clone(),
                part_bytes: Mutex::new(HashMap::new()),
            },
        );

        Ok(MultipartSession {
            session_id,
            storage_key,
            expires_at: Utc::now() + chrono::Duration::hours(24),
            min_part_size_bytes: 5 * 1024 * 1024,
            max_parts: 10_000,
        })
    }

    async fn upload_part(
        &self,
        session_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> Result<UploadedPart, MediaStoreError> {
        let pending = self
            .pending_multipart
            .get(session_id)
            .ok_or_else(|| MediaStoreError::NotFound(session_id.to_string()))?;
        let size_bytes = bytes.len() as u64;
        pending.part_bytes.lock().unwrap().insert(part_number, bytes.clone());

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&pending.storage_key)
            .upload_id(&pending.upload_id)
            .part_number(part_number as i32)
            .body(S3ByteStream::from(bytes))
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        Ok(UploadedPart {
            part_number,
            e_tag: output.e_tag().unwrap_or_default().to_string(),
            size_bytes,
        })
    }

    async fn complete_multipart(
        &self,
        session_id: &str,
        mut parts: Vec<UploadedPart>,
    ) -> Result<MediaStorageResult, MediaStoreError> {
        let (_, pending) = self
            .pending_multipart
            .remove(session_id)
            .ok_or_else(|| MediaStoreError::NotFound(session_id.to_string()))?;

        parts.sort_by_key(|p| p.part_number);
        let completed_parts: Vec<_> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&p.e_tag)
                    .part_number(p.part_number as i32)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&pending.storage_key)
            .upload_id(&pending.upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        let total_size: u64 = parts.iter().map(|p| p.size_bytes).sum();

        // Round-trip invariant: completing a multipart upload must yield
        // the same content hash a single-shot `store()` of the
        // concatenated bytes would, so hash the parts in sorted order
        // rather than trusting any single part's S3 `e_tag`.
        let mut body = Vec::with_capacity(total_size as usize);
        {
            let mut part_bytes = pending.part_bytes.lock().unwrap();
            for part in &parts {
                if let Some(bytes) = part_bytes.remove(&part.part_number) {
                    body.extend_from_slice(&bytes);
                }
            }
        }
        let content_hash = sha256_url_safe(&body);

        Ok(MediaStorageResult {
            storage_key: pending.storage_key,
            content_hash,
            size_bytes: total_size,
            content_type: pending.content_type,
        })
    }

    async fn abort_multipart(&self, session_id: &str) -> Result<(), MediaStoreError> {
        if let Some((_, pending)) = self.pending_multipart.remove(session_id) {
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&pending.storage_key)
                .upload_id(&pending.upload_id)
                .send()
                .await
            {
                warn!(%err, session_id, "failed to abort multipart upload, temporary state left in backend");
            }
        }
        Ok(())
    }

    async fn presign_upload(
        &self,
        metadata: &VideoMetadata,
        expiration_secs: u64,
    ) -> Result<PresignedUpload, MediaStoreError> {
        let segment = Self::media_type_segment(&metadata.content_type);
        let ext = Self::extension_for(&metadata.content_type);
        let storage_key = streaming_key(segment, ext);

        let presign_config = PresigningConfig::expires_in(Duration::from_secs(expiration_secs))
            .map_err(|e| MediaStoreError::Other(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&storage_key)
            .content_type(&metadata.content_type)
            .presigned(presign_config)
            .await
            .map_err(Self::map_sdk_error)?;

        let mut required_headers = HashMap::new();
        required_headers.insert("Content-Type".to_string(), metadata.content_type.clone());

        let _ = self.strategies.select(metadata, metadata.size_hint_bytes, false);

        Ok(PresignedUpload {
            url: presigned.uri().to_string(),
            http_method: "PUT".to_string(),
            required_headers,
            expires_at: Utc::now() + chrono::Duration::seconds(expiration_secs as i64),
            storage_key,
            max_file_size_bytes: self.settings.multipart_threshold_bytes.max(100 * 1024 * 1024),
        })
    }
}
