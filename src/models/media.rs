use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub fn path_segment(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Other => "other",
        }
    }
}

/// Stored blob metadata (spec.md §3 `StoredMedia`).
///
/// `storage_key` always matches `<type>/yyyy/MM/dd/<hash><ext>`; see
/// [`crate::media::content_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMedia {
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub media_type: MediaType,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub custom_metadata: HashMap<String, String>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub content_type: String,
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub custom_metadata: HashMap<String, String>,
    pub size_hint_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartSession {
    pub session_id: String,
    pub storage_key: String,
    pub expires_at: DateTime<Utc>,
    pub min_part_size_bytes: u64,
    pub max_parts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub e_tag: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub url: String,
    pub http_method: String,
    pub required_headers: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
    pub storage_key: String,
    pub max_file_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaStorageResult {
    pub storage_key: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangedStreamInfo {
    pub range_start: u64,
    pub range_end: u64,
    pub total_size: u64,
    pub content_type: String,
}
