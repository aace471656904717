use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Album {
    pub id: i64,
    pub title: String,
    pub parent_album_id: Option<i64>,
    pub path: String,
    pub path_hash: String,
    pub cover_id: Option<i64>,
    /// Directory modify time (unix seconds) observed by the last scan.
    pub last_modify_time: Option<i64>,
    pub last_last_modify_time: Option<i64>,
}

impl Album {
    pub fn file_path(&self) -> &Path {
        Path::new(&self.path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "photo" => Some(MediaType::Photo),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub id: i64,
    pub title: String,
    pub path: String,
    pub path_hash: String,
    pub album_id: i64,
    pub media_type: MediaType,
    pub date_shot: DateTime<Utc>,
}

impl Media {
    pub fn file_path(&self) -> &Path {
        Path::new(&self.path)
    }
}

/// Outcome of one crawl for one user.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub needs_processing: Vec<Album>,
    pub errors: Vec<crate::error::Error>,
}
