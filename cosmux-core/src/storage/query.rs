//! Object metadata and listing

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ETAG, EXPIRES, LAST_MODIFIED};
use reqwest::Method;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::client::{content_length, header_str, CosClient, RequestBody};
use super::clean_path;
use crate::error::Result;

/// Header carrying the server-side CRC64 of an object
pub const CRC64_HEADER: &str = "x-cos-hash-crc64ecma";

/// Metadata returned by a HEAD probe
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub size: u64,
    pub etag: String,
    /// CRC64-ECMA as reported by the service, empty if absent
    pub crc64: String,
    pub upload_time: Option<DateTime<Utc>>,
    pub expire_time: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            size: content_length(headers).unwrap_or(0),
            etag: header_str(headers, ETAG.as_str()).to_string(),
            crc64: header_str(headers, CRC64_HEADER).to_string(),
            upload_time: parse_http_date(header_str(headers, LAST_MODIFIED.as_str())),
            expire_time: parse_http_date(header_str(headers, EXPIRES.as_str())),
        }
    }
}

/// One entry of an object listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub file_id: String,
    pub size: u64,
    pub etag: String,
    pub upload_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    next_marker: Option<String>,
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    last_modified: String,
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    size: u64,
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Key prefix for listing `name_prefix` under `dir`
fn list_prefix(dir: &str, name_prefix: &str) -> String {
    let dir = clean_path(dir.trim_matches('/'));
    let mut prefix = String::new();
    if dir != "." && !dir.starts_with("..") {
        prefix.push_str(&dir);
        prefix.push('/');
    }
    prefix.push_str(name_prefix.trim_start_matches('/'));
    prefix
}

impl CosClient {
    /// Metadata of an object; `NotFound` if it does not exist
    pub async fn info(&self, cancel: &CancellationToken, key: &str) -> Result<FileInfo> {
        let headers = self.head(cancel, key).await?;
        Ok(FileInfo::from_headers(&headers))
    }

    /// Whether an object exists
    pub async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        match self.head(cancel, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// One page of objects directly under `dir` whose names start with
    /// `name_prefix`, plus the marker of the next page if there is one
    pub async fn list_files(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name_prefix: &str,
        marker: &str,
        limit: u32,
    ) -> Result<(Vec<ObjectEntry>, Option<String>)> {
        let mut query = vec![
            ("prefix".to_string(), list_prefix(dir, name_prefix)),
            ("delimiter".to_string(), "/".to_string()),
        ];
        if limit > 0 {
            query.push(("max-keys".to_string(), limit.to_string()));
        }
        if !marker.is_empty() {
            query.push(("marker".to_string(), marker.to_string()));
        }

        let resp = self
            .execute(cancel, Method::GET, "", &query, HeaderMap::new(), RequestBody::Empty)
            .await?;
        let body = self.read_body(cancel, resp).await?;
        let result: ListBucketResult = quick_xml::de::from_reader(body.as_ref())?;

        let entries = result
            .contents
            .into_iter()
            .map(|o| ObjectEntry {
                upload_time: DateTime::parse_from_rfc3339(&o.last_modified)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
                file_id: o.key,
                size: o.size,
                etag: o.etag,
            })
            .collect();
        let next = result.next_marker.filter(|m| !m.is_empty());
        Ok((entries, next))
    }
}
