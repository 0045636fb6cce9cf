//! Multipart session control plane
//!
//! Init, part upload, part listing, completion and abort. Completion always
//! re-lists the parts from the service and submits that list, so the service
//! sees exactly what it stored.

use bytes::Bytes;
use reqwest::header::{HeaderMap, ETAG};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{CosClient, RequestBody};
use crate::error::{Result, TransferError};

/// An open multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartSession {
    /// Normalized object key
    pub file_id: String,
    /// Server-assigned upload id
    pub upload_id: String,
}

/// A part the service has stored for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    /// Opaque content fingerprint, echoed verbatim on completion
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPartsResult {
    #[serde(rename = "Part", default)]
    parts: Vec<ListedPart>,
    #[serde(default)]
    next_part_number_marker: Option<String>,
    #[serde(default)]
    is_truncated: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPart {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
    size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<CompletedPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompletedPart<'a> {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

fn session_query(upload_id: &str) -> Vec<(String, String)> {
    vec![("uploadId".to_string(), upload_id.to_string())]
}

impl CosClient {
    /// Open a multipart upload and return its upload id
    pub async fn init_multipart_upload(&self, cancel: &CancellationToken, key: &str) -> Result<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let resp = self
            .execute(cancel, Method::POST, key, &query, HeaderMap::new(), RequestBody::Empty)
            .await?;
        let body = self.read_body(cancel, resp).await?;

        let result: InitiateMultipartUploadResult = quick_xml::de::from_reader(body.as_ref())?;
        if result.upload_id.is_empty() {
            return Err(TransferError::Xml {
                message: format!("empty UploadId in init response for {}", key),
            });
        }
        debug!("Opened multipart upload {} for {}", result.upload_id, key);
        Ok(result.upload_id)
    }

    /// Upload one part and return the ETag reported for it
    pub async fn upload_part(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
        part_number: u32,
        body: RequestBody,
    ) -> Result<String> {
        let mut query = vec![("partNumber".to_string(), part_number.to_string())];
        query.extend(session_query(&session.upload_id));

        let headers = self
            .execute_and_drain(
                cancel,
                Method::PUT,
                &session.file_id,
                &query,
                HeaderMap::new(),
                body,
            )
            .await?;
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        debug!("Uploaded part {} of {}", part_number, session.file_id);
        Ok(etag)
    }

    /// Upload one part from an in-memory buffer
    pub async fn upload_part_bytes(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.upload_part(cancel, session, part_number, RequestBody::Bytes(data))
            .await
    }

    /// List every stored part of a session, following pagination, sorted by
    /// part number
    pub async fn list_parts(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<Vec<UploadedPart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = session_query(&session.upload_id);
            if let Some(m) = &marker {
                query.push(("part-number-marker".to_string(), m.clone()));
            }
            let resp = self
                .execute(cancel, Method::GET, &session.file_id, &query, HeaderMap::new(), RequestBody::Empty)
                .await?;
            let body = self.read_body(cancel, resp).await?;
            let page: ListPartsResult = quick_xml::de::from_reader(body.as_ref())?;

            parts.extend(page.parts.into_iter().map(|p| UploadedPart {
                part_number: p.part_number,
                etag: p.etag,
                size: p.size,
            }));

            let next = page.next_part_number_marker.filter(|m| !m.is_empty());
            let more = match page.is_truncated {
                Some(truncated) => truncated,
                None => next.is_some(),
            };
            if !more {
                break;
            }
            match next {
                Some(n) if marker.as_deref() != Some(n.as_str()) => marker = Some(n),
                _ => {
                    return Err(TransferError::Xml {
                        message: format!(
                            "list parts for {} is truncated without a new marker",
                            session.file_id
                        ),
                    })
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// Complete a session with the part list currently stored by the service
    pub async fn complete_multipart_upload(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<()> {
        let parts = self.list_parts(cancel, session).await?;
        let body = complete_body(&parts)?;

        self.execute_and_drain(
            cancel,
            Method::POST,
            &session.file_id,
            &session_query(&session.upload_id),
            HeaderMap::new(),
            RequestBody::Bytes(Bytes::from(body)),
        )
        .await?;
        debug!(
            "Completed multipart upload {} for {} with {} parts",
            session.upload_id,
            session.file_id,
            parts.len()
        );
        Ok(())
    }

    /// Discard a session and every part stored for it
    pub async fn abort_multipart_upload(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<()> {
        self.execute_and_drain(
            cancel,
            Method::DELETE,
            &session.file_id,
            &session_query(&session.upload_id),
            HeaderMap::new(),
            RequestBody::Empty,
        )
        .await?;
        debug!("Aborted multipart upload {} for {}", session.upload_id, session.file_id);
        Ok(())
    }
}

/// Render the completion payload; `parts` must already be sorted
fn complete_body(parts: &[UploadedPart]) -> Result<String> {
    let doc = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: &p.etag,
            })
            .collect(),
    };
    Ok(quick_xml::se::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult>
    <Bucket>examplebucket-1250000000</Bucket>
    <Key>exampleobject</Key>
    <UploadId>1585130821cbb7df1d11846c073ad648e8f33b087cec2381df437acdc833cf654b9ecc6361</UploadId>
</InitiateMultipartUploadResult>"#;
        let parsed: InitiateMultipartUploadResult = quick_xml::de::from_str(xml).unwrap();
        assert!(parsed.upload_id.starts_with("1585130821"));
    }

    #[test]
    fn test_parse_list_parts_page() {
        let xml = r#"<ListPartsResult>
    <Bucket>b</Bucket>
    <Key>k</Key>
    <UploadId>u</UploadId>
    <PartNumberMarker>0</PartNumberMarker>
    <NextPartNumberMarker>2</NextPartNumberMarker>
    <MaxParts>2</MaxParts>
    <IsTruncated>true</IsTruncated>
    <Part>
        <PartNumber>2</PartNumber>
        <LastModified>2020-03-25T10:07:12.000Z</LastModified>
        <ETag>"bb"</ETag>
        <Size>5</Size>
    </Part>
    <Part>
        <PartNumber>1</PartNumber>
        <LastModified>2020-03-25T10:07:12.000Z</LastModified>
        <ETag>"aa"</ETag>
        <Size>10</Size>
    </Part>
</ListPartsResult>"#;
        let page: ListPartsResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(page.parts.len(), 2);
        assert_eq!(page.parts[0].part_number, 2);
        assert_eq!(page.parts[1].etag, "\"aa\"");
        assert_eq!(page.next_part_number_marker.as_deref(), Some("2"));
        assert_eq!(page.is_truncated, Some(true));
    }

    #[test]
    fn test_parse_empty_list_parts_page() {
        let xml = "<ListPartsResult><IsTruncated>false</IsTruncated></ListPartsResult>";
        let page: ListPartsResult = quick_xml::de::from_str(xml).unwrap();
        assert!(page.parts.is_empty());
    }

    #[test]
    fn test_complete_body() {
        let parts = vec![
            UploadedPart {
                part_number: 1,
                etag: "a1".into(),
                size: 10,
            },
            UploadedPart {
                part_number: 2,
                etag: "b2".into(),
                size: 3,
            },
        ];
        let body = complete_body(&parts).unwrap();
        assert_eq!(
            body,
            "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>a1</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>b2</ETag></Part></CompleteMultipartUpload>"
        );
    }
}
