//! Single and batch deletion

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{CosClient, RequestBody};
use crate::error::{Result, TransferError};

/// Most keys accepted by one batch delete call
pub const DELETE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Serialize)]
#[serde(rename = "Delete", rename_all = "PascalCase")]
struct DeleteRequest<'a> {
    quiet: bool,
    #[serde(rename = "Object")]
    objects: Vec<DeleteObject<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteObject<'a> {
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeleteResult {
    #[serde(rename = "Error", default)]
    errors: Vec<DeleteError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteError {
    #[serde(default)]
    key: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn delete_body(keys: &[String]) -> Result<String> {
    let doc = DeleteRequest {
        quiet: true,
        objects: keys.iter().map(|k| DeleteObject { key: k }).collect(),
    };
    Ok(quick_xml::se::to_string(&doc)?)
}

impl CosClient {
    /// Delete one object
    pub async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        self.execute_and_drain(
            cancel,
            Method::DELETE,
            key,
            &[],
            HeaderMap::new(),
            RequestBody::Empty,
        )
        .await?;
        debug!("Deleted {}", key);
        Ok(())
    }

    /// Delete many objects in batches; returns the keys that were not deleted
    pub async fn delete_many(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
    ) -> HashMap<String, TransferError> {
        let mut undeleted = HashMap::new();

        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            match self.delete_batch(cancel, batch).await {
                Ok(failed) => undeleted.extend(failed),
                Err(e) => {
                    warn!("Batch delete of {} keys failed: {}", batch.len(), e);
                    undeleted.extend(batch.iter().map(|k| (k.clone(), e.clone())));
                }
            }
        }
        undeleted
    }

    async fn delete_batch(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
    ) -> Result<Vec<(String, TransferError)>> {
        let body = delete_body(keys)?;
        let digest = md5::compute(body.as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            "content-md5",
            HeaderValue::from_str(&STANDARD.encode(digest.0))
                .map_err(|e| TransferError::internal(format!("content-md5 header: {}", e)))?,
        );

        let query = vec![("delete".to_string(), String::new())];
        let resp = self
            .execute(
                cancel,
                Method::POST,
                "",
                &query,
                headers,
                RequestBody::Bytes(Bytes::from(body)),
            )
            .await?;
        let body = self.read_body(cancel, resp).await?;
        let result: DeleteResult = quick_xml::de::from_reader(body.as_ref())?;

        debug!(
            "Batch delete of {} keys, {} failed",
            keys.len(),
            result.errors.len()
        );
        Ok(result
            .errors
            .into_iter()
            .filter(|e| !e.key.is_empty())
            .map(|e| {
                let err = TransferError::Http {
                    status: 200,
                    method: Method::POST.to_string(),
                    path: e.key.clone(),
                    body: format!("code is {}, message is {}", e.code, e.message),
                };
                (e.key, err)
            })
            .collect())
    }
}
