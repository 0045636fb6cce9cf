//! Client facade
//!
//! [`Client`] bundles the transport, transfer configuration, buffer pool,
//! metrics and the tracker for detached cleanup tasks. Every operation
//! normalizes the file id first and takes a [`CancellationToken`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Body, Method};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::{ClientConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::metrics::TransferMetrics;
use crate::storage::{
    normalize_file_id, ByteBufferPool, CosClient, FileInfo, MultipartSession, ObjectEntry,
    RequestBody, UploadedPart,
};
use crate::transfer::{download, upload, ObjectReader, TransferContext, WriteAt};

/// Key probed by [`Client::ping`]
const PING_KEY: &str = "ping";

/// COS client with parallel multipart transfers
#[derive(Clone)]
pub struct Client {
    ctx: TransferContext,
}

impl Client {
    /// Create a client with a default HTTP client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let cos = CosClient::new(&config)?;
        Ok(Self::with_transport(cos, config.transfer))
    }

    /// Create a client around a caller-supplied reqwest client
    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Self {
        let cos = CosClient::with_http_client(&config, http);
        Self::with_transport(cos, config.transfer)
    }

    /// Create a client from a prepared transport
    pub fn with_transport(cos: CosClient, transfer: TransferConfig) -> Self {
        let buffers = ByteBufferPool::new(transfer.effective_part_size() as usize);
        info!(
            "COS client for {} (part size {}, threshold {}, concurrency {})",
            cos.host(),
            transfer.effective_part_size(),
            transfer.multipart_threshold,
            transfer.effective_concurrency()
        );
        Self {
            ctx: TransferContext {
                cos: Arc::new(cos),
                config: transfer,
                buffers,
                metrics: Arc::new(TransferMetrics::new()),
                cleanup: TaskTracker::new(),
            },
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.ctx.metrics
    }

    /// Part buffer pool shared by all uploads of this client
    pub fn buffer_pool(&self) -> &ByteBufferPool {
        &self.ctx.buffers
    }

    pub fn transport(&self) -> &CosClient {
        &self.ctx.cos
    }

    /// Wait for background cleanup (multipart aborts) to finish
    ///
    /// Aborts scheduled after a failed upload are lost if the process exits
    /// before they run.
    pub async fn shutdown(&self) {
        self.ctx.cleanup.close();
        self.ctx.cleanup.wait().await;
        self.ctx.cleanup.reopen();
        debug!("Background cleanup drained");
    }

    /// Number of cleanup tasks still running
    pub fn pending_cleanups(&self) -> usize {
        self.ctx.cleanup.len()
    }

    // ========== Base ==========

    /// Check that the service answers signed requests
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        match self.ctx.cos.head(cancel, PING_KEY).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Signature for a request built by the caller
    pub fn generate_authorization(
        &self,
        file_id: &str,
        method: &Method,
        query: &[(String, String)],
        headers: &HeaderMap,
        expiration: Duration,
    ) -> String {
        let key = normalize_file_id(file_id).unwrap_or_default();
        self.ctx
            .cos
            .signer()
            .sign(&key, method, query, headers, expiration)
    }

    /// Presigned download URL valid for `expiration`
    pub fn get_download_url(&self, file_id: &str, expiration: Duration) -> Result<String> {
        let key = normalize_file_id(file_id)?;
        Ok(self.ctx.cos.download_url(&key, expiration))
    }

    // ========== Query ==========

    pub async fn info(&self, cancel: &CancellationToken, file_id: &str) -> Result<FileInfo> {
        let key = normalize_file_id(file_id)?;
        self.ctx.cos.info(cancel, &key).await
    }

    pub async fn exists(&self, cancel: &CancellationToken, file_id: &str) -> Result<bool> {
        let key = normalize_file_id(file_id)?;
        self.ctx.cos.exists(cancel, &key).await
    }

    /// One page of objects under `dir` starting with `name_prefix`
    ///
    /// Pass the returned marker back to fetch the next page; `None` means
    /// the listing is complete.
    pub async fn list_files(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name_prefix: &str,
        marker: &str,
        limit: u32,
    ) -> Result<(Vec<ObjectEntry>, Option<String>)> {
        self.ctx
            .cos
            .list_files(cancel, dir, name_prefix, marker, limit)
            .await
    }

    // ========== Delete ==========

    pub async fn delete(&self, cancel: &CancellationToken, file_id: &str) -> Result<()> {
        let key = normalize_file_id(file_id)?;
        self.ctx.cos.delete(cancel, &key).await
    }

    /// Delete many objects; returns the ids that could not be deleted
    ///
    /// Ids that normalize to nothing are skipped.
    pub async fn delete_many<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        file_ids: &[S],
    ) -> HashMap<String, TransferError> {
        let keys: Vec<String> = file_ids
            .iter()
            .filter_map(|id| normalize_file_id(id.as_ref()).ok())
            .collect();
        if keys.is_empty() {
            return HashMap::new();
        }
        self.ctx.cos.delete_many(cancel, &keys).await
    }

    // ========== Upload ==========

    /// Upload an in-memory object
    pub async fn upload(&self, cancel: &CancellationToken, file_id: &str, data: Bytes) -> Result<()> {
        let key = normalize_file_id(file_id)?;
        upload::upload(&self.ctx, cancel, &key, data).await
    }

    /// Upload a stream of unknown length (always multipart)
    pub async fn upload_from_reader<R>(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = normalize_file_id(file_id)?;
        upload::upload_from_reader(&self.ctx, cancel, &key, reader).await
    }

    /// Upload exactly `len` bytes from `reader`
    pub async fn upload_from_reader_with_size<R>(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        len: u64,
        reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let key = normalize_file_id(file_id)?;
        upload::upload_from_reader_with_size(&self.ctx, cancel, &key, len, reader).await
    }

    /// Upload a local file
    pub async fn upload_from_disk(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let key = normalize_file_id(file_id)?;
        upload::upload_from_disk(&self.ctx, cancel, &key, path.as_ref()).await
    }

    // ========== Download ==========

    /// Open an object as a byte stream; returns the reader and object size
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
    ) -> Result<(ObjectReader, u64)> {
        let key = normalize_file_id(file_id)?;
        download::download(&self.ctx, cancel, &key).await
    }

    /// Download an object into memory
    pub async fn download_bytes(&self, cancel: &CancellationToken, file_id: &str) -> Result<Bytes> {
        let key = normalize_file_id(file_id)?;
        download::download_bytes(&self.ctx, cancel, &key).await
    }

    /// Copy an object into `writer`; returns the bytes written
    pub async fn download_to_writer<W>(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        writer: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let key = normalize_file_id(file_id)?;
        download::download_to_writer(&self.ctx, cancel, &key, writer).await
    }

    /// Copy an object whose size the caller already knows into `writer`
    pub async fn download_to_writer_with_size<W>(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        size: u64,
        writer: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let key = normalize_file_id(file_id)?;
        download::download_to_writer_with_size(&self.ctx, cancel, &key, size, writer).await
    }

    /// Download an object into a positional destination
    pub async fn download_to_writer_at(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        sink: Arc<dyn WriteAt>,
    ) -> Result<()> {
        let key = normalize_file_id(file_id)?;
        download::download_to_writer_at(&self.ctx, cancel, &key, sink).await
    }

    /// Download an object to a local file; a partial file is removed on
    /// failure
    pub async fn download_to_disk(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let key = normalize_file_id(file_id)?;
        download::download_to_disk(&self.ctx, cancel, &key, path.as_ref()).await
    }

    // ========== Multipart ==========

    /// Open a multipart session
    pub async fn init_multipart_upload(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
    ) -> Result<MultipartSession> {
        let key = normalize_file_id(file_id)?;
        let upload_id = self.ctx.cos.init_multipart_upload(cancel, &key).await?;
        Ok(MultipartSession {
            file_id: key,
            upload_id,
        })
    }

    /// Upload one part; returns its ETag
    pub async fn upload_part(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        check_part_number(part_number)?;
        self.ctx
            .cos
            .upload_part_bytes(cancel, session, part_number, data)
            .await
    }

    /// Upload one part of exactly `len` bytes streamed from `reader`
    pub async fn upload_part_from_reader<R>(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
        part_number: u32,
        len: u64,
        reader: R,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        check_part_number(part_number)?;
        let body = Body::wrap_stream(ReaderStream::new(reader.take(len)));
        self.ctx
            .cos
            .upload_part(cancel, session, part_number, RequestBody::Stream { body, len })
            .await
    }

    /// Parts stored for a session, sorted by part number
    pub async fn list_parts(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<Vec<UploadedPart>> {
        self.ctx.cos.list_parts(cancel, session).await
    }

    /// Complete a session with the parts the service has stored
    pub async fn complete_multipart_upload(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<()> {
        self.ctx.cos.complete_multipart_upload(cancel, session).await
    }

    /// Abort a session and discard its parts
    pub async fn abort_multipart_upload(
        &self,
        cancel: &CancellationToken,
        session: &MultipartSession,
    ) -> Result<()> {
        self.ctx.cos.abort_multipart_upload(cancel, session).await
    }
}

fn check_part_number(part_number: u32) -> Result<()> {
    if part_number == 0 {
        return Err(TransferError::InvalidArgument {
            reason: "part numbers start at 1".to_string(),
        });
    }
    Ok(())
}
