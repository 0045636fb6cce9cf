//! Upload orchestration
//!
//! Objects at or below the multipart threshold go up in one PUT. Larger or
//! unsized sources are read part by part into pooled buffers and uploaded by
//! the worker pool; any failure after the session is opened aborts it in
//! the background.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Body, Method};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pool::WorkerPool;
use super::TransferContext;
use crate::error::{Result, TransferError};
use crate::storage::{MultipartSession, RequestBody};

/// One part handed to a worker
pub struct PartUpload {
    /// 1-based, dense, in source order
    pub part_number: u32,
    /// Pooled buffer truncated to the part length
    pub buffer: Vec<u8>,
}

/// Upload an in-memory object
pub(crate) async fn upload(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    data: Bytes,
) -> Result<()> {
    let size = data.len() as u64;
    if !ctx.config.use_multipart(size) {
        return put_object(ctx, cancel, key, RequestBody::Bytes(data)).await;
    }
    multipart_upload(ctx, cancel, key, std::io::Cursor::new(data), Some(size)).await
}

/// Upload a stream of unknown length; always multipart
pub(crate) async fn upload_from_reader<R>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    reader: R,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    multipart_upload(ctx, cancel, key, reader, None).await
}

/// Upload exactly `len` bytes from `reader`
pub(crate) async fn upload_from_reader_with_size<R>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    len: u64,
    reader: R,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = reader.take(len);
    if !ctx.config.use_multipart(len) {
        let body = Body::wrap_stream(ReaderStream::new(reader));
        return put_object(ctx, cancel, key, RequestBody::Stream { body, len }).await;
    }
    multipart_upload(ctx, cancel, key, reader, Some(len)).await
}

/// Upload a local file
pub(crate) async fn upload_from_disk(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    path: &Path,
) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    debug!("Uploading {} ({} bytes) to {}", path.display(), len, key);
    upload_from_reader_with_size(ctx, cancel, key, len, file).await
}

async fn put_object(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    body: RequestBody,
) -> Result<()> {
    let len = body.len();
    ctx.cos
        .execute_and_drain(cancel, Method::PUT, key, &[], HeaderMap::new(), body)
        .await?;
    ctx.metrics.bytes_uploaded.inc_by(len);
    debug!("Uploaded {} in one request ({} bytes)", key, len);
    Ok(())
}

async fn multipart_upload<R>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    mut reader: R,
    expected: Option<u64>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    // Nothing to clean up if this fails
    let upload_id = ctx.cos.init_multipart_upload(cancel, key).await?;
    let session = Arc::new(MultipartSession {
        file_id: key.to_string(),
        upload_id,
    });
    info!(
        "Multipart upload {} of {} started (part size {})",
        session.upload_id,
        key,
        ctx.part_size()
    );

    let mut pool = part_pool(ctx, cancel, session.clone());
    let produced = produce_parts(ctx, cancel, &mut pool, &mut reader, expected).await;
    let result = match produced {
        Ok(parts) => pool.join(false).await.map(|()| parts),
        Err(e) => Err(e),
    };

    let parts = match result {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Multipart upload of {} failed: {}", key, e);
            ctx.spawn_abort(session, Some(pool));
            return Err(e);
        }
    };
    drop(pool);

    if let Err(e) = ctx.cos.complete_multipart_upload(cancel, &session).await {
        ctx.spawn_abort::<PartUpload>(session, None);
        return Err(e);
    }
    ctx.metrics.sessions_completed.inc();
    info!(
        "Multipart upload {} of {} completed with {} parts",
        session.upload_id, key, parts
    );
    Ok(())
}

fn part_pool(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    session: Arc<MultipartSession>,
) -> WorkerPool<PartUpload> {
    let cos = ctx.cos.clone();
    let buffers = ctx.buffers.clone();
    let metrics = ctx.metrics.clone();

    WorkerPool::new(ctx.concurrency(), cancel, move |token, part: PartUpload| {
        let cos = cos.clone();
        let buffers = buffers.clone();
        let metrics = metrics.clone();
        let session = session.clone();
        async move {
            let _guard = metrics.part_started();
            let len = part.buffer.len() as u64;
            let data = Bytes::from(part.buffer);

            let result = cos
                .upload_part(&token, &session, part.part_number, RequestBody::Bytes(data.clone()))
                .await;
            buffers.release(Vec::from(data));

            let etag = result?;
            metrics.parts_uploaded.inc();
            metrics.bytes_uploaded.inc_by(len);
            debug!(
                "Part {} of {} stored ({} bytes, etag {})",
                part.part_number, session.file_id, len, etag
            );
            Ok(())
        }
    })
}

/// Read the source into parts and submit them; returns the part count
async fn produce_parts<R>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    pool: &mut WorkerPool<PartUpload>,
    reader: &mut R,
    expected: Option<u64>,
) -> Result<u32>
where
    R: AsyncRead + Unpin + Send,
{
    let mut part_number = 0u32;
    let mut total = 0u64;

    loop {
        let mut buffer = ctx.buffers.acquire();
        let n = match read_full(cancel, reader, &mut buffer).await {
            Ok(n) => n,
            Err(e) => {
                ctx.buffers.release(buffer);
                return Err(e);
            }
        };
        total += n as u64;
        let short = n < buffer.len();

        if let Some(expected) = expected {
            if short && total < expected {
                ctx.buffers.release(buffer);
                return Err(TransferError::SourceTruncated {
                    expected,
                    actual: total,
                });
            }
        }

        // Zero bytes at a part boundary ends the source; an empty source
        // still uploads one empty part
        if n == 0 && part_number > 0 {
            ctx.buffers.release(buffer);
            break;
        }

        buffer.truncate(n);
        part_number += 1;
        pool.submit(
            PartUpload {
                part_number,
                buffer,
            },
            short,
        )
        .await?;

        if short {
            break;
        }
    }

    Ok(part_number)
}

/// Fill `buf` unless the source ends first; returns the bytes read
async fn read_full<R>(cancel: &CancellationToken, reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            n = reader.read(&mut buf[filled..]) => n?,
        };
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
