//! Download orchestration
//!
//! A HEAD probe sizes the object. Small objects are fetched with one GET;
//! larger ones are split into ranged GETs run by the worker pool, each part
//! written at its own offset into the destination.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::fan_in::{fan_in, BufferStrategy, FanInReader};
use super::planner::{plan_ranges, TransferRange};
use super::pool::WorkerPool;
use super::sink::{FileWriteAt, SharedBuffer, WriteAt};
use super::TransferContext;
use crate::error::{Result, TransferError};
use crate::metrics::TransferMetrics;
use crate::storage::{CosClient, RequestBody};

type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Object body as an ordered byte stream
///
/// Backed either by a single GET response or by a fan-in buffer fed by a
/// background multipart download. Dropping the reader cancels the
/// background transfer.
pub struct ObjectReader {
    inner: ReaderInner,
    _transfer: Option<DropGuard>,
}

enum ReaderInner {
    Direct(StreamReader<ByteStream, Bytes>),
    FanIn(FanInReader),
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ReaderInner::Direct(r) => Pin::new(r).poll_read(cx, buf),
            ReaderInner::FanIn(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Open an object as a stream; returns the reader and the object size
pub(crate) async fn download(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
) -> Result<(ObjectReader, u64)> {
    let size = ctx.cos.file_size(cancel, key).await?;
    let reader = open_reader(ctx, cancel, key, size).await?;
    Ok((reader, size))
}

/// Download an object into memory
pub(crate) async fn download_bytes(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
) -> Result<Bytes> {
    let size = ctx.cos.file_size(cancel, key).await?;
    if !ctx.config.use_multipart(size) {
        let resp = get(&ctx.cos, cancel, key, None).await?;
        let body = ctx.cos.read_body(cancel, resp).await?;
        ctx.metrics.bytes_downloaded.inc_by(body.len() as u64);
        return Ok(body);
    }

    let len = usize::try_from(size).map_err(|_| TransferError::InvalidArgument {
        reason: format!("object of {} bytes does not fit in memory", size),
    })?;
    let buffer = Arc::new(SharedBuffer::new(len));
    download_parts(ctx, cancel, key, size, buffer.clone()).await?;
    Ok(buffer.take())
}

/// Copy an object into `writer`; returns the bytes written
pub(crate) async fn download_to_writer<W>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    writer: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let size = ctx.cos.file_size(cancel, key).await?;
    download_to_writer_with_size(ctx, cancel, key, size, writer).await
}

/// Copy an object of known `size` into `writer` without probing it first
pub(crate) async fn download_to_writer_with_size<W>(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    size: u64,
    writer: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = open_reader(ctx, cancel, key, size).await?;
    let copied = tokio::io::copy(&mut reader, writer).await?;
    writer.flush().await?;

    if copied != size {
        return Err(TransferError::PartSizeMismatch {
            offset: 0,
            end: size.saturating_sub(1),
            expected: size,
            actual: copied,
        });
    }
    Ok(copied)
}

/// Download an object into a positional destination
pub(crate) async fn download_to_writer_at(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    sink: Arc<dyn WriteAt>,
) -> Result<()> {
    let size = ctx.cos.file_size(cancel, key).await?;
    write_object(ctx, cancel, key, size, sink).await
}

/// Download an object to a local file, removing it on failure
pub(crate) async fn download_to_disk(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    path: &Path,
) -> Result<()> {
    let size = ctx.cos.file_size(cancel, key).await?;
    let file = Arc::new(FileWriteAt::create(path).await?);

    let result = match write_object(ctx, cancel, key, size, file.clone()).await {
        Ok(()) => file.sync().await,
        Err(e) => Err(e),
    };
    drop(file);

    if let Err(e) = result {
        if let Err(remove_err) = tokio::fs::remove_file(path).await {
            warn!(
                "Failed to remove partial download {}: {}",
                path.display(),
                remove_err
            );
        }
        return Err(e);
    }
    info!("Downloaded {} to {} ({} bytes)", key, path.display(), size);
    Ok(())
}

async fn write_object(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    size: u64,
    sink: Arc<dyn WriteAt>,
) -> Result<()> {
    if ctx.config.use_multipart(size) {
        return download_parts(ctx, cancel, key, size, sink).await;
    }

    let resp = get(&ctx.cos, cancel, key, None).await?;
    let mut body = resp.bytes_stream();
    let mut offset = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        sink.write_at(offset, &chunk).await?;
        offset += chunk.len() as u64;
    }
    ctx.metrics.bytes_downloaded.inc_by(offset);
    Ok(())
}

async fn open_reader(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    size: u64,
) -> Result<ObjectReader> {
    if !ctx.config.use_multipart(size) {
        let resp = get(&ctx.cos, cancel, key, None).await?;
        let metrics = ctx.metrics.clone();
        let body: ByteStream = resp
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(b) => {
                    metrics.bytes_downloaded.inc_by(b.len() as u64);
                    Ok(b)
                }
                Err(e) => Err(TransferError::from(e).into_io()),
            })
            .boxed();
        return Ok(ObjectReader {
            inner: ReaderInner::Direct(StreamReader::new(cancellable(body, cancel.clone()))),
            _transfer: None,
        });
    }

    let strategy = if ctx.config.buffer_in_memory {
        BufferStrategy::Memory
    } else {
        BufferStrategy::SpillFile
    };
    let window = (ctx.concurrency() as u64 + 1).saturating_mul(ctx.part_size());
    let (writer, reader) = fan_in(strategy, window)?;

    let token = cancel.child_token();
    let guard = token.clone().drop_guard();
    let ctx = ctx.clone();
    let key = key.to_string();
    tokio::spawn(async move {
        let sink: Arc<dyn WriteAt> = Arc::new(writer.clone());
        match download_parts(&ctx, &token, &key, size, sink).await {
            Ok(()) => writer.finish(),
            Err(e) => {
                debug!("Streaming download of {} failed: {}", key, e);
                writer.close_with_error(e);
            }
        }
    });

    Ok(ObjectReader {
        inner: ReaderInner::FanIn(reader),
        _transfer: Some(guard),
    })
}

/// Multipart download of `[0, size)` into `sink`
async fn download_parts(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    key: &str,
    size: u64,
    sink: Arc<dyn WriteAt>,
) -> Result<()> {
    let ranges = plan_ranges(size, ctx.part_size());
    info!(
        "Multipart download of {} started ({} bytes, {} parts)",
        key,
        size,
        ranges.len()
    );

    let cos = ctx.cos.clone();
    let metrics = ctx.metrics.clone();
    let file_id: Arc<str> = Arc::from(key);
    let mut pool = WorkerPool::new(ctx.concurrency(), cancel, move |token, range: TransferRange| {
        let cos = cos.clone();
        let metrics = metrics.clone();
        let sink = sink.clone();
        let file_id = file_id.clone();
        async move { download_part(&cos, &metrics, &token, &file_id, range, sink.as_ref()).await }
    });

    let last = ranges.len().saturating_sub(1);
    let mut result = Ok(());
    for (i, range) in ranges.into_iter().enumerate() {
        if let Err(e) = pool.submit(range, i == last).await {
            result = Err(e);
            break;
        }
    }
    if result.is_ok() {
        result = pool.join(false).await;
    }

    if result.is_err() {
        // No writes may land after the caller sees the error
        pool.cancel();
        let _ = pool.join(true).await;
    }
    result
}

/// Fetch one range, streaming it into `sink` at the range offset
async fn download_part(
    cos: &CosClient,
    metrics: &TransferMetrics,
    cancel: &CancellationToken,
    key: &str,
    range: TransferRange,
    sink: &dyn WriteAt,
) -> Result<()> {
    let _guard = metrics.part_started();
    let resp = get(cos, cancel, key, Some(range)).await?;

    let expected = range.len();
    let mismatch = |actual| TransferError::PartSizeMismatch {
        offset: range.offset,
        end: range.end,
        expected,
        actual,
    };

    let mut received = 0u64;
    let mut body = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        let total = received + chunk.len() as u64;
        if total > expected {
            return Err(mismatch(total));
        }
        sink.write_at(range.offset + received, &chunk).await?;
        received = total;
    }

    if received != expected {
        return Err(mismatch(received));
    }
    metrics.parts_downloaded.inc();
    metrics.bytes_downloaded.inc_by(received);
    debug!("Part {}-{} of {} received", range.offset, range.end, key);
    Ok(())
}

async fn get(
    cos: &CosClient,
    cancel: &CancellationToken,
    key: &str,
    range: Option<TransferRange>,
) -> Result<reqwest::Response> {
    let mut headers = HeaderMap::new();
    if let Some(range) = range {
        let value = HeaderValue::from_str(&range.header_value())
            .map_err(|e| TransferError::internal(format!("range header: {}", e)))?;
        headers.insert(RANGE, value);
    }
    cos.execute(cancel, Method::GET, key, &[], headers, RequestBody::Empty)
        .await
}

/// End a body stream with an error once `cancel` fires
fn cancellable(body: ByteStream, cancel: CancellationToken) -> ByteStream {
    stream::unfold((body, cancel), |(mut body, cancel)| async move {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Err(TransferError::Cancelled.into_io())),
            item = body.next() => item,
        };
        item.map(|item| (item, (body, cancel)))
    })
    .boxed()
}
