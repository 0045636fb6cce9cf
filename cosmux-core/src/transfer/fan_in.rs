//! Fan-in buffer
//!
//! Turns concurrent writes at arbitrary offsets into one ordered byte
//! stream. Part workers write through [`FanInWriter`]; the consumer reads
//! from [`FanInReader`] in offset order.
//!
//! Two strategies hold data that arrived ahead of the read position:
//! - `Memory`: chunks kept in a map keyed by offset; writers more than
//!   `window` bytes ahead of the reader wait.
//! - `SpillFile`: chunks written to an anonymous temp file; writers never
//!   wait, the reader follows the contiguous watermark.

use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;
use tokio_util::io::StreamReader;

use super::sink::WriteAt;
use crate::error::{Result, TransferError};

/// Largest read issued against the spill file
const SPILL_READ_CHUNK: u64 = 256 * 1024;

/// Where out-of-order chunks wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    Memory,
    SpillFile,
}

enum Store {
    Memory {
        chunks: BTreeMap<u64, Bytes>,
        window: u64,
    },
    Spill {
        /// Written extents, start -> end (exclusive), beyond the watermark
        extents: BTreeMap<u64, u64>,
        watermark: u64,
    },
}

struct State {
    read_pos: u64,
    store: Store,
    /// `Some(Ok)` once every byte was written, `Some(Err)` on failure
    closed: Option<Result<()>>,
    reader_gone: bool,
}

struct Shared {
    state: Mutex<State>,
    spill: Option<tokio::sync::Mutex<File>>,
    readable: Notify,
    writable: Notify,
    writers: AtomicUsize,
}

impl Shared {
    fn close(&self, result: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(result);
            }
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Create a connected writer/reader pair
///
/// `window` bounds how far ahead of the reader the memory strategy accepts
/// data; it is ignored by the spill strategy.
pub fn fan_in(strategy: BufferStrategy, window: u64) -> Result<(FanInWriter, FanInReader)> {
    let (store, spill) = match strategy {
        BufferStrategy::Memory => (
            Store::Memory {
                chunks: BTreeMap::new(),
                window: window.max(1),
            },
            None,
        ),
        BufferStrategy::SpillFile => {
            let file = tempfile::tempfile()?;
            (
                Store::Spill {
                    extents: BTreeMap::new(),
                    watermark: 0,
                },
                Some(tokio::sync::Mutex::new(File::from_std(file))),
            )
        }
    };

    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            read_pos: 0,
            store,
            closed: None,
            reader_gone: false,
        }),
        spill,
        readable: Notify::new(),
        writable: Notify::new(),
        writers: AtomicUsize::new(1),
    });

    let chunks = stream::unfold(shared.clone(), |shared| async move {
        let item = next_chunk(&shared).await?;
        Some((item, shared))
    })
    .boxed();

    let reader = FanInReader {
        inner: StreamReader::new(chunks),
        shared: shared.clone(),
    };
    Ok((FanInWriter { shared }, reader))
}

/// Write half of a fan-in buffer
///
/// Clones share the buffer. If the last clone is dropped before
/// [`finish`](Self::finish) the reader sees an error instead of a short
/// stream.
pub struct FanInWriter {
    shared: Arc<Shared>,
}

impl FanInWriter {
    /// Mark the stream complete; the reader hits EOF after the last byte
    pub fn finish(&self) {
        self.shared.close(Ok(()));
    }

    /// Fail the stream; the reader returns `err` on its next read
    pub fn close_with_error(&self, err: TransferError) {
        self.shared.close(Err(err));
    }

    async fn write_memory(&self, offset: u64, data: &[u8]) -> Result<()> {
        let chunk = Bytes::copy_from_slice(data);
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                check_open(&state)?;
                let read_pos = state.read_pos;
                if let Store::Memory { chunks, window } = &mut state.store {
                    if offset < read_pos.saturating_add(*window) {
                        chunks.insert(offset, chunk);
                        drop(state);
                        self.shared.readable.notify_waiters();
                        return Ok(());
                    }
                }
            }

            notified.await;
        }
    }

    async fn write_spill(&self, file: &tokio::sync::Mutex<File>, offset: u64, data: &[u8]) -> Result<()> {
        check_open(&self.shared.state.lock())?;
        {
            let mut file = file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            // Surface write errors here rather than on the reader's next seek
            file.flush().await?;
        }

        {
            let mut state = self.shared.state.lock();
            if let Store::Spill { extents, watermark } = &mut state.store {
                extents.insert(offset, offset + data.len() as u64);
                while let Some(end) = extents.remove(watermark) {
                    *watermark = end;
                }
            }
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }
}

impl Clone for FanInWriter {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for FanInWriter {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.close(Err(TransferError::internal(
                "fan-in writer dropped before finishing",
            )));
        }
    }
}

#[async_trait]
impl WriteAt for FanInWriter {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &self.shared.spill {
            Some(file) => self.write_spill(file, offset, data).await,
            None => self.write_memory(offset, data).await,
        }
    }
}

fn check_open(state: &State) -> Result<()> {
    if state.reader_gone {
        return Err(TransferError::Cancelled);
    }
    match &state.closed {
        Some(Err(e)) => Err(e.clone()),
        Some(Ok(())) => Err(TransferError::internal("write after fan-in finished")),
        None => Ok(()),
    }
}

enum Next {
    Chunk(Bytes),
    Spill { pos: u64, len: u64 },
    Eof,
    Failed(TransferError),
    Wait,
}

async fn next_chunk(shared: &Shared) -> Option<io::Result<Bytes>> {
    loop {
        let notified = shared.readable.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let read_pos = state.read_pos;
            let next = match &mut state.store {
                Store::Memory { chunks, .. } => match chunks.remove(&read_pos) {
                    Some(chunk) => Next::Chunk(chunk),
                    None => Next::Wait,
                },
                Store::Spill { watermark, .. } if *watermark > read_pos => Next::Spill {
                    pos: read_pos,
                    len: (*watermark - read_pos).min(SPILL_READ_CHUNK),
                },
                Store::Spill { .. } => Next::Wait,
            };
            match (next, &state.closed) {
                (_, Some(Err(e))) => Next::Failed(e.clone()),
                (Next::Wait, Some(Ok(()))) => Next::Eof,
                (Next::Chunk(chunk), _) => {
                    state.read_pos += chunk.len() as u64;
                    Next::Chunk(chunk)
                }
                (other, _) => other,
            }
        };

        match next {
            Next::Chunk(chunk) => {
                shared.writable.notify_waiters();
                return Some(Ok(chunk));
            }
            Next::Spill { pos, len } => {
                let chunk = match read_spill(shared, pos, len).await {
                    Ok(chunk) => chunk,
                    Err(e) => return Some(Err(e.into_io())),
                };
                shared.state.lock().read_pos += len;
                return Some(Ok(chunk));
            }
            Next::Eof => return None,
            Next::Failed(e) => return Some(Err(e.into_io())),
            Next::Wait => notified.await,
        }
    }
}

async fn read_spill(shared: &Shared, pos: u64, len: u64) -> Result<Bytes> {
    let file = shared
        .spill
        .as_ref()
        .ok_or_else(|| TransferError::internal("spill file missing"))?;
    let mut buf = vec![0u8; len as usize];
    let mut file = file.lock().await;
    file.seek(SeekFrom::Start(pos)).await?;
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read half of a fan-in buffer; yields bytes in offset order
pub struct FanInReader {
    inner: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    shared: Arc<Shared>,
}

impl AsyncRead for FanInReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for FanInReader {
    fn drop(&mut self) {
        self.shared.state.lock().reader_gone = true;
        self.shared.writable.notify_waiters();
    }
}
