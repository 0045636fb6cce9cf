//! cosmux - parallel multipart transfers for COS/S3-compatible storage
//!
//! This crate provides:
//! - Signed requests and the multipart control plane (init, part upload,
//!   list, complete, abort)
//! - Part planning and a bounded, fail-fast worker pool
//! - Upload and download orchestration with background abort on failure
//! - A fan-in buffer that reassembles parallel downloads into a stream
//! - Object metadata, listing and batch deletion

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod transfer;

pub use client::Client;
pub use config::{ClientConfig, TransferConfig};
pub use error::{Result, TransferError};
pub use storage::{FileInfo, MultipartSession, ObjectEntry, UploadedPart};
pub use transfer::{BufferStrategy, ObjectReader, TransferRange, WriteAt};

pub use tokio_util::sync::CancellationToken;
