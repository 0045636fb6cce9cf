//! COS storage access
//!
//! Signed transport, control-plane calls (multipart sessions, listing,
//! deletion) and the part buffer pool.

pub mod buffer_pool;
pub mod client;
pub mod delete;
pub mod multipart;
pub mod query;
pub mod signer;

pub use buffer_pool::ByteBufferPool;
pub use client::{CosClient, RequestBody};
pub use multipart::{MultipartSession, UploadedPart};
pub use query::{FileInfo, ObjectEntry};
pub use signer::{HmacSha1Signer, Signer};

use crate::error::{Result, TransferError};

/// Normalize a file id into an object key
///
/// Trims surrounding `/`, resolves `.` and `..` segments lexically and strips
/// any leading `.` or `/` left over. An empty result is rejected.
pub fn normalize_file_id(file_id: &str) -> Result<String> {
    let cleaned = clean_path(file_id.trim_matches('/'));
    let key = cleaned.trim_start_matches('.').trim_start_matches('/');
    if key.is_empty() {
        return Err(TransferError::InvalidFileId {
            raw: file_id.to_string(),
        });
    }
    Ok(key.to_string())
}

/// Lexical path cleaning for a relative path
pub(crate) fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return ".".to_string();
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_file_id() {
        assert_eq!(normalize_file_id("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_file_id("a//b/./c/").unwrap(), "a/b/c");
        assert_eq!(normalize_file_id("a/x/../b").unwrap(), "a/b");
        assert_eq!(normalize_file_id("../a").unwrap(), "a");
        assert_eq!(normalize_file_id("./a").unwrap(), "a");
        assert_eq!(normalize_file_id(".hidden").unwrap(), "hidden");
    }

    #[test]
    fn test_empty_file_id_rejected() {
        for raw in ["", "/", "//", ".", "./", "a/..", "a/../.."] {
            let err = normalize_file_id(raw).unwrap_err();
            assert!(matches!(err, TransferError::InvalidFileId { .. }), "{raw:?}");
        }
    }
}
