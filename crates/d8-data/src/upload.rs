//! Sequential, resumable chunked upload of one local file.
//!
//! The file is sent as byte ranges, one PUT at a time. Each PUT carries the
//! total size, the current offset and the source file's ownership and mode.
//! The server may answer with `X-Next-Offset` to move the cursor forward
//! (for data it already holds); it may never move it backwards.

use crate::http::{check_progress, files_url, parse_offset};
use crate::{
    CancelToken, HttpClient, TransferError, TransferSession, HEADER_CONTENT_LENGTH, HEADER_GID,
    HEADER_NEXT_OFFSET, HEADER_OFFSET, HEADER_PERMISSIONS, HEADER_UID,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Consecutive responses that leave the offset unchanged before giving up.
const MAX_STALLED_CHUNKS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Number of byte ranges the file is split into; clamped to at least 1.
    pub chunks: usize,
    /// Ask the server for its current offset before sending anything.
    pub resume: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunks: crate::config::DEFAULT_CHUNKS,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub total_bytes: u64,
    pub resumed_from: u64,
    pub bytes_sent: u64,
    pub requests: usize,
}

/// Upload position. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadCursor {
    offset: u64,
}

impl UploadCursor {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move past `sent` bytes acknowledged without an explicit next offset.
    pub fn advance(&mut self, sent: u64) {
        self.offset += sent;
    }

    /// Take the server's next offset for the chunk sent at the current offset.
    pub fn adopt(&mut self, next: u64) -> Result<(), TransferError> {
        if next < self.offset {
            return Err(TransferError::OffsetRegression {
                sent: self.offset,
                next,
            });
        }
        self.offset = next;
        Ok(())
    }
}

/// `ceil(total / chunks)`, with `chunks` clamped to at least 1.
pub fn chunk_size(total: u64, chunks: usize) -> u64 {
    total.div_ceil(chunks.max(1) as u64)
}

type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

pub struct Uploader {
    client: Arc<dyn HttpClient>,
    base_url: String,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
}

impl Uploader {
    pub fn new(client: Arc<dyn HttpClient>, base_url: &str, cancel: CancelToken) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            cancel,
            progress: None,
        }
    }

    pub fn from_session(session: &TransferSession, cancel: CancelToken) -> Self {
        Self::new(Arc::clone(&session.client), &session.base_url, cancel)
    }

    /// Called with `(acknowledged, total)` after every chunk.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn upload(
        &self,
        dst_path: &str,
        local: &Path,
        options: UploadOptions,
    ) -> Result<UploadReport, TransferError> {
        let url = files_url(&self.base_url, dst_path);
        let mut file = File::open(local)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(TransferError::Config(format!(
                "{} is not a regular file",
                local.display()
            )));
        }
        let total = meta.len();
        let permissions = format!("{:04o}", meta.mode() & 0o7777);
        let uid = meta.uid().to_string();
        let gid = meta.gid().to_string();

        let start = if options.resume {
            self.cancel.check()?;
            check_progress(self.client.as_ref(), &url)?
        } else {
            0
        };
        if start > total {
            return Err(TransferError::Protocol(format!(
                "remote already holds {start} bytes but {} has only {total}",
                local.display()
            )));
        }
        if options.resume {
            info!("resuming upload of {} at offset {start}", local.display());
        }

        let chunk = chunk_size(total, options.chunks);
        let mut cursor = UploadCursor::new(start);
        let mut report = UploadReport {
            total_bytes: total,
            resumed_from: start,
            bytes_sent: 0,
            requests: 0,
        };
        let mut stalled = 0usize;

        // An empty file still needs one request so the destination exists.
        let mut pending_empty = total == 0 && start == 0;

        while cursor.offset() < total || pending_empty {
            pending_empty = false;
            self.cancel.check()?;

            let offset = cursor.offset();
            let len = chunk.min(total - offset);
            file.seek(SeekFrom::Start(offset))?;
            let headers = [
                (HEADER_CONTENT_LENGTH, total.to_string()),
                (HEADER_PERMISSIONS, permissions.clone()),
                (HEADER_UID, uid.clone()),
                (HEADER_GID, gid.clone()),
                (HEADER_OFFSET, offset.to_string()),
            ];
            let mut range = (&file).take(len);
            let resp = self.client.put(&url, &headers, &mut range, len)?;
            report.requests += 1;
            report.bytes_sent += len;

            if !resp.is_success() {
                let status = resp.status;
                return Err(TransferError::Status {
                    context: format!("upload chunk at offset {offset}"),
                    status,
                    body: resp.error_body(),
                });
            }

            match resp.header(HEADER_NEXT_OFFSET) {
                Some(value) => {
                    let next = parse_offset(value)?;
                    cursor.adopt(next)?;
                    if next == offset && total > 0 {
                        stalled += 1;
                        if stalled >= MAX_STALLED_CHUNKS {
                            return Err(TransferError::Protocol(format!(
                                "server did not advance past offset {offset} after {stalled} chunks"
                            )));
                        }
                    } else {
                        stalled = 0;
                    }
                }
                None => cursor.advance(len),
            }
            debug!(
                "chunk at {offset} ({len} bytes) accepted, next offset {}",
                cursor.offset()
            );
            if let Some(ref progress) = self.progress {
                progress(cursor.offset().min(total), total);
            }
        }

        info!(
            "uploaded {} to {dst_path} ({} bytes sent in {} requests)",
            local.display(),
            report.bytes_sent,
            report.requests
        );
        Ok(report)
    }
}
