//! Volume data transfer between a local filesystem and an in-cluster
//! exporter/importer endpoint.
//!
//! This crate provides the HTTP capability the transfer engines talk through,
//! the publish-mode resolver that picks the internal or the public endpoint,
//! a recursive concurrent downloader fed by a streaming directory-listing
//! decoder, and a resumable chunked uploader. Kubernetes itself stays behind
//! the [`TransferEndpointProvider`] and [`ClusterProbe`] traits.

pub mod cancel;
pub mod config;
pub mod download;
pub mod endpoint;
pub mod http;
pub mod listing;
pub mod publish;
pub mod upload;

#[cfg(test)]
pub(crate) mod fake;

pub use cancel::{cancel_on_ctrlc, CancelToken};
pub use config::{ClientConfig, DataConfig};
pub use download::{format_binary_si, Downloader, MAX_IN_FLIGHT};
pub use endpoint::{TransferEndpointProvider, TransferSession};
pub use http::{check_progress, HttpClient, HttpResponse, UreqClient};
pub use listing::{DirEntry, EntryKind, ListingDecoder, ListingState};
pub use publish::{
    is_network_unreachable, resolve_publish, ClusterProbe, ProbeError, PublishDecision,
    ServiceIdentity, INTERNAL_PROBE_TIMEOUT,
};
pub use upload::{chunk_size, UploadCursor, UploadOptions, UploadReport, Uploader};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Data-plane route prefix for file trees.
pub const FILES_API: &str = "/api/v1/files";
/// Data-plane route for raw block devices.
pub const BLOCK_API: &str = "/api/v1/block";

pub const HEADER_CONTENT_LENGTH: &str = "X-Content-Length";
pub const HEADER_PERMISSIONS: &str = "X-Attribute-Permissions";
pub const HEADER_UID: &str = "X-Attribute-Uid";
pub const HEADER_GID: &str = "X-Attribute-Gid";
pub const HEADER_OFFSET: &str = "X-Offset";
pub const HEADER_NEXT_OFFSET: &str = "X-Next-Offset";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{context}: unexpected HTTP status {status}{}", format_body(.body))]
    Status {
        context: String,
        status: u16,
        body: String,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("protocol violation: server reported next offset {next} below sent offset {sent}")]
    OffsetRegression { sent: u64, next: u64 },
    #[error("cannot auto-detect publish mode ({0}); pass --publish=true or --publish=false explicitly")]
    AmbiguousPublish(String),
    #[error("transfer endpoint error: {0}")]
    Endpoint(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

/// A directory download that stopped short. `downloaded` counts files that
/// completed anywhere in the tree before and after the failure was observed.
#[derive(Debug, Error)]
#[error("{error} ({downloaded} files downloaded)")]
pub struct DownloadFailure {
    pub downloaded: usize,
    #[source]
    pub error: TransferError,
}

/// How the exported or imported volume is presented by the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Filesystem => f.write_str("Filesystem"),
            VolumeMode::Block => f.write_str("Block"),
        }
    }
}

impl FromStr for VolumeMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" => Ok(VolumeMode::Filesystem),
            "block" => Ok(VolumeMode::Block),
            other => Err(TransferError::Endpoint(format!(
                "unknown volume mode '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_mode_parse_is_case_insensitive() {
        assert_eq!("Block".parse::<VolumeMode>().unwrap(), VolumeMode::Block);
        assert_eq!(
            "filesystem".parse::<VolumeMode>().unwrap(),
            VolumeMode::Filesystem
        );
        assert!("raw".parse::<VolumeMode>().is_err());
    }

    #[test]
    fn status_error_includes_body_only_when_present() {
        let with_body = TransferError::Status {
            context: "GET /x".to_owned(),
            status: 500,
            body: "boom".to_owned(),
        };
        assert_eq!(
            with_body.to_string(),
            "GET /x: unexpected HTTP status 500: boom"
        );
        let without = TransferError::Status {
            context: "GET /x".to_owned(),
            status: 404,
            body: String::new(),
        };
        assert_eq!(without.to_string(), "GET /x: unexpected HTTP status 404");
    }

    #[test]
    fn download_failure_reports_count() {
        let failure = DownloadFailure {
            downloaded: 3,
            error: TransferError::Cancelled,
        };
        assert_eq!(
            failure.to_string(),
            "operation cancelled (3 files downloaded)"
        );
    }
}
