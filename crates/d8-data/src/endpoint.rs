use crate::{HttpClient, TransferError, VolumeMode};
use std::fmt;
use std::sync::Arc;

/// A ready data-plane endpoint for one exporter or importer.
///
/// Lives for the duration of one command; the backing resource may expire on
/// its own TTL independently of this value.
#[derive(Clone)]
pub struct TransferSession {
    pub base_url: String,
    pub volume_mode: VolumeMode,
    pub client: Arc<dyn HttpClient>,
    pub namespace: String,
    pub resource_name: String,
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("base_url", &self.base_url)
            .field("volume_mode", &self.volume_mode)
            .field("namespace", &self.namespace)
            .field("resource_name", &self.resource_name)
            .finish_non_exhaustive()
    }
}

/// Turns a resource name into a ready [`TransferSession`].
///
/// Implementations wait for the resource to become ready (with their own
/// retry budget) and configure the HTTP client's trust for the chosen URL.
pub trait TransferEndpointProvider {
    fn prepare(
        &self,
        name: &str,
        namespace: &str,
        publish: bool,
    ) -> Result<TransferSession, TransferError>;
}
