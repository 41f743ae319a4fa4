//! Kubernetes side of `d8 data`: `DataExport`/`DataImport` resources,
//! readiness polling and the publish-mode probes.
//!
//! The async `kube` client is driven from a private current-thread runtime so
//! the rest of the tool stays blocking.

pub mod probe;
pub mod provider;
pub mod resource;
pub mod status;

pub use probe::KubeClusterProbe;
pub use provider::{KubeEndpointProvider, RetryPolicy, StatusSource};
pub use resource::{ExportTarget, ImportVolume, TransferKind, VolumeKind};
pub use status::EndpointStatus;

use d8_data::TransferError;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("kube config error: {0}")]
    Config(String),
    #[error("kube error: {0}")]
    Api(#[from] kube::Error),
    #[error("kube runtime error: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("kube error: {kind} {namespace}/{name} not ready after {attempts} attempts ({last})")]
    NotReady {
        kind: &'static str,
        namespace: String,
        name: String,
        attempts: u32,
        last: String,
    },
    #[error("kube error: invalid status: {0}")]
    InvalidStatus(String),
    #[error("kube error: invalid target '{0}': expected KIND/NAME with KIND one of pvc, vs, vd, vds")]
    InvalidTarget(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<KubeError> for TransferError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::Cancelled => TransferError::Cancelled,
            other => TransferError::Endpoint(other.to_string()),
        }
    }
}

/// Where to find cluster credentials. Both fields fall back to the usual
/// `KUBECONFIG` / in-cluster discovery when unset.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// A connected client plus the runtime that drives it.
pub struct KubeContext {
    runtime: tokio::runtime::Runtime,
    client: Client,
    config: Config,
}

impl KubeContext {
    pub fn connect(options: &ConnectOptions) -> Result<Self, KubeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            cluster: None,
            user: None,
        };
        let config = runtime.block_on(async {
            match (&options.kubeconfig, &options.context) {
                (Some(path), _) => {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        KubeError::Config(format!("failed to read {}: {e}", path.display()))
                    })?;
                    Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                        .await
                        .map_err(|e| KubeError::Config(e.to_string()))
                }
                (None, Some(_)) => Config::from_kubeconfig(&kube_options)
                    .await
                    .map_err(|e| KubeError::Config(e.to_string())),
                (None, None) => Config::infer()
                    .await
                    .map_err(|e| KubeError::Config(e.to_string())),
            }
        })?;
        debug!(
            "kube endpoint {} (default namespace {})",
            config.cluster_url, config.default_namespace
        );

        // The client spawns its buffer task, so it must be built on the runtime.
        let client = runtime.block_on(async { Client::try_from(config.clone()) })?;
        Ok(Self {
            runtime,
            client,
            config,
        })
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Namespace from the active kubeconfig context.
    pub fn default_namespace(&self) -> &str {
        &self.config.default_namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_survives_conversion() {
        let err: TransferError = KubeError::Cancelled.into();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn other_errors_become_endpoint_errors() {
        let err: TransferError = KubeError::NotReady {
            kind: "DataExport",
            namespace: "d8".to_owned(),
            name: "exp".to_owned(),
            attempts: 60,
            last: "not found".to_owned(),
        }
        .into();
        let msg = err.to_string();
        assert!(matches!(err, TransferError::Endpoint(_)));
        assert!(msg.contains("d8/exp not ready after 60 attempts"), "{msg}");
    }

    #[test]
    fn missing_kubeconfig_file_is_config_error() {
        let dir = std::env::temp_dir().join("d8-kube-missing-kubeconfig");
        let options = ConnectOptions {
            kubeconfig: Some(dir.join("nope.yaml")),
            context: None,
        };
        let err = KubeContext::connect(&options).err().unwrap();
        assert!(matches!(err, KubeError::Config(_)));
        assert!(err.to_string().starts_with("kube config error"));
    }
}
