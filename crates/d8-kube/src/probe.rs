//! [`ClusterProbe`] over the `default/kubernetes` Service.

use crate::KubeContext;
use d8_data::{CancelToken, ClusterProbe, ProbeError, ServiceIdentity, INTERNAL_PROBE_TIMEOUT};
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use std::time::Duration;
use tracing::debug;

const SERVICE_NAMESPACE: &str = "default";
const SERVICE_NAME: &str = "kubernetes";
/// Name the API server certificate is issued for inside the cluster.
const SERVICE_DNS: &str = "kubernetes.default.svc";

pub struct KubeClusterProbe<'a> {
    ctx: &'a KubeContext,
}

impl<'a> KubeClusterProbe<'a> {
    pub fn new(ctx: &'a KubeContext) -> Self {
        Self { ctx }
    }
}

pub(crate) fn identity(svc: &Service) -> Result<ServiceIdentity, ProbeError> {
    let uid = svc
        .metadata
        .uid
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProbeError::Other("service has no uid".to_owned()))?;
    let spec = svc
        .spec
        .as_ref()
        .ok_or_else(|| ProbeError::Other("service has no spec".to_owned()))?;
    let cluster_ip = spec
        .cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
        .ok_or_else(|| ProbeError::Other("service has no cluster IP".to_owned()))?;
    let port = spec
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.port)
        .ok_or_else(|| ProbeError::Other("service exposes no ports".to_owned()))?;
    let port = u16::try_from(port)
        .map_err(|_| ProbeError::Other(format!("service port {port} out of range")))?;
    Ok(ServiceIdentity {
        uid,
        cluster_ip,
        port,
    })
}

pub(crate) fn internal_url(service: &ServiceIdentity) -> String {
    if service.cluster_ip.contains(':') {
        format!("https://[{}]:{}", service.cluster_ip, service.port)
    } else {
        format!("https://{}:{}", service.cluster_ip, service.port)
    }
}

async fn cancelled(token: &CancelToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Why `token` fired: an interrupt, or the deadline passing without an answer.
pub(crate) fn stop_reason(token: &CancelToken, url: &str) -> ProbeError {
    if token.is_interrupted() {
        ProbeError::Cancelled
    } else {
        ProbeError::Unreachable(format!("no answer from {url} before the deadline"))
    }
}

impl ClusterProbe for KubeClusterProbe<'_> {
    fn via_current_endpoint(&self, cancel: &CancelToken) -> Result<ServiceIdentity, ProbeError> {
        let api: Api<Service> = Api::namespaced(self.ctx.client(), SERVICE_NAMESPACE);
        self.ctx.block_on(async {
            tokio::select! {
                res = api.get(SERVICE_NAME) => match res {
                    Ok(svc) => identity(&svc),
                    Err(e) => Err(ProbeError::classify(&e)),
                },
                () = cancelled(cancel) => Err(ProbeError::Cancelled),
            }
        })
    }

    fn via_internal_address(
        &self,
        service: &ServiceIdentity,
        cancel: &CancelToken,
    ) -> Result<ServiceIdentity, ProbeError> {
        let timeout = cancel.remaining().unwrap_or(INTERNAL_PROBE_TIMEOUT);
        let url = internal_url(service);
        debug!("probing {url} with server name {SERVICE_DNS} ({timeout:?})");

        let mut config = self.ctx.config().clone();
        config.cluster_url = match url.parse() {
            Ok(uri) => uri,
            Err(e) => return Err(ProbeError::Other(format!("invalid probe URL {url}: {e}"))),
        };
        config.tls_server_name = Some(SERVICE_DNS.to_owned());
        // Transport timeouts cover DNS and the TLS handshake; the outer
        // timeout covers the request itself.
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);

        self.ctx.block_on(async {
            let client = Client::try_from(config).map_err(|e| ProbeError::classify(&e))?;
            let api: Api<Service> = Api::namespaced(client, SERVICE_NAMESPACE);
            tokio::select! {
                res = tokio::time::timeout(timeout, api.get(SERVICE_NAME)) => match res {
                    Err(_) => Err(ProbeError::Unreachable(format!(
                        "no answer from {url} within {timeout:?}"
                    ))),
                    Ok(Err(e)) => Err(ProbeError::classify(&e)),
                    Ok(Ok(svc)) => identity(&svc),
                },
                () = cancelled(cancel) => Err(stop_reason(cancel, &url)),
            }
        })
    }
}
