//! Internal vs. published endpoint selection.
//!
//! When `--publish` is omitted the resolver compares the cluster's
//! `kubernetes` Service as seen through the kubeconfig endpoint with the same
//! Service fetched directly from its ClusterIP. Reaching the same object means
//! the cluster network is routable from here and the internal URL works.

use crate::{CancelToken, TransferError};
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Budget for the direct ClusterIP probe, covering DNS, TLS and the request.
pub const INTERNAL_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The `--publish` flag after parsing: `explicit` is false when omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishDecision {
    pub explicit: bool,
    pub value: bool,
}

impl PublishDecision {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(value) => Self {
                explicit: true,
                value,
            },
            None => Self::auto(),
        }
    }

    pub fn auto() -> Self {
        Self {
            explicit: false,
            value: false,
        }
    }
}

/// Identity and address of the probed Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub uid: String,
    pub cluster_ip: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("network unreachable: {0}")]
    Unreachable(String),
    #[error("interrupted")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// Classify a transport error by walking its source chain.
    pub fn classify(err: &(dyn StdError + 'static)) -> Self {
        if is_network_unreachable(err) {
            ProbeError::Unreachable(err.to_string())
        } else {
            ProbeError::Other(err.to_string())
        }
    }
}

/// The two Service lookups auto-detection needs.
pub trait ClusterProbe {
    /// Fetch the Service through the endpoint the user is configured for.
    /// Returns [`ProbeError::Cancelled`] once `cancel` is interrupted.
    fn via_current_endpoint(&self, cancel: &CancelToken) -> Result<ServiceIdentity, ProbeError>;

    /// Fetch the same Service directly from `service.cluster_ip`, validating
    /// TLS against the in-cluster DNS name. Gives up once `cancel` fires:
    /// [`ProbeError::Cancelled`] when interrupted, `Unreachable` when its
    /// deadline passed.
    fn via_internal_address(
        &self,
        service: &ServiceIdentity,
        cancel: &CancelToken,
    ) -> Result<ServiceIdentity, ProbeError>;
}

/// Decide whether data-plane traffic should use the published URL.
pub fn resolve_publish(
    decision: PublishDecision,
    probe: &dyn ClusterProbe,
    cancel: &CancelToken,
) -> Result<bool, TransferError> {
    if decision.explicit {
        return Ok(decision.value);
    }
    cancel.check()?;

    let current = match probe.via_current_endpoint(cancel) {
        Ok(svc) => svc,
        Err(ProbeError::Cancelled) => return Err(TransferError::Cancelled),
        Err(e) => {
            cancel.check()?;
            info!("publish auto-detect: cluster API probe failed: {e}");
            return Err(TransferError::AmbiguousPublish(format!(
                "cannot query the cluster API: {e}"
            )));
        }
    };
    info!(
        "publish auto-detect: probing {}:{} directly",
        current.cluster_ip, current.port
    );

    let probe_cancel = cancel.child_with_timeout(INTERNAL_PROBE_TIMEOUT);
    match probe.via_internal_address(&current, &probe_cancel) {
        Err(ProbeError::Cancelled) => Err(TransferError::Cancelled),
        Err(ProbeError::Unreachable(reason)) => {
            cancel.check()?;
            info!("publish auto-detect: cluster network unreachable ({reason}), using public URL");
            Ok(true)
        }
        Err(ProbeError::Other(reason)) => {
            cancel.check()?;
            info!("publish auto-detect: direct probe failed ({reason})");
            Err(TransferError::AmbiguousPublish(format!(
                "direct cluster probe failed: {reason}"
            )))
        }
        Ok(direct) if direct.uid != current.uid => {
            info!(
                "publish auto-detect: {} answered with a different cluster (uid {} != {}), using public URL",
                current.cluster_ip, direct.uid, current.uid
            );
            Ok(true)
        }
        Ok(_) => {
            info!("publish auto-detect: cluster network reachable, using internal URL");
            Ok(false)
        }
    }
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "deadline",
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "connection refused",
    "no route to host",
    "network is unreachable",
    "host is unreachable",
];

/// True when `err` (or anything in its source chain) means the address
/// cannot be reached at all, as opposed to TLS, auth or RBAC failures.
pub fn is_network_unreachable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
            ) {
                return true;
            }
        }
        let msg = e.to_string().to_ascii_lowercase();
        if UNREACHABLE_MARKERS.iter().any(|m| msg.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeProbe {
        current: Result<&'static str, &'static str>,
        internal: Result<&'static str, ProbeError>,
        calls: Cell<usize>,
        interrupt_during_lookup: bool,
    }

    impl FakeProbe {
        fn new(
            current: Result<&'static str, &'static str>,
            internal: Result<&'static str, ProbeError>,
        ) -> Self {
            Self {
                current,
                internal,
                calls: Cell::new(0),
                interrupt_during_lookup: false,
            }
        }

        /// Raise the interrupt while the first lookup is in progress.
        fn interrupting(mut self) -> Self {
            self.interrupt_during_lookup = true;
            self
        }
    }

    fn identity(uid: &str) -> ServiceIdentity {
        ServiceIdentity {
            uid: uid.to_owned(),
            cluster_ip: "10.222.0.1".to_owned(),
            port: 443,
        }
    }

    impl ClusterProbe for FakeProbe {
        fn via_current_endpoint(&self, cancel: &CancelToken) -> Result<ServiceIdentity, ProbeError> {
            self.calls.set(self.calls.get() + 1);
            if self.interrupt_during_lookup {
                cancel.cancel();
                return Err(ProbeError::Cancelled);
            }
            self.current
                .map(identity)
                .map_err(|e| ProbeError::Other(e.to_owned()))
        }

        fn via_internal_address(
            &self,
            _service: &ServiceIdentity,
            cancel: &CancelToken,
        ) -> Result<ServiceIdentity, ProbeError> {
            self.calls.set(self.calls.get() + 1);
            assert!(cancel.remaining().unwrap() <= INTERNAL_PROBE_TIMEOUT);
            match &self.internal {
                Ok(uid) => Ok(identity(uid)),
                Err(ProbeError::Unreachable(m)) => Err(ProbeError::Unreachable(m.clone())),
                Err(ProbeError::Other(m)) => Err(ProbeError::Other(m.clone())),
                Err(ProbeError::Cancelled) => Err(ProbeError::Cancelled),
            }
        }
    }

    #[test]
    fn explicit_value_skips_network() {
        let probe = FakeProbe::new(Err("unused"), Err(ProbeError::Other("unused".into())));
        let token = CancelToken::new();
        assert!(!resolve_publish(PublishDecision::from_flag(Some(false)), &probe, &token).unwrap());
        assert!(resolve_publish(PublishDecision::from_flag(Some(true)), &probe, &token).unwrap());
        assert_eq!(probe.calls.get(), 0);
    }

    #[test]
    fn first_probe_failure_is_ambiguous() {
        let probe = FakeProbe::new(Err("services \"kubernetes\" not found"), Ok("abc"));
        let err = resolve_publish(PublishDecision::auto(), &probe, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TransferError::AmbiguousPublish(_)));
        assert!(err.to_string().contains("--publish"));
        assert_eq!(probe.calls.get(), 1);
    }

    #[test]
    fn unreachable_internal_address_publishes() {
        let probe = FakeProbe::new(
            Ok("abc"),
            Err(ProbeError::Unreachable("i/o timeout".into())),
        );
        assert!(resolve_publish(PublishDecision::auto(), &probe, &CancelToken::new()).unwrap());
        assert_eq!(probe.calls.get(), 2);
    }

    #[test]
    fn other_internal_failure_is_ambiguous() {
        let probe = FakeProbe::new(
            Ok("abc"),
            Err(ProbeError::Other("x509: certificate signed by unknown authority".into())),
        );
        let err = resolve_publish(PublishDecision::auto(), &probe, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TransferError::AmbiguousPublish(_)));
    }

    #[test]
    fn different_uid_publishes() {
        let probe = FakeProbe::new(Ok("abc"), Ok("xyz"));
        assert!(resolve_publish(PublishDecision::auto(), &probe, &CancelToken::new()).unwrap());
    }

    #[test]
    fn matching_uid_stays_internal() {
        let probe = FakeProbe::new(Ok("abc"), Ok("abc"));
        assert!(!resolve_publish(PublishDecision::auto(), &probe, &CancelToken::new()).unwrap());
        assert_eq!(probe.calls.get(), 2);
    }

    #[test]
    fn cancelled_parent_aborts_before_probing() {
        let probe = FakeProbe::new(Ok("abc"), Ok("abc"));
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            resolve_publish(PublishDecision::auto(), &probe, &token),
            Err(TransferError::Cancelled)
        ));
        assert_eq!(probe.calls.get(), 0);
    }

    #[test]
    fn interrupt_during_api_lookup_is_cancelled() {
        let probe = FakeProbe::new(Ok("abc"), Ok("abc")).interrupting();
        let token = CancelToken::new();
        assert!(matches!(
            resolve_publish(PublishDecision::auto(), &probe, &token),
            Err(TransferError::Cancelled)
        ));
        assert_eq!(probe.calls.get(), 1);
    }

    #[test]
    fn failed_api_lookup_after_interrupt_is_cancelled() {
        struct Interrupted;
        impl ClusterProbe for Interrupted {
            fn via_current_endpoint(
                &self,
                cancel: &CancelToken,
            ) -> Result<ServiceIdentity, ProbeError> {
                cancel.cancel();
                Err(ProbeError::Other("request aborted".into()))
            }
            fn via_internal_address(
                &self,
                _service: &ServiceIdentity,
                _cancel: &CancelToken,
            ) -> Result<ServiceIdentity, ProbeError> {
                unreachable!("second lookup after interrupt")
            }
        }
        assert!(matches!(
            resolve_publish(PublishDecision::auto(), &Interrupted, &CancelToken::new()),
            Err(TransferError::Cancelled)
        ));
    }

    #[test]
    fn cancelled_direct_lookup_never_publishes() {
        let probe = FakeProbe::new(Ok("abc"), Err(ProbeError::Cancelled));
        let token = CancelToken::new();
        assert!(matches!(
            resolve_publish(PublishDecision::auto(), &probe, &token),
            Err(TransferError::Cancelled)
        ));
        assert_eq!(probe.calls.get(), 2);
    }

    #[test]
    fn classify_io_error_kinds() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "forbidden");
        assert!(is_network_unreachable(&timeout));
        assert!(is_network_unreachable(&refused));
        assert!(!is_network_unreachable(&denied));
    }

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct Wrapper(#[source] io::Error);

    #[test]
    fn classify_walks_source_chain() {
        let dns = Wrapper(io::Error::other("dns error: failed to lookup address information"));
        assert!(is_network_unreachable(&dns));
        assert!(matches!(ProbeError::classify(&dns), ProbeError::Unreachable(_)));

        let tls = Wrapper(io::Error::other("invalid peer certificate: UnknownIssuer"));
        assert!(!is_network_unreachable(&tls));
        assert!(matches!(ProbeError::classify(&tls), ProbeError::Other(_)));
    }
}
