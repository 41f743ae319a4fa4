use crate::resource::TransferKind;
use crate::status::{pending_reason, ready_endpoint, EndpointStatus};
use crate::{KubeContext, KubeError};
use d8_data::{
    CancelToken, ClientConfig, TransferEndpointProvider, TransferError, TransferSession,
    UreqClient,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for a resource to report a usable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(3),
        }
    }
}

/// Read access to a transfer resource's `status`.
pub trait StatusSource {
    /// `Ok(None)` when the object does not exist (yet); `Value::Null` when it
    /// exists without a status.
    fn fetch_status(
        &self,
        kind: TransferKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, KubeError>;
}

impl StatusSource for KubeContext {
    fn fetch_status(
        &self,
        kind: TransferKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, KubeError> {
        Ok(self
            .get_transfer(kind, namespace, name)?
            .map(|obj| obj.data.get("status").cloned().unwrap_or(Value::Null)))
    }
}

/// [`TransferEndpointProvider`] backed by `DataExport` / `DataImport` status.
pub struct KubeEndpointProvider<'a> {
    source: &'a dyn StatusSource,
    kind: TransferKind,
    client_config: ClientConfig,
    cancel: CancelToken,
    retry: RetryPolicy,
}

impl<'a> KubeEndpointProvider<'a> {
    pub fn new(
        source: &'a dyn StatusSource,
        kind: TransferKind,
        client_config: ClientConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            kind,
            client_config,
            cancel,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn pause(&self) {
        let step = Duration::from_millis(100);
        let mut left = self.retry.interval;
        while !left.is_zero() && !self.cancel.is_cancelled() {
            let nap = left.min(step);
            std::thread::sleep(nap);
            left -= nap;
        }
    }

    /// Poll until the resource is ready with a URL for the requested mode.
    pub fn wait_ready(
        &self,
        name: &str,
        namespace: &str,
        publish: bool,
    ) -> Result<EndpointStatus, KubeError> {
        let kind = self.kind.kind();
        let mut last = String::from("not polled");
        for attempt in 1..=self.retry.attempts {
            if self.cancel.is_cancelled() {
                return Err(KubeError::Cancelled);
            }
            match self.source.fetch_status(self.kind, namespace, name) {
                Ok(Some(status)) => {
                    let status = Some(&status).filter(|v| !v.is_null());
                    if let Some(endpoint) = ready_endpoint(status, publish)? {
                        info!("{kind} {namespace}/{name} ready at {}", endpoint.url);
                        return Ok(endpoint);
                    }
                    last = pending_reason(status, publish);
                }
                Ok(None) => last = "not found".to_owned(),
                Err(e) => last = e.to_string(),
            }
            debug!(
                "{kind} {namespace}/{name} not ready (attempt {attempt}/{}): {last}",
                self.retry.attempts
            );
            if attempt < self.retry.attempts {
                self.pause();
            }
        }
        Err(KubeError::NotReady {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            attempts: self.retry.attempts,
            last,
        })
    }
}

impl TransferEndpointProvider for KubeEndpointProvider<'_> {
    fn prepare(
        &self,
        name: &str,
        namespace: &str,
        publish: bool,
    ) -> Result<TransferSession, TransferError> {
        let endpoint = self.wait_ready(name, namespace, publish)?;
        let mut config = self.client_config.clone();
        if let Some(pem) = endpoint.ca_pem {
            config = config.with_ca(pem);
        }
        let client = UreqClient::new(&config)?;
        Ok(TransferSession {
            base_url: endpoint.url,
            volume_mode: endpoint.volume_mode,
            client: Arc::new(client),
            namespace: namespace.to_owned(),
            resource_name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d8_data::VolumeMode;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    struct ScriptedSource {
        replies: RefCell<VecDeque<Result<Option<Value>, KubeError>>>,
        calls: Cell<u32>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<Option<Value>, KubeError>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl StatusSource for ScriptedSource {
        fn fetch_status(
            &self,
            kind: TransferKind,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Value>, KubeError> {
            assert_eq!(kind, TransferKind::Export);
            assert_eq!((namespace, name), ("d8", "exp"));
            self.calls.set(self.calls.get() + 1);
            self.replies.borrow_mut().pop_front().unwrap_or(Ok(None))
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            interval: Duration::ZERO,
        }
    }

    fn provider(source: &ScriptedSource) -> KubeEndpointProvider<'_> {
        KubeEndpointProvider::new(
            source,
            TransferKind::Export,
            ClientConfig::default(),
            CancelToken::new(),
        )
        .with_retry(fast())
    }

    fn ready_status() -> Value {
        json!({
            "conditions": [{"type": "Ready", "status": "True"}],
            "url": "https://10.0.0.7:8443",
            "volumeMode": "Block",
        })
    }

    #[test]
    fn default_budget_is_three_minutes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 60);
        assert_eq!(policy.interval * policy.attempts, Duration::from_secs(180));
    }

    #[test]
    fn waits_through_pending_states() {
        let source = ScriptedSource::new(vec![
            Ok(None),
            Ok(Some(Value::Null)),
            Ok(Some(ready_status())),
        ]);
        let session = provider(&source).prepare("exp", "d8", false).unwrap();
        assert_eq!(session.base_url, "https://10.0.0.7:8443");
        assert_eq!(session.volume_mode, VolumeMode::Block);
        assert_eq!(session.namespace, "d8");
        assert_eq!(session.resource_name, "exp");
        assert_eq!(source.calls.get(), 3);
    }

    #[test]
    fn api_errors_are_retried() {
        let source = ScriptedSource::new(vec![
            Err(KubeError::Config("connection reset".to_owned())),
            Ok(Some(ready_status())),
        ]);
        assert!(provider(&source).prepare("exp", "d8", false).is_ok());
        assert_eq!(source.calls.get(), 2);
    }

    #[test]
    fn exhausted_budget_reports_last_reason() {
        let source = ScriptedSource::new(Vec::new());
        let err = provider(&source).prepare("exp", "d8", false).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, TransferError::Endpoint(_)));
        assert!(msg.contains("not ready after 3 attempts"), "{msg}");
        assert!(msg.contains("not found"), "{msg}");
        assert_eq!(source.calls.get(), 3);
    }

    #[test]
    fn publish_requires_public_url() {
        let source = ScriptedSource::new(vec![
            Ok(Some(ready_status())),
            Ok(Some(ready_status())),
            Ok(Some(ready_status())),
        ]);
        let err = provider(&source).prepare("exp", "d8", true).unwrap_err();
        assert!(err.to_string().contains("publicURL not set"));
    }

    #[test]
    fn cancelled_token_stops_polling() {
        let source = ScriptedSource::new(Vec::new());
        let token = CancelToken::new();
        token.cancel();
        let provider = KubeEndpointProvider::new(
            &source,
            TransferKind::Export,
            ClientConfig::default(),
            token,
        );
        let err = provider.prepare("exp", "d8", false).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn unusable_ca_fails_client_construction() {
        let mut status = ready_status();
        status["ca"] = json!("bm90IGEgY2VydGlmaWNhdGU=");
        let source = ScriptedSource::new(vec![Ok(Some(status))]);
        let err = provider(&source).prepare("exp", "d8", false).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)), "{err}");
    }
}
