//! Reading the `status` block of a transfer resource.

use crate::KubeError;
use base64::Engine as _;
use d8_data::VolumeMode;
use serde_json::Value;

/// Everything the data plane needs once the resource is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub url: String,
    pub volume_mode: VolumeMode,
    pub ca_pem: Option<Vec<u8>>,
}

fn ready_condition(status: &Value) -> Option<&Value> {
    status
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
}

fn is_ready(status: &Value) -> bool {
    ready_condition(status)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

fn non_empty_str<'a>(status: &'a Value, key: &str) -> Option<&'a str> {
    status
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// `Ok(None)` while the resource is still converging; an error only when the
/// status is ready but unusable.
pub fn ready_endpoint(
    status: Option<&Value>,
    publish: bool,
) -> Result<Option<EndpointStatus>, KubeError> {
    let Some(status) = status else {
        return Ok(None);
    };
    if !is_ready(status) {
        return Ok(None);
    }
    let url_key = if publish { "publicURL" } else { "url" };
    let Some(url) = non_empty_str(status, url_key) else {
        return Ok(None);
    };

    let volume_mode = match non_empty_str(status, "volumeMode") {
        Some(mode) => mode
            .parse()
            .map_err(|_| KubeError::InvalidStatus(format!("unknown volumeMode '{mode}'")))?,
        None => VolumeMode::Filesystem,
    };
    let ca_pem = non_empty_str(status, "ca")
        .map(|ca| {
            base64::engine::general_purpose::STANDARD
                .decode(ca.trim())
                .map_err(|e| KubeError::InvalidStatus(format!("ca is not valid base64: {e}")))
        })
        .transpose()?;

    Ok(Some(EndpointStatus {
        url: url.to_owned(),
        volume_mode,
        ca_pem,
    }))
}

/// Short human description of why the resource is not ready yet.
pub fn pending_reason(status: Option<&Value>, publish: bool) -> String {
    let Some(status) = status else {
        return "no status yet".to_owned();
    };
    if let Some(cond) = ready_condition(status) {
        if !is_ready(status) {
            let reason = cond.get("reason").and_then(Value::as_str).unwrap_or("");
            let message = cond.get("message").and_then(Value::as_str).unwrap_or("");
            return match (reason.is_empty(), message.is_empty()) {
                (true, true) => "Ready condition is not True".to_owned(),
                (false, true) => reason.to_owned(),
                (true, false) => message.to_owned(),
                (false, false) => format!("{reason}: {message}"),
            };
        }
    } else {
        return "no Ready condition".to_owned();
    }
    if publish {
        "publicURL not set".to_owned()
    } else {
        "url not set".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;

    fn ready(extra: &Value) -> Value {
        let mut status = json!({
            "conditions": [{"type": "Ready", "status": "True"}],
        });
        for (k, v) in extra.as_object().unwrap() {
            status[k] = v.clone();
        }
        status
    }

    #[test]
    fn missing_status_is_pending() {
        assert_eq!(ready_endpoint(None, false).unwrap(), None);
        assert_eq!(pending_reason(None, false), "no status yet");
    }

    #[test]
    fn not_ready_condition_is_pending_with_reason() {
        let status = json!({
            "conditions": [{"type": "Ready", "status": "False", "reason": "Provisioning", "message": "waiting for pod"}],
            "url": "https://10.0.0.5",
        });
        assert_eq!(ready_endpoint(Some(&status), false).unwrap(), None);
        assert_eq!(
            pending_reason(Some(&status), false),
            "Provisioning: waiting for pod"
        );
    }

    #[test]
    fn ready_picks_internal_or_public_url() {
        let status = ready(&json!({
            "url": "https://10.0.0.5:8443",
            "publicURL": "https://data.example.com/ns/exp",
            "volumeMode": "Block",
        }));
        let internal = ready_endpoint(Some(&status), false).unwrap().unwrap();
        assert_eq!(internal.url, "https://10.0.0.5:8443");
        assert_eq!(internal.volume_mode, VolumeMode::Block);
        assert_eq!(internal.ca_pem, None);

        let public = ready_endpoint(Some(&status), true).unwrap().unwrap();
        assert_eq!(public.url, "https://data.example.com/ns/exp");
    }

    #[test]
    fn ready_without_requested_url_keeps_waiting() {
        let status = ready(&json!({"url": "https://10.0.0.5"}));
        assert_eq!(ready_endpoint(Some(&status), true).unwrap(), None);
        assert_eq!(pending_reason(Some(&status), true), "publicURL not set");
    }

    #[test]
    fn ca_is_base64_decoded() {
        let pem = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(pem);
        let status = ready(&json!({"url": "https://x", "ca": encoded}));
        let endpoint = ready_endpoint(Some(&status), false).unwrap().unwrap();
        assert_eq!(endpoint.ca_pem.as_deref(), Some(&pem[..]));
        assert_eq!(endpoint.volume_mode, VolumeMode::Filesystem);
    }

    #[test]
    fn invalid_ca_or_mode_is_an_error() {
        let bad_ca = ready(&json!({"url": "https://x", "ca": "%%%"}));
        assert!(matches!(
            ready_endpoint(Some(&bad_ca), false),
            Err(KubeError::InvalidStatus(_))
        ));
        let bad_mode = ready(&json!({"url": "https://x", "volumeMode": "Tape"}));
        assert!(matches!(
            ready_endpoint(Some(&bad_mode), false),
            Err(KubeError::InvalidStatus(_))
        ));
    }

    #[test]
    fn no_ready_condition_reason() {
        let status = json!({"conditions": [{"type": "Expired", "status": "False"}]});
        assert_eq!(pending_reason(Some(&status), false), "no Ready condition");
    }
}
