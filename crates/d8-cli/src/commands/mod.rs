pub mod completions;
pub mod export;
pub mod import;

use d8_data::{resolve_publish, CancelToken, ClientConfig, DataConfig, PublishDecision};
use d8_kube::{ConnectOptions, KubeClusterProbe, KubeContext, TransferKind};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_AMBIGUOUS_PUBLISH: u8 = 2;
pub const EXIT_KUBE_ERROR: u8 = 3;

/// Settings shared by every `data` subcommand.
pub struct Context {
    pub config: DataConfig,
    pub connect: ConnectOptions,
    pub cancel: CancelToken,
    pub json: bool,
}

impl Context {
    pub fn new(
        config_path: Option<&Path>,
        kubeconfig: Option<PathBuf>,
        kube_context: Option<String>,
        cancel: CancelToken,
        json: bool,
    ) -> Result<Self, String> {
        let config = match config_path {
            Some(path) => DataConfig::load(path),
            None => DataConfig::load_default(),
        }
        .map_err(|e| e.to_string())?;
        let connect = ConnectOptions {
            kubeconfig: kubeconfig.or_else(|| config.kubeconfig.clone()),
            context: kube_context.or_else(|| config.context.clone()),
        };
        Ok(Self {
            config,
            connect,
            cancel,
            json,
        })
    }

    pub fn kube(&self) -> Result<KubeContext, String> {
        KubeContext::connect(&self.connect).map_err(|e| e.to_string())
    }

    /// `-n` flag, then the config file, then the kubeconfig context.
    pub fn namespace(&self, flag: Option<String>, kube: &KubeContext) -> String {
        flag.or_else(|| self.config.namespace.clone())
            .unwrap_or_else(|| kube.default_namespace().to_owned())
    }

    pub fn ttl(&self, flag: Option<String>) -> String {
        flag.unwrap_or_else(|| self.config.ttl_or_default().to_owned())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default().insecure(self.config.insecure_skip_tls_verify)
    }

    pub fn publish(&self, kube: &KubeContext, flag: Option<bool>) -> Result<bool, String> {
        let probe = KubeClusterProbe::new(kube);
        resolve_publish(PublishDecision::from_flag(flag), &probe, &self.cancel)
            .map_err(|e| e.to_string())
    }
}

/// Shared body of `export delete` and `import delete`.
pub fn delete_resource(
    ctx: &Context,
    kind: TransferKind,
    name: &str,
    namespace: Option<String>,
) -> Result<u8, String> {
    let kube = ctx.kube()?;
    let ns = ctx.namespace(namespace, &kube);
    let label = format!("{} {ns}/{name}", kind.kind());

    let pb = spinner(&format!("deleting {label}…"));
    match kube.delete_transfer(kind, &ns, name) {
        Ok(true) => spin_ok(&pb, &format!("{label} deleted")),
        Ok(false) => {
            spin_fail(&pb, &format!("{label} not found"));
            return Err(format!("kube error: {label} not found"));
        }
        Err(e) => {
            spin_fail(&pb, "delete failed");
            return Err(e.to_string());
        }
    }
    if ctx.json {
        let payload = serde_json::json!({
            "kind": kind.kind(),
            "namespace": ns,
            "name": name,
            "deleted": true,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn byte_bar(total: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Exit code for an error message produced by a command.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("cannot auto-detect publish mode") {
        EXIT_AMBIGUOUS_PUBLISH
    } else if msg.starts_with("kube") || msg.starts_with("transfer endpoint error:") {
        EXIT_KUBE_ERROR
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"files": 3});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"files\": 3"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_AMBIGUOUS_PUBLISH);
        assert_ne!(EXIT_AMBIGUOUS_PUBLISH, EXIT_KUBE_ERROR);
    }

    #[test]
    fn exit_code_classification() {
        let ambiguous = d8_data::TransferError::AmbiguousPublish("x".to_owned()).to_string();
        assert_eq!(exit_code_for(&ambiguous), EXIT_AMBIGUOUS_PUBLISH);
        let endpoint = d8_data::TransferError::Endpoint("kube error: boom".to_owned()).to_string();
        assert_eq!(exit_code_for(&endpoint), EXIT_KUBE_ERROR);
        assert_eq!(exit_code_for("kube config error: no context"), EXIT_KUBE_ERROR);
        assert_eq!(exit_code_for("I/O error: disk full"), EXIT_FAILURE);
    }

    #[test]
    fn context_prefers_flags_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        DataConfig {
            kubeconfig: Some(PathBuf::from("/from/config")),
            context: Some("cfg-ctx".to_owned()),
            ttl: Some("15m".to_owned()),
            insecure_skip_tls_verify: true,
            ..DataConfig::default()
        }
        .save(&path)
        .unwrap();

        let ctx = Context::new(
            Some(&path),
            Some(PathBuf::from("/from/flag")),
            None,
            CancelToken::new(),
            false,
        )
        .unwrap();
        assert_eq!(ctx.connect.kubeconfig, Some(PathBuf::from("/from/flag")));
        assert_eq!(ctx.connect.context.as_deref(), Some("cfg-ctx"));
        assert_eq!(ctx.ttl(None), "15m");
        assert_eq!(ctx.ttl(Some("1h".to_owned())), "1h");
        assert!(ctx.client_config().insecure_skip_tls_verify);
    }

    #[test]
    fn broken_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Context::new(Some(&path), None, None, CancelToken::new(), false)
            .err()
            .unwrap();
        assert!(err.starts_with("config error"), "{err}");
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn byte_bar_finishes() {
        let pb = byte_bar(10, "upload");
        pb.set_position(10);
        spin_fail(&pb, "failed");
    }
}
