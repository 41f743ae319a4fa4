use super::{json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS};
use d8_data::{Downloader, TransferEndpointProvider, VolumeMode};
use d8_kube::resource::export_spec;
use d8_kube::{ExportTarget, KubeContext, KubeEndpointProvider, KubeError, TransferKind};
use std::path::{Path, PathBuf};
use tracing::warn;

fn parse_target(target: &str) -> Result<ExportTarget, String> {
    target.parse().map_err(|e: KubeError| e.to_string())
}

pub fn create(
    ctx: &Context,
    name: &str,
    target: &str,
    namespace: Option<String>,
    ttl: Option<String>,
    publish: Option<bool>,
) -> Result<u8, String> {
    let target = parse_target(target)?;
    let kube = ctx.kube()?;
    let ns = ctx.namespace(namespace, &kube);
    let publish = ctx.publish(&kube, publish)?;
    let ttl = ctx.ttl(ttl);

    let pb = spinner(&format!("creating DataExport {ns}/{name}…"));
    kube.create_transfer(
        TransferKind::Export,
        &ns,
        name,
        export_spec(&target, &ttl, publish),
    )
    .map_err(|e| {
        spin_fail(&pb, "create failed");
        e.to_string()
    })?;
    spin_ok(
        &pb,
        &format!("DataExport {ns}/{name} created for {target} (ttl {ttl}, publish {publish})"),
    );

    if ctx.json {
        let payload = serde_json::json!({
            "kind": "DataExport",
            "namespace": ns,
            "name": name,
            "target": target.to_string(),
            "ttl": ttl,
            "publish": publish,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

pub struct DownloadArgs {
    /// Existing export name, or `KIND/NAME` for a one-shot export.
    pub name: String,
    pub namespace: Option<String>,
    pub remote: Option<String>,
    pub output: Option<PathBuf>,
    pub ttl: Option<String>,
    pub publish: Option<bool>,
}

pub fn download(ctx: &Context, args: DownloadArgs) -> Result<u8, String> {
    let kube = ctx.kube()?;
    let ns = ctx.namespace(args.namespace, &kube);
    let publish = ctx.publish(&kube, args.publish)?;

    let ephemeral = if args.name.contains('/') {
        Some(parse_target(&args.name)?)
    } else {
        None
    };
    let export_name = match ephemeral {
        Some(ref target) => {
            let name = target.ephemeral_export_name();
            let ttl = ctx.ttl(args.ttl);
            kube.create_transfer(
                TransferKind::Export,
                &ns,
                &name,
                export_spec(target, &ttl, publish),
            )
            .map_err(|e| e.to_string())?;
            name
        }
        None => args.name,
    };

    let result = fetch(
        ctx,
        &kube,
        &ns,
        &export_name,
        publish,
        args.remote.as_deref(),
        args.output.as_deref(),
    );

    if ephemeral.is_some() {
        if let Err(e) = kube.delete_transfer(TransferKind::Export, &ns, &export_name) {
            warn!("failed to delete DataExport {ns}/{export_name}: {e}");
        }
    }
    result
}

fn fetch(
    ctx: &Context,
    kube: &KubeContext,
    ns: &str,
    name: &str,
    publish: bool,
    remote: Option<&str>,
    output: Option<&Path>,
) -> Result<u8, String> {
    let pb = spinner(&format!("waiting for DataExport {ns}/{name}…"));
    let provider = KubeEndpointProvider::new(
        kube,
        TransferKind::Export,
        ctx.client_config(),
        ctx.cancel.clone(),
    );
    let session = provider.prepare(name, ns, publish).map_err(|e| {
        spin_fail(&pb, "export not ready");
        e.to_string()
    })?;

    let remote = match session.volume_mode {
        VolumeMode::Block => "",
        VolumeMode::Filesystem => remote.unwrap_or("/"),
    };
    pb.set_message(format!("downloading {ns}/{name}{remote}…"));

    let downloader = Downloader::from_session(&session, ctx.cancel.clone());
    match downloader.download(remote, output, session.volume_mode) {
        Ok(files) => {
            spin_ok(&pb, &format!("downloaded {files} file(s) from {ns}/{name}"));
            if ctx.json {
                let payload = serde_json::json!({
                    "namespace": ns,
                    "name": name,
                    "volume_mode": session.volume_mode.to_string(),
                    "files": files,
                });
                println!("{}", json_pretty(&payload)?);
            }
            Ok(EXIT_SUCCESS)
        }
        Err(failure) => {
            spin_fail(&pb, "download failed");
            eprintln!("downloaded {} files before failure", failure.downloaded);
            Err(failure.error.to_string())
        }
    }
}
