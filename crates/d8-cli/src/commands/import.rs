use super::{byte_bar, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS};
use d8_data::{TransferEndpointProvider, UploadOptions, Uploader, VolumeMode};
use d8_kube::resource::import_spec;
use d8_kube::{ImportVolume, KubeEndpointProvider, TransferKind};
use std::path::PathBuf;

pub struct CreateArgs {
    pub name: String,
    pub namespace: Option<String>,
    pub size: String,
    pub storage_class: Option<String>,
    pub access_mode: String,
    pub volume_mode: VolumeMode,
    pub wffc: bool,
    pub ttl: Option<String>,
    pub publish: Option<bool>,
}

pub fn create(ctx: &Context, args: CreateArgs) -> Result<u8, String> {
    let kube = ctx.kube()?;
    let ns = ctx.namespace(args.namespace, &kube);
    let publish = ctx.publish(&kube, args.publish)?;
    let ttl = ctx.ttl(args.ttl);
    let volume = ImportVolume {
        size: args.size,
        storage_class: args.storage_class,
        access_mode: args.access_mode,
        volume_mode: args.volume_mode,
        wait_for_first_consumer: args.wffc,
    };

    let pb = spinner(&format!("creating DataImport {ns}/{}…", args.name));
    kube.create_transfer(
        TransferKind::Import,
        &ns,
        &args.name,
        import_spec(&args.name, &volume, &ttl, publish),
    )
    .map_err(|e| {
        spin_fail(&pb, "create failed");
        e.to_string()
    })?;
    spin_ok(
        &pb,
        &format!(
            "DataImport {ns}/{} created ({} {}, ttl {ttl}, publish {publish})",
            args.name, volume.size, volume.volume_mode
        ),
    );

    if ctx.json {
        let payload = serde_json::json!({
            "kind": "DataImport",
            "namespace": ns,
            "name": args.name,
            "size": volume.size,
            "volume_mode": volume.volume_mode.to_string(),
            "ttl": ttl,
            "publish": publish,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

pub struct UploadArgs {
    pub name: String,
    pub namespace: Option<String>,
    pub file: PathBuf,
    pub dst_path: String,
    pub chunks: Option<usize>,
    pub resume: bool,
    pub publish: Option<bool>,
}

pub fn upload(ctx: &Context, args: UploadArgs) -> Result<u8, String> {
    let kube = ctx.kube()?;
    let ns = ctx.namespace(args.namespace, &kube);
    let publish = ctx.publish(&kube, args.publish)?;
    let name = args.name;

    let pb = spinner(&format!("waiting for DataImport {ns}/{name}…"));
    let provider = KubeEndpointProvider::new(
        &kube,
        TransferKind::Import,
        ctx.client_config(),
        ctx.cancel.clone(),
    );
    let session = provider.prepare(&name, &ns, publish).map_err(|e| {
        spin_fail(&pb, "import not ready");
        e.to_string()
    })?;
    if session.volume_mode == VolumeMode::Block {
        spin_fail(&pb, "block volume");
        return Err(format!(
            "DataImport {ns}/{name} provisions a Block volume; file upload needs a Filesystem volume"
        ));
    }
    pb.finish_and_clear();

    let total = std::fs::metadata(&args.file)
        .map_err(|e| format!("{}: {e}", args.file.display()))?
        .len();
    let bar = byte_bar(total, &format!("uploading {}", args.file.display()));
    let progress = bar.clone();
    let options = UploadOptions {
        chunks: args
            .chunks
            .unwrap_or_else(|| ctx.config.chunks_or_default()),
        resume: args.resume,
    };

    let report = Uploader::from_session(&session, ctx.cancel.clone())
        .with_progress(move |done, _total| progress.set_position(done))
        .upload(&args.dst_path, &args.file, options)
        .map_err(|e| {
            spin_fail(&bar, "upload failed");
            e.to_string()
        })?;
    spin_ok(
        &bar,
        &format!(
            "uploaded {} to {ns}/{name}:{} ({} bytes in {} requests)",
            args.file.display(),
            args.dst_path,
            report.bytes_sent,
            report.requests
        ),
    );

    if ctx.json {
        let payload = serde_json::json!({
            "namespace": ns,
            "name": name,
            "dst_path": args.dst_path,
            "total_bytes": report.total_bytes,
            "resumed_from": report.resumed_from,
            "bytes_sent": report.bytes_sent,
            "requests": report.requests,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
