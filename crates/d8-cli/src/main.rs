mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{export, import, Context};
use d8_data::{cancel_on_ctrlc, CancelToken, TransferError, VolumeMode};
use d8_kube::TransferKind;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "d8",
    version,
    about = "Move data in and out of Kubernetes volumes"
)]
struct Cli {
    /// Path to the d8 data config file (default: ~/.config/d8/data.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the kubeconfig file.
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use.
    #[arg(long, global = true)]
    context: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export and import volume data.
    Data {
        #[command(subcommand)]
        group: DataGroup,
    },
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum DataGroup {
    /// Read data out of a PVC, snapshot or virtual disk.
    Export {
        #[command(subcommand)]
        cmd: ExportCmd,
    },
    /// Upload data into a freshly provisioned volume.
    Import {
        #[command(subcommand)]
        cmd: ImportCmd,
    },
}

#[derive(Debug, Subcommand)]
enum ExportCmd {
    /// Create a DataExport for a volume.
    Create {
        /// DataExport name.
        name: String,
        /// Volume to export, as KIND/NAME (pvc, vs, vd, vds).
        volume: String,
        #[arg(short, long)]
        namespace: Option<String>,
        /// How long the export stays alive (e.g. 2m, 1h).
        #[arg(long)]
        ttl: Option<String>,
        /// Use the public URL; auto-detected when omitted.
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        publish: Option<bool>,
    },
    /// Download a file, a directory or a block device from a DataExport.
    Download {
        /// DataExport name, or KIND/NAME to export and download in one step.
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
        /// Path inside the volume; a trailing '/' selects a directory.
        #[arg(short = 'f', long = "file")]
        remote: Option<String>,
        /// Local destination; stdout for a single file when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        ttl: Option<String>,
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        publish: Option<bool>,
    },
    /// Delete a DataExport.
    Delete {
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ImportCmd {
    /// Create a DataImport that provisions a new PVC.
    Create {
        /// DataImport name, also used for the PVC.
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
        /// Requested storage size (e.g. 10Gi).
        #[arg(long)]
        size: String,
        #[arg(long)]
        storage_class: Option<String>,
        #[arg(long, default_value = "ReadWriteOnce")]
        access_mode: String,
        /// Filesystem or Block.
        #[arg(long, default_value = "Filesystem", value_parser = parse_volume_mode)]
        volume_mode: VolumeMode,
        /// Wait for the first consumer before binding the volume.
        #[arg(long, default_value_t = false)]
        wffc: bool,
        #[arg(long)]
        ttl: Option<String>,
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        publish: Option<bool>,
    },
    /// Upload a local file into a DataImport volume.
    Upload {
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
        /// Local file to upload.
        #[arg(short, long)]
        file: PathBuf,
        /// Destination path inside the volume.
        #[arg(short = 'd', long = "dstPath", visible_alias = "dst-path")]
        dst_path: String,
        /// Number of chunks the file is split into.
        #[arg(short, long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
        chunks: Option<usize>,
        /// Continue from the size already present on the server.
        #[arg(long, default_value_t = false)]
        resume: bool,
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        publish: Option<bool>,
    },
    /// Delete a DataImport.
    Delete {
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

fn parse_volume_mode(s: &str) -> Result<VolumeMode, String> {
    s.parse().map_err(|e: TransferError| e.to_string())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("D8_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::Data { group } => {
            let cancel = CancelToken::new();
            cancel_on_ctrlc(&cancel);
            Context::new(
                cli.config.as_deref(),
                cli.kubeconfig,
                cli.context,
                cancel,
                cli.json,
            )
            .and_then(|ctx| run_data(&ctx, group))
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(commands::exit_code_for(&msg))
        }
    }
}

fn run_data(ctx: &Context, group: DataGroup) -> Result<u8, String> {
    match group {
        DataGroup::Export { cmd } => match cmd {
            ExportCmd::Create {
                name,
                volume,
                namespace,
                ttl,
                publish,
            } => export::create(ctx, &name, &volume, namespace, ttl, publish),
            ExportCmd::Download {
                name,
                namespace,
                remote,
                output,
                ttl,
                publish,
            } => export::download(
                ctx,
                export::DownloadArgs {
                    name,
                    namespace,
                    remote,
                    output,
                    ttl,
                    publish,
                },
            ),
            ExportCmd::Delete { name, namespace } => {
                commands::delete_resource(ctx, TransferKind::Export, &name, namespace)
            }
        },
        DataGroup::Import { cmd } => match cmd {
            ImportCmd::Create {
                name,
                namespace,
                size,
                storage_class,
                access_mode,
                volume_mode,
                wffc,
                ttl,
                publish,
            } => import::create(
                ctx,
                import::CreateArgs {
                    name,
                    namespace,
                    size,
                    storage_class,
                    access_mode,
                    volume_mode,
                    wffc,
                    ttl,
                    publish,
                },
            ),
            ImportCmd::Upload {
                name,
                namespace,
                file,
                dst_path,
                chunks,
                resume,
                publish,
            } => import::upload(
                ctx,
                import::UploadArgs {
                    name,
                    namespace,
                    file,
                    dst_path,
                    chunks,
                    resume,
                    publish,
                },
            ),
            ImportCmd::Delete { name, namespace } => {
                commands::delete_resource(ctx, TransferKind::Import, &name, namespace)
            }
        },
    }
}
