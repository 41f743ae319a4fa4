use clap::Parser;
use d8_data_server::Volume;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "d8-data-server",
    version,
    about = "Reference data-plane server for d8 data export/import"
)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory served under /api/v1/files.
    #[arg(long, default_value = "./d8-volume")]
    root: PathBuf,

    /// Image file whose size is reported by HEAD /api/v1/block.
    #[arg(long)]
    block_image: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = std::fs::create_dir_all(&cli.root) {
        error!("cannot create {}: {e}", cli.root.display());
        return ExitCode::FAILURE;
    }

    let addr = format!("0.0.0.0:{}", cli.port);
    info!("starting d8-data-server on {addr}");
    info!("volume root: {}", cli.root.display());

    let mut volume = Volume::new(cli.root);
    if let Some(image) = cli.block_image {
        info!("block image: {}", image.display());
        volume = volume.with_block_image(image);
    }

    match d8_data_server::run_server(&Arc::new(volume), &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
