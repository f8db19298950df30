//! `lxc-create`: registers a new container's on-disk identity by copying a
//! config file (or writing an empty default one) into `$LXCPATH/NAME`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lxcore::{base_path, Container};

#[derive(Parser)]
#[command(name = "lxc-create", about = "Create a container's on-disk identity")]
struct Args {
    /// Container name.
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Source config file to copy in; an empty config is written if absent.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let base = base_path();

    let result = match &args.config {
        Some(config) => Container::create(&base, &args.name, config),
        None => Container::create_with_text(&base, &args.name, ""),
    };

    match result {
        Ok(container) => {
            tracing::info!(container = args.name, path = ?container.path(), "created");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(container = args.name, error = %e, "create failed");
            ExitCode::FAILURE
        }
    }
}
