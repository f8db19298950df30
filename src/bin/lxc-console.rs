//! `lxc-console`: attaches the controlling terminal to a running
//! container's pty, connecting to its console-attach socket.

use std::os::fd::AsFd;
use std::process::ExitCode;

use clap::Parser;
use lxcore::{base_path, console, ptyserver, Container};

#[derive(Parser)]
#[command(name = "lxc-console", about = "Attach to a running container's console")]
struct Args {
    /// Container name.
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Tty index to attach to.
    #[arg(short = 't', long = "tty", default_value_t = 0)]
    tty: u32,

    /// Escape sequence expression (`^a`, `a`, ...); defaults to Ctrl-A.
    #[arg(short = 'e', long = "escape", default_value = "^a")]
    escape: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(container = args.name, error = %e, "console failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> lxcore::Result<()> {
    let base = base_path();
    let container = Container::open(&base, &args.name)?;
    let sock_path = container.run_dir().join(ptyserver::CONSOLE_SOCK);

    let master = ptyserver::request_master(&sock_path, args.tty)?;
    let escape = console::escape_byte(&args.escape);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    console::attach(stdin.as_fd(), &mut stdout, master, escape)
}
