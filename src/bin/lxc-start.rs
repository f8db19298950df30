//! `lxc-start`: brings a container from `Stopped` to `Running`. In the
//! foreground (the default) it attaches the controlling terminal to the
//! container's console and waits for the init process to exit; with `-d`
//! it daemonizes instead and serves console-attach requests for a later,
//! separate `lxc-console` until the container exits.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lxcore::{base_path, console, tty, Cgroup, Conf, Container, Handler};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CGROUP_PARENT: &str = "lxc";

#[derive(Parser)]
#[command(name = "lxc-start", about = "Start a container")]
struct Args {
    /// Container name.
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Daemonize: detach from the controlling terminal and serve
    /// console-attach requests instead of attaching one inline.
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,

    /// Alternate config file, used in place of the container's stored one
    /// (and without requiring the container to have been `lxc-create`d).
    #[arg(short = 'f', long = "rcfile")]
    rcfile: Option<PathBuf>,

    /// Program and arguments to exec as the container's init; defaults to
    /// `/sbin/init` when empty.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    match run(&args) {
        Ok(code) => exit_code(code),
        Err(e) => {
            tracing::error!(container = args.name, error = %e, "start failed");
            ExitCode::FAILURE
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn run(args: &Args) -> lxcore::Result<i32> {
    let base = base_path();

    let container = match Container::open(&base, &args.name) {
        Ok(c) => c,
        Err(e) => match &args.rcfile {
            Some(rcfile) => Container::create(&base, &args.name, rcfile)?,
            None => return Err(e),
        },
    };
    let conf: Conf = match &args.rcfile {
        Some(rcfile) => Conf::from_file(rcfile)?,
        None => container.load_conf()?,
    };
    container.prepare_run_dir()?;

    // Daemonizing has to happen before the launch clone, not after: the
    // process that calls `Handler::launch` is the one the kernel keeps as
    // the container's parent, and only that process can later `waitpid` it.
    if args.daemonize {
        daemonize(&container)?;
    }

    let cgroup_root = Cgroup::new(CGROUP_ROOT, CGROUP_PARENT)?;
    cgroup_root.create()?;

    // A container always gets its ttys pre-allocated: the foreground path
    // attaches one right away, the daemonized path serves them later.
    let mut handler =
        Handler::launch(&args.name, conf, &cgroup_root, &args.command, true)?;

    let result = if args.daemonize {
        let sock_path = container.run_dir().join(lxcore::ptyserver::CONSOLE_SOCK);
        handler.serve_console(&sock_path)
    } else {
        run_foreground(&mut handler)
    };

    container.teardown_run_dir()?;
    result
}

/// Attaches the controlling terminal's own termios save/restore bracket
/// around the console proxy (the original `lxc_start.c`'s `save_tty` /
/// `restore_tty`, kept separate from the proxy's own bracket since the
/// proxy only ever touches the fd it was given), runs the proxy until it
/// exits (user escape or container hangup), then waits for the init
/// process so the reported exit code always reflects the container.
fn run_foreground(handler: &mut Handler) -> lxcore::Result<i32> {
    let stdin = std::io::stdin();
    let saved = tty::save(&stdin)?;
    let result = handler.attach_console(None, console::escape_byte("^a"));
    let _ = tty::restore(&stdin, &saved);
    result?;
    handler.wait()
}

/// `-d`: forks into the background, starts a new session so the shell that
/// launched us can exit, and reopens stdio onto the container's own log
/// file so nothing is left holding the original controlling terminal open.
fn daemonize(container: &Container) -> lxcore::Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;

    let log_path = container.run_dir().join("lxc-start.log");
    let log = std::fs::File::options()
        .create(true)
        .append(true)
        .open(log_path)?;
    let devnull = std::fs::File::options().read(true).open("/dev/null")?;

    dup2(devnull.as_raw_fd(), 0)?;
    dup2(log.as_raw_fd(), 1)?;
    dup2(log.as_raw_fd(), 2)?;
    // `devnull`/`log` drop here, closing their original descriptors; 0/1/2
    // now hold independent duplicates pointing at the same file objects.
    Ok(())
}
