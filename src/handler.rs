//! Launch state machine: drives a container from `Stopped` through
//! `Starting` to `Running` (or back down through `Aborting`), coordinating
//! the parent and child across the sync channel while the child sets up
//! its namespaces, network, and cgroup membership.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::cgroup::Cgroup;
use crate::clone::{clone_into_namespaces, Clone as CloneOutcome, LaunchFlags};
use crate::config::{Conf, NetConf, NetConfCommon};
use crate::console;
use crate::error::{Error, Result};
use crate::mounts::{self, MountEntry};
use crate::network;
use crate::ptyserver::{self, Tty};
use crate::sync::{SyncEnd, POST_CONFIGURE, POST_NETWORK, POST_START};
use crate::userns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
}

/// Owns the launched container's process and sync channel from the
/// parent's side. `pid.is_some()` iff `state` is one of `{Starting,
/// Running, Stopping}`.
pub struct Handler {
    name: String,
    conf: Conf,
    state: State,
    pid: Option<Pid>,
    sync: Option<SyncEnd>,
    cgroup: Cgroup,
    /// Pty masters for the container's pre-allocated ttys; empty unless a
    /// console was requested at launch.
    tty_masters: Vec<OwnedFd>,
}

fn launch_flags(conf: &Conf) -> LaunchFlags {
    LaunchFlags {
        newuts: true,
        newpid: true,
        newipc: true,
        newns: true,
        newnet: true,
        newuser: conf.newuserns,
    }
}

fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 1,
    }
}

impl Handler {
    /// Runs the full launch protocol and returns a `Handler` owning the
    /// running container, or an error if any step failed (in which case
    /// any host-side state this call created has already been rolled
    /// back). `command` is the init program and its arguments (`/sbin/init`
    /// with none given, per spec.md §6); `console` requests that
    /// `conf.tty_count` ptys be pre-allocated for later [`Handler::attach_console`]
    /// or [`Handler::serve_console`] use.
    pub fn launch(
        name: &str,
        conf: Conf,
        cgroup_root: &Cgroup,
        command: &[String],
        console: bool,
    ) -> Result<Handler> {
        let cgroup = cgroup_root.child(name)?;
        cgroup.create()?;

        let ttys = if console {
            ptyserver::allocate(conf.tty_count.max(1))?
        } else {
            Vec::new()
        };

        let (mut parent_end, child_end) = SyncEnd::pair()?;
        let flags = launch_flags(&conf);
        let command = command.to_vec();

        info!(container = name, "starting launch");

        let clone_result = clone_into_namespaces(flags, None::<&OwnedFd>)
            .map_err(|e| Error::Namespace(e.to_string()))?;

        match clone_result {
            CloneOutcome::Child => {
                drop(parent_end);
                // The child never returns from here: it either execs or
                // exits with a nonzero status after signalling abort.
                run_child(name, &conf, &command, ttys, child_end);
                unreachable!("run_child always exits the process");
            }
            CloneOutcome::Parent(pid) => {
                drop(child_end);
                // Only the parent keeps the masters; the slaves travelled
                // into the child's copy of `ttys` across the fork above.
                let tty_masters = ttys.into_iter().map(|t| t.master).collect();
                let mut handler = Handler {
                    name: name.to_owned(),
                    conf,
                    state: State::Starting,
                    pid: Some(pid),
                    sync: Some(parent_end),
                    cgroup,
                    tty_masters,
                };
                match handler.drive_parent_side(pid) {
                    Ok(()) => {
                        handler.state = State::Running;
                        handler.sync = None;
                        Ok(handler)
                    }
                    Err(e) => {
                        error!(container = name, error = %e, "launch failed");
                        handler.state = State::Aborting;
                        handler.rollback(pid);
                        handler.state = State::Stopped;
                        Err(e)
                    }
                }
            }
        }
    }

    fn drive_parent_side(&mut self, pid: Pid) -> Result<()> {
        let sync = self.sync.as_mut().expect("sync channel present while starting");

        // Step 5: wait for POST_CONFIGURE, then perform network creation
        // on the host side and move interfaces into the child's netns.
        sync.wait(POST_CONFIGURE)?;
        if self.conf.newuserns {
            // The child is blocked at this barrier, so the uid/gid map
            // write (which the kernel only accepts once, before the
            // mapped process's first setuid/setgroups) is race-free here.
            userns::map_current_user_as_root(pid)?;
        }
        setup_host_network(&self.name, &self.conf, pid)?;
        sync.wake(POST_CONFIGURE + 1)?;

        // Step 7: wait for POST_NETWORK, attach the child to its cgroup.
        sync.wait(POST_NETWORK)?;
        self.cgroup.add_process(pid)?;
        sync.wake(POST_NETWORK + 1)?;

        // Step 9: the child's execve closes its sync end; observing that
        // close at POST_START is success, not a protocol violation.
        match sync.wait(POST_START)? {
            crate::sync::WaitOutcome::PeerClosed | crate::sync::WaitOutcome::Reached => Ok(()),
        }
    }

    /// Unwinds host-visible state left behind by a failed launch: any
    /// host-side veth/macvlan halves this call created, the cgroup
    /// directory, and the not-yet-`RUNNING` child itself.
    fn rollback(&mut self, pid: Pid) {
        warn!(container = self.name, "rolling back failed launch");
        for (idx, net) in self.conf.networks.iter().enumerate() {
            let tag = net_dev_tag(&self.name, idx);
            match net {
                NetConf::Veth(_) => {
                    // The kernel deletes both halves of a veth pair
                    // together; deleting the host end is enough even if
                    // the peer was already moved into the child's netns.
                    // A no-op (ENODEV, ignored) if creation never reached
                    // this point or the whole pair already vanished with
                    // the aborted child's netns.
                    let _ = network::device_delete(&veth_host_name(&tag));
                }
                NetConf::Macvlan(_) => {
                    let _ = network::device_delete(&macvlan_dev_name(&tag));
                }
                NetConf::Phys(_) | NetConf::Empty(_) => {}
            }
        }
        let _ = self.cgroup.remove();
        let _ = waitpid(pid, None);
        self.pid = None;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Attaches the controlling terminal to tty `tty_index` (default 0)
    /// and runs the console proxy loop to completion. Valid only when
    /// `console: true` was passed to [`Handler::launch`].
    pub fn attach_console(&self, tty_index: Option<u32>, escape: u8) -> Result<()> {
        let index = tty_index.unwrap_or(0) as usize;
        let master = self
            .tty_masters
            .get(index)
            .ok_or_else(|| Error::Config(format!("no such tty index {index}")))?;
        let dup_fd = nix::unistd::dup(master.as_raw_fd())?;
        let master = unsafe { OwnedFd::from_raw_fd(dup_fd) };
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        console::attach(stdin.as_fd(), &mut stdout, master, escape)
    }

    /// Waits for the container's init process to exit, transitioning
    /// `Running -> Stopping -> Stopped`. Use when no console socket needs
    /// serving concurrently (the common foreground, no-console case).
    pub fn wait(&mut self) -> Result<i32> {
        let pid = self.pid.ok_or_else(|| Error::Config("container not running".into()))?;
        self.state = State::Stopping;
        let status = waitpid(pid, None)?;
        self.state = State::Stopped;
        self.pid = None;
        let _ = self.cgroup.remove();
        Ok(exit_code_of(status))
    }

    /// Serves console-attach requests on `sock_path` (for a later, separate
    /// `lxc-console` invocation to connect to) until the container exits.
    /// Single-threaded: alternates between answering at most one pending
    /// attach request and a non-blocking check of the child's status.
    pub fn serve_console(&mut self, sock_path: &Path) -> Result<i32> {
        let pid = self.pid.ok_or_else(|| Error::Config("container not running".into()))?;
        self.state = State::Stopping;
        let mut exit_code = None;
        ptyserver::serve(sock_path, &self.tty_masters, || {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => false,
                Ok(status) => {
                    exit_code = Some(exit_code_of(status));
                    true
                }
                Err(_) => true,
            }
        })?;
        self.state = State::Stopped;
        self.pid = None;
        let _ = self.cgroup.remove();
        Ok(exit_code.unwrap_or(1))
    }
}

fn net_common(net: &NetConf) -> &NetConfCommon {
    match net {
        NetConf::Empty(c) | NetConf::Veth(c) | NetConf::Macvlan(c) | NetConf::Phys(c) => c,
    }
}

/// Short, `IFNAMSIZ`-safe tag identifying network index `idx` of container
/// `name`, computed identically on both sides of the fork without needing
/// any coordination: the child cannot use its own pid to agree on a device
/// name with the parent (inside a fresh `CLONE_NEWPID` namespace its own
/// `getpid()` is 1, not the value the parent sees), but `conf`'s `networks`
/// list is identical, byte-for-byte, in both processes' copy-on-write
/// memory from the moment of `fork`, so hashing `(name, idx)` gives every
/// network a name both sides can compute on their own.
fn net_dev_tag(name: &str, idx: usize) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.bytes().chain(idx.to_ne_bytes()) {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

/// Host-side veth name for a given tag. The peer end takes the same tag
/// with a `p` suffix instead of `h`.
fn veth_host_name(tag: &str) -> String {
    format!("v{tag}h")
}

fn veth_peer_name(tag: &str) -> String {
    format!("v{tag}p")
}

/// Host-side name for the macvlan device created for a given tag.
fn macvlan_dev_name(tag: &str) -> String {
    format!("m{tag}")
}

/// Performs all host-side network creation and moves each interface into
/// the child's network namespace. On a veth pair, only the container-bound
/// end is moved; the host end stays up on the host side. For a veth
/// network, `lxc.network.link` names the bridge the host end should be
/// enslaved to (matching the original's own `lxc.network.link` meaning, not
/// a literal peer interface name); for macvlan it names the master device
/// the new interface shares a link with; for phys it names the physical
/// device to hand over outright.
fn setup_host_network(name: &str, conf: &Conf, pid: Pid) -> Result<()> {
    for (idx, net) in conf.networks.iter().enumerate() {
        let tag = net_dev_tag(name, idx);
        match net {
            NetConf::Empty(_) => {}
            NetConf::Veth(common) => {
                let host_name = veth_host_name(&tag);
                let peer_name = veth_peer_name(&tag);
                network::veth_create(&host_name, &peer_name).map_err(Error::Net)?;
                if let Err(e) = network::device_move(&peer_name, pid) {
                    let _ = network::device_delete(&host_name);
                    return Err(Error::Net(e));
                }
                network::device_up(&host_name).map_err(Error::Net)?;
                if let Some(bridge) = &common.link {
                    if let Err(e) = network::bridge_attach(bridge, &host_name) {
                        let _ = network::device_delete(&host_name);
                        return Err(Error::Net(e));
                    }
                }
            }
            NetConf::Macvlan(common) => {
                let master = common
                    .link
                    .clone()
                    .ok_or_else(|| Error::Config("macvlan network missing lxc.network.link".into()))?;
                let dev_name = macvlan_dev_name(&tag);
                network::macvlan_create(&master, &dev_name).map_err(Error::Net)?;
                if let Err(e) = network::device_move(&dev_name, pid) {
                    let _ = network::device_delete(&dev_name);
                    return Err(Error::Net(e));
                }
            }
            NetConf::Phys(common) => {
                let name = common
                    .link
                    .clone()
                    .ok_or_else(|| Error::Config("phys network missing lxc.network.link".into()))?;
                network::device_move(&name, pid).map_err(Error::Net)?;
            }
        }
    }
    Ok(())
}

/// Runs entirely inside the forked child. Never returns: either `execve`
/// succeeds (which implicitly closes `sync`), or it aborts and exits
/// nonzero.
fn run_child(name: &str, conf: &Conf, command: &[String], ttys: Vec<Tty>, mut sync: SyncEnd) -> ! {
    match run_child_inner(name, conf, command, ttys, &mut sync) {
        Ok(()) => unreachable!("run_child_inner only returns via execve or Err"),
        Err(e) => {
            error!(error = %e, "child aborting launch");
            sync.abort();
            unsafe { nix::libc::_exit(1) }
        }
    }
}

fn run_child_inner(
    name: &str,
    conf: &Conf,
    command: &[String],
    ttys: Vec<Tty>,
    sync: &mut SyncEnd,
) -> Result<()> {
    if let Some(utsname) = &conf.utsname {
        nix::unistd::sethostname(utsname)?;
    }

    let mount_table: Vec<MountEntry> = conf
        .mounts
        .iter()
        .map(|path| mounts::parse_mount_table(&std::fs::read_to_string(path)?))
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();
    mounts::setup_mount_namespace(conf.rootfs.as_deref(), &mount_table)?;

    // Step 4: open the container's ttys (already open from before the
    // fork; here we just drop the master halves the child has no use for
    // and, if a console was requested, wire tty 0's slave onto our stdio).
    let mut slave_fds = Vec::with_capacity(ttys.len());
    for tty in ttys {
        drop(tty.master);
        slave_fds.push(tty.slave);
    }
    if let Some(tty0) = slave_fds.first() {
        use nix::unistd::dup2;
        dup2(tty0.as_raw_fd(), 0)?;
        dup2(tty0.as_raw_fd(), 1)?;
        dup2(tty0.as_raw_fd(), 2)?;
    }

    sync.barrier(POST_CONFIGURE)?;

    // The interface(s) P moved are now visible inside this netns; rename,
    // configure, and bring each one up per its NetConf.
    for (idx, net) in conf.networks.iter().enumerate() {
        configure_moved_interface(net, name, idx)?;
    }

    sync.barrier(POST_NETWORK)?;

    drop_capabilities(&conf.cap_drop)?;
    // The sync fd itself must survive this sweep: execve's implicit CLOEXEC
    // close of it (not an explicit wake) is what P observes as POST_START
    // below, and `sync.abort()` still needs a live fd if exec_init fails.
    close_unneeded_fds(sync.as_raw_fd());

    exec_init(command)
}

fn configure_moved_interface(net: &NetConf, name: &str, idx: usize) -> Result<()> {
    let common = net_common(net);
    let tag = net_dev_tag(name, idx);
    let current_name = match net {
        NetConf::Veth(_) => Some(veth_peer_name(&tag)),
        NetConf::Macvlan(_) => Some(macvlan_dev_name(&tag)),
        NetConf::Phys(c) => c.link.clone(),
        NetConf::Empty(_) => None,
    };
    let Some(current_name) = current_name else {
        return Ok(());
    };
    let target_name = common.name.clone().unwrap_or_else(|| current_name.clone());
    if target_name != current_name {
        network::device_rename(&current_name, &target_name).map_err(Error::Net)?;
    }
    if let Some(mac) = common.hwaddr {
        network::device_set_mac(&target_name, mac).map_err(Error::Net)?;
    }
    if let Some(mtu) = common.mtu {
        network::device_set_mtu(&target_name, mtu).map_err(Error::Net)?;
    }
    for addr in &common.ipv4 {
        network::ip_addr_add(&target_name, addr.addr, addr.prefix, addr.bcast)
            .map_err(Error::Net)?;
    }
    for addr in &common.ipv6 {
        network::ip6_addr_add(&target_name, addr.addr, addr.prefix).map_err(Error::Net)?;
    }
    if common.flags_up {
        network::device_up(&target_name).map_err(Error::Net)?;
    }
    Ok(())
}

fn drop_capabilities(names: &[String]) -> Result<()> {
    use std::str::FromStr;
    for name in names {
        if let Ok(cap) = caps::Capability::from_str(&format!("CAP_{}", name.to_uppercase())) {
            caps::drop(None, caps::CapSet::Effective, cap)
                .map_err(|e| Error::Namespace(e.to_string()))?;
            caps::drop(None, caps::CapSet::Permitted, cap)
                .map_err(|e| Error::Namespace(e.to_string()))?;
            caps::drop(None, caps::CapSet::Inheritable, cap)
                .map_err(|e| Error::Namespace(e.to_string()))?;
        }
    }
    Ok(())
}

/// Closes every open descriptor except stdin/stdout/stderr (and whatever
/// pty slave was dup2'd onto them before exec) and `keep`, the sync
/// channel's own fd, which must stay open for its CLOEXEC close on
/// `execve` to be observable by the parent.
fn close_unneeded_fds(keep: std::os::fd::RawFd) {
    const KEEP_BELOW: i32 = 3;
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
                if fd >= KEEP_BELOW && fd != keep {
                    unsafe {
                        nix::libc::close(fd);
                    }
                }
            }
        }
    }
}

/// Resets every signal disposition to default (except the two that cannot
/// be changed) and `execve`s `command[0]`, falling back to `/sbin/init`
/// with no arguments when `command` is empty (spec.md §6: `start` with no
/// trailing command execs init).
fn exec_init(command: &[String]) -> Result<()> {
    use std::ffi::CString;
    use nix::sys::signal::{signal, SigHandler, Signal};

    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }

    let (program, args): (String, &[String]) = match command.split_first() {
        Some((head, rest)) => (head.clone(), rest),
        None => ("/sbin/init".to_owned(), &[]),
    };
    let program_c = CString::new(program).map_err(|e| Error::Exec(e.to_string()))?;
    let mut argv = vec![program_c.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_str()).map_err(|e| Error::Exec(e.to_string()))?);
    }
    nix::unistd::execv(&program_c, &argv).map_err(|e| Error::Exec(e.to_string()))?;
    unreachable!("execv only returns on error")
}
