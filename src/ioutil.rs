use nix::errno::Errno;

/// Retries `f` while it fails with `EINTR`, the way every blocking syscall
/// wrapper in this crate (netlink recv, sync channel I/O, console poll) is
/// expected to behave: restart on interrupt rather than surfacing it.
pub fn retry_eintr<T>(mut f: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}
