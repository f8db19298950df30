use thiserror::Error;

/// Closed error taxonomy surfaced to callers.
///
/// Every fallible operation in this crate returns one of these kinds; we
/// deliberately do not unify failures into a single opaque errno the way a
/// boxed `dyn Error` would. Callers are expected to match on the variant
/// rather than the message text.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network operation failed: {0}")]
    Net(#[from] NetError),

    #[error("sync channel violation: {0}")]
    Sync(#[from] SyncError),

    #[error("namespace setup failed: {0}")]
    Namespace(String),

    #[error("could not exec init program: {0}")]
    Exec(String),

    #[error("terminal attribute manipulation failed: {0}")]
    Tty(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the network operations in `network.rs`. Each kernel
/// netlink error maps onto exactly one of these via [`NetError::from_errno`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("interface not found")]
    NotFound,
    #[error("interface or address already exists")]
    Exists,
    #[error("operation not permitted")]
    Perm,
    #[error("device or resource busy")]
    Busy,
    #[error("invalid argument")]
    Inval,
    #[error("I/O error (errno {0})")]
    Io(i32),
}

impl NetError {
    /// Classifies a kernel-reported errno (as delivered in an `NLMSG_ERROR`
    /// payload, or from an ioctl/sysctl fallback path) into one of the six
    /// taxonomy members.
    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::ENODEV | Errno::ENXIO => NetError::NotFound,
            Errno::EEXIST => NetError::Exists,
            Errno::EPERM | Errno::EACCES => NetError::Perm,
            Errno::EBUSY => NetError::Busy,
            Errno::EINVAL => NetError::Inval,
            other => NetError::Io(other as i32),
        }
    }
}

/// Sync-channel protocol violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync desync: expected sequence {expected}, got {got}")]
    Desync { expected: u32, got: u32 },
    #[error("peer aborted the launch")]
    PeerAbort,
}
