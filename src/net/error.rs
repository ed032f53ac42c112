use crate::net::NetId;

/// Error type for all registry and packet-filter operations.
///
/// External callers speak errno: every variant maps to a small negative
/// integer via [`NetError::code`], and that mapping is part of the daemon's
/// API contract.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("no such netId {0}")]
    NoNetwork(NetId),

    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    /// Recorded state references a network that is gone. Internal
    /// inconsistency, distinct from a caller naming a bad netId.
    #[error("previously set default network {0} is gone")]
    DanglingDefault(NetId),

    #[error("operation not supported on {kind} network {net_id}")]
    WrongVariant { net_id: NetId, kind: &'static str },

    #[error("interface {interface} already assigned to netId {net_id}")]
    Busy { interface: String, net_id: NetId },

    #[error("uid {0} lacks permission bits or allowlist membership")]
    AccessDenied(crate::net::Uid),

    #[error("uid {0} is restricted to its own networks")]
    PermissionDenied(crate::net::Uid),

    #[error("interface {0} not assigned to any netId")]
    NoInterface(String),

    #[error("interface {interface} assigned to netId {actual}, not {requested}")]
    WrongNetwork {
        interface: String,
        actual: NetId,
        requested: NetId,
    },

    #[error("peer uid could not be identified")]
    RemoteIo,

    #[error("no free OEM netId")]
    Exhausted,

    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// The errno-style code reported at the daemon API boundary.
    pub fn code(&self) -> i32 {
        match self {
            NetError::InvalidArgument(_) => -libc::EINVAL,
            NetError::Duplicate(_) => -libc::EEXIST,
            NetError::NoNetwork(_) => -libc::ENONET,
            NetError::NoSuchEntry(_) => -libc::ENOENT,
            NetError::DanglingDefault(_) => -libc::ESRCH,
            NetError::WrongVariant { .. } => -libc::EOPNOTSUPP,
            NetError::Busy { .. } => -libc::EBUSY,
            NetError::AccessDenied(_) => -libc::EACCES,
            NetError::PermissionDenied(_) => -libc::EPERM,
            NetError::NoInterface(_) => -libc::ENODEV,
            NetError::WrongNetwork { .. } => -libc::ENOENT,
            NetError::RemoteIo => -libc::EREMOTEIO,
            NetError::Exhausted => -libc::ENOSPC,
            NetError::Command { .. } | NetError::Io(_) => -libc::EIO,
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
