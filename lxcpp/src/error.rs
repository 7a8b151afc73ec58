//! lxcpp's error sum type (§7: Runtime syscall + Lifecycle kinds).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("kernel error (errno {0}): {1}")]
    Kernel(i32, String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("handshake failed at step {step}: {reason}")]
    HandshakeFailed { step: u8, reason: String },
    #[error("template failed: {0}")]
    TemplateFailed(String),
    #[error("cgroup error: {0}")]
    Cgroup(#[from] cgroups::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        use nix::errno::Errno;
        match e {
            nix::Error::Sys(Errno::EPERM) | nix::Error::Sys(Errno::EACCES) => {
                Error::PermissionDenied(e.to_string())
            }
            nix::Error::Sys(Errno::ENOSYS) | nix::Error::Sys(Errno::EINVAL) => {
                Error::InvalidArgument(e.to_string())
            }
            nix::Error::Sys(Errno::EBUSY) => Error::Busy(e.to_string()),
            nix::Error::Sys(Errno::ENOENT) => Error::NotFound(e.to_string()),
            nix::Error::Sys(Errno::EEXIST) => Error::Exists(e.to_string()),
            nix::Error::Sys(errno) => Error::Kernel(errno as i32, e.to_string()),
            other => Error::Kernel(-1, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn step_label(step: u8) -> &'static str {
        match step {
            1 => "GUARD_READY",
            2 => "HOST_MAPS_WRITTEN",
            3 => "INIT_NS_ENTERED",
            4 => "INIT_PROVISIONED",
            5 => "INIT_EXEC",
            6 => "INIT_EXITED",
            _ => "UNKNOWN",
        }
    }
}
