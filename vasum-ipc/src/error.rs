//! vasum-ipc's error sum type — the Transport, Protocol, and User kinds of
//! §7's taxonomy (the Runtime syscall and Lifecycle kinds live in
//! `lxcpp::Error`).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("call timed out")]
    Timeout,
    #[error("processor is closing")]
    Closing,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown method {0}")]
    UnknownMethod(u32),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("duplicate method id {0}")]
    DuplicateId(u32),
    #[error("unknown peer {0}")]
    UnknownPeer(u64),
    #[error("user error {code}: {message}")]
    UserError { code: i32, message: String },
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let errno = e.as_errno().unwrap_or(nix::errno::Errno::EIO);
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
