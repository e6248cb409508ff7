//! The closed error taxonomy shared by every async boundary in the branch
//! runtime. Every fallible completion reports one of
//! these codes; nothing below the `Transport` layer leaks a raw OS error
//! number or `io::ErrorKind` past this enum.

use thiserror::Error;

/// Error codes surfaced by the branch runtime.
///
/// Variants map one-to-one onto the `YOGI_ERR_*` codes of the original
/// C library; only the subset actually reachable from the networked
/// branch subsystem is represented here.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum YogiError {
    #[error("unknown error")]
    Unknown,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("could not open socket")]
    OpenSocketFailed,
    #[error("could not bind socket")]
    BindSocketFailed,
    #[error("could not set socket option")]
    SetSocketOptionFailed,
    #[error("could not accept connection")]
    AcceptSocketFailed,
    #[error("could not connect")]
    ConnectSocketFailed,
    #[error("read/write on socket failed")]
    RwSocketFailed,
    #[error("invalid magic prefix")]
    InvalidMagicPrefix,
    #[error("incompatible version")]
    IncompatibleVersion,
    #[error("failed to deserialize message")]
    DeserializeMsgFailed,
    #[error("attempted to connect to self")]
    LoopbackConnection,
    #[error("password mismatch")]
    PasswordMismatch,
    #[error("network name mismatch")]
    NetNameMismatch,
    #[error("duplicate branch name")]
    DuplicateBranchName,
    #[error("duplicate branch path")]
    DuplicateBranchPath,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("send queue is full")]
    TxQueueFull,
    #[error("failed to parse JSON payload")]
    ParsingJsonFailed,
    #[error("invalid MessagePack payload")]
    InvalidUserMsgpack,
}

pub type YogiResult<T> = Result<T, YogiError>;

impl YogiError {
    /// Translates a `std::io::Error` from a socket operation into the closed
    /// taxonomy. Used exclusively at the `Transport` boundary so that no
    /// other layer needs to reason about `io::ErrorKind`.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => YogiError::Timeout,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                YogiError::RwSocketFailed
            }
            _ => YogiError::Unknown,
        }
    }
}
