//! Error taxonomy for the nl80211 transport layer.
//!
//! Every fallible operation in the library returns [`Result<T>`]. The
//! variants line up with the four classes callers need to tell apart:
//!
//! - **build**: a request could not be encoded and was never sent
//! - **transport**: the socket itself failed (send/recv/setsockopt)
//! - **kernel**: the kernel answered with a negative errno, optionally with
//!   extended-ack text
//! - **transient**: a dump was interrupted because the kernel-side object
//!   list changed mid-dump; safe to re-issue

use std::io;

use thiserror::Error;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport, sessions and the mode state machine.
#[derive(Debug, Error)]
pub enum Error {
    /// The attribute tree or message could not be built.
    #[error("Failed to build message: {0}")]
    Build(String),

    /// Socket send/receive or setup failed.
    #[error("Netlink transport error: {0}")]
    Io(#[from] io::Error),

    /// The kernel rejected the request.
    #[error("Kernel reported error {code}{}", ext_ack_suffix(.message))]
    Kernel {
        /// Negative errno as carried in the netlink error message.
        code: i32,
        /// Extended-ack text, when the kernel supplied one.
        message: Option<String>,
    },

    /// A multi-part dump was interrupted; re-issuing the request is safe.
    #[error("Dump interrupted by a concurrent kernel-side change")]
    DumpInterrupted,

    /// A received datagram was malformed or did not match the request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The global session is not in the `Ready` state.
    #[error("Session not ready (state: {0})")]
    NotReady(&'static str),

    /// No per-radio session with this id exists.
    #[error("Unknown radio session {0}")]
    UnknownRadio(u32),

    /// No virtual interface with this ifindex is known.
    #[error("Unknown interface ifindex {0}")]
    UnknownInterface(u32),

    /// The primary interface only goes away together with its radio.
    #[error("Interface ifindex {0} is the primary interface of its radio")]
    PrimaryInterface(u32),

    /// An OS-level interface/bridge call failed.
    #[error("Interface control failed for {ifname}: errno {errno}")]
    Os {
        /// Interface the call targeted.
        ifname: String,
        /// Negative errno returned by the OS layer.
        errno: i32,
    },
}

fn ext_ack_suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default()
}

impl Error {
    /// Construct a kernel error without extended-ack text.
    pub fn kernel(code: i32) -> Self {
        Self::Kernel { code, message: None }
    }

    /// Negative errno equivalent of this error.
    ///
    /// Kernel errors return the code exactly as received. The other
    /// variants map onto the closest errno so callers that only look at
    /// the number still see a negative result.
    pub fn code(&self) -> i32 {
        match self {
            Self::Kernel { code, .. } => *code,
            Self::Os { errno, .. } => *errno,
            Self::Io(e) => e.raw_os_error().map_or(-libc::EIO, |c| -c),
            Self::Build(_) => -libc::ENOBUFS,
            Self::DumpInterrupted => -libc::EAGAIN,
            Self::Protocol(_) => -libc::EPROTO,
            Self::NotReady(_) => -libc::ENOTCONN,
            Self::UnknownRadio(_) | Self::UnknownInterface(_) => -libc::ENODEV,
            Self::PrimaryInterface(_) => -libc::EBUSY,
        }
    }

    /// True when the kernel reported exactly `errno` (given as a positive
    /// constant such as `libc::EBUSY`).
    pub fn is_errno(&self, errno: i32) -> bool {
        self.code() == -errno
    }
}
