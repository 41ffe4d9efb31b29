use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::core::models::{MessageKey, Representation};

/// Coarse classification of transport failures; drives reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Retry only on the next online transition.
    UnreachableHost,
    /// Retry right away, after the connect delay.
    Timeout,
    Protocol,
    /// The connection was already torn down.
    NotConnected,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportErrorKind::UnreachableHost => "host unreachable",
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::Protocol => "protocol error",
            TransportErrorKind::NotConnected => "not connected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn not_connected() -> Self {
        Self::new(TransportErrorKind::NotConnected, "connection closed")
    }
}

/// Map socket-level failures onto the reconnect taxonomy.
pub fn classify_io(kind: io::ErrorKind) -> TransportErrorKind {
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NetworkDown
        | io::ErrorKind::AddrNotAvailable => TransportErrorKind::UnreachableHost,
        io::ErrorKind::NotConnected => TransportErrorKind::NotConnected,
        _ => TransportErrorKind::Protocol,
    }
}

/// Per-message and per-folder failures. Reported, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot open folder {folder}: {source}")]
    FolderOpen {
        folder: String,
        #[source]
        source: TransportError,
    },

    #[error("cannot mark message {key} as read: {reason}")]
    FlagMutation { key: MessageKey, reason: String },

    #[error("cannot open message {key}: not connected")]
    NotConnected { key: MessageKey },

    #[error("cannot fetch message {key}: {source}")]
    Fetch {
        key: MessageKey,
        #[source]
        source: TransportError,
    },

    #[error("message {key} has no displayable content")]
    Unparseable { key: MessageKey },

    #[error("no viewer configured for {0} messages")]
    NoViewer(Representation),

    #[error("cannot launch viewer {program}: {source}")]
    ViewerLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("viewer {program} exited with {}", exit_label(.code))]
    NonZeroViewerExit { program: String, code: Option<i32> },

    #[error("transient file {}: {source}", .path.display())]
    TransientFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed reachability signal from {source_name}: {detail}")]
    MalformedSignal {
        source_name: &'static str,
        detail: String,
    },

    #[error("notification failed: {0}")]
    Presentation(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}
