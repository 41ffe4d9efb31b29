use std::fmt;

/// Stable identity of a message: mailbox-assigned uid plus modification
/// sequence when the backend exposes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub uid: u64,
    pub modseq: Option<u64>,
}

impl MessageKey {
    pub fn new(uid: u64, modseq: Option<u64>) -> Self {
        MessageKey { uid, modseq }
    }

    /// File stem for a transient copy of this message.
    pub fn file_stem(&self) -> String {
        match self.modseq {
            Some(modseq) => format!("mail-{}-{}", self.uid, modseq),
            None => format!("mail-{}", self.uid),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.modseq {
            Some(modseq) => write!(f, "{}/{}", self.uid, modseq),
            None => write!(f, "{}", self.uid),
        }
    }
}

/// Summary of a message as listed or pushed by the server (no body).
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub key: MessageKey,
    pub from_name: Option<String>,
    pub from_address: String,
    pub subject: String,
    pub timestamp: i64,
    pub is_recent: bool,
    pub is_seen: bool,
}

impl MailMessage {
    /// `Name <address>`, or the bare address when there is no display name.
    pub fn sender(&self) -> String {
        match self.from_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.from_address),
            _ => self.from_address.clone(),
        }
    }
}

/// Result of opening the watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub path: String,
    pub count: usize,
}

/// Mailbox connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Flags this watcher ever sets on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailFlag {
    Seen,
}

impl MailFlag {
    pub fn imap_name(self) -> &'static str {
        match self {
            MailFlag::Seen => "\\Seen",
        }
    }
}

/// How a message is handed to an external viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    /// The raw RFC 5322 message, verbatim.
    Full,
    Text,
    Html,
}

impl Representation {
    pub fn extension(self) -> &'static str {
        match self {
            Representation::Full => "eml",
            Representation::Text => "txt",
            Representation::Html => "html",
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Representation::Full => "full",
            Representation::Text => "text",
            Representation::Html => "html",
        })
    }
}

/// Actions offered on a new-mail notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyAction {
    Open,
    MarkRead,
}

impl NotifyAction {
    pub const ALL: [NotifyAction; 2] = [NotifyAction::Open, NotifyAction::MarkRead];

    /// Identifier sent to the notification server.
    pub fn id(self) -> &'static str {
        match self {
            NotifyAction::Open => "open",
            NotifyAction::MarkRead => "read",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NotifyAction::Open => "Open",
            NotifyAction::MarkRead => "Mark as read",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.id() == id)
    }
}
