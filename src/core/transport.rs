//! Contracts the watcher needs from a mailbox transport.
//!
//! Every method returns a `'static` future or stream so the caller can hand
//! it to the event loop without holding a borrow of the connection. The
//! call itself happens synchronously; only completion is deferred.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::core::error::TransportError;
use crate::core::models::{FolderInfo, MailFlag, MailMessage, MessageKey};

/// Asynchronous notices produced by a live connection, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    NewMessage(MailMessage),
    Error(TransportError),
    /// The server or the socket closed the connection.
    Disconnected,
}

/// Creates connections. Each successful call yields a fresh, independent
/// connection; the caller owns closing it.
pub trait MailConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn MailConnection>, TransportError>>;
}

pub trait MailConnection: fmt::Debug + Send + Sync {
    /// Select `name`. Later listing, fetch and flag calls apply to it.
    fn open_folder(
        &self,
        name: &str,
        read_only: bool,
    ) -> BoxFuture<'static, Result<FolderInfo, TransportError>>;

    /// The last `n` messages of the open folder, oldest first.
    fn list_recent(&self, n: usize) -> BoxFuture<'static, Result<Vec<MailMessage>, TransportError>>;

    /// Raw message bytes, in chunks.
    fn fetch_body(&self, key: MessageKey) -> BoxStream<'static, Result<Vec<u8>, TransportError>>;

    fn set_flag(&self, key: MessageKey, flag: MailFlag)
        -> BoxFuture<'static, Result<(), TransportError>>;

    /// Push channel for the open folder. Ends after `Disconnected`.
    fn events(&self) -> BoxStream<'static, TransportEvent>;

    /// Release the connection. Further calls fail with `NotConnected`.
    fn close(&self) -> BoxFuture<'static, ()>;
}
