use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use indexmap::IndexMap;
use melib::backends::{
    BackendEvent, BackendEventConsumer, BackendMailbox, FlagOp, MailBackend, RefreshEventKind,
};
use melib::error::ErrorKind;
use melib::imap::ImapType;
use melib::{AccountSettings, Envelope, EnvelopeHash, Flag, MailboxHash};

use crate::config::Config;
use crate::core::error::{classify_io, TransportError, TransportErrorKind};
use crate::core::models::{FolderInfo, MailFlag, MailMessage, MessageKey};
use crate::core::transport::{MailConnection, MailConnector, TransportEvent};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens melib IMAP sessions for one account.
pub struct ImapConnector {
    settings: AccountSettings,
    label: String,
}

impl ImapConnector {
    pub fn new(config: &Config) -> Self {
        ImapConnector {
            settings: account_settings(config),
            label: format!("{}@{}", config.username, config.imap_server),
        }
    }
}

fn account_settings(config: &Config) -> AccountSettings {
    let mut extra = IndexMap::new();
    extra.insert("server_hostname".to_string(), config.imap_server.clone());
    extra.insert("server_username".to_string(), config.username.clone());
    extra.insert("server_password".to_string(), config.password.clone());
    extra.insert("server_port".to_string(), config.imap_port.to_string());
    extra.insert("use_starttls".to_string(), config.use_starttls.to_string());
    extra.insert("use_tls".to_string(), (config.use_tls || config.use_starttls).to_string());
    extra.insert(
        "danger_accept_invalid_certs".to_string(),
        config.accept_invalid_certs.to_string(),
    );
    extra.insert("use_idle".to_string(), "true".to_string());

    AccountSettings {
        name: format!("{}@{}", config.username, config.imap_server),
        root_mailbox: config.mailbox.clone(),
        format: "imap".to_string(),
        identity: config.username.clone(),
        extra,
        ..Default::default()
    }
}

impl MailConnector for ImapConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn MailConnection>, TransportError>> {
        let settings = self.settings.clone();
        let label = self.label.clone();
        async move {
            log::info!("Connecting to {}", label);
            let (event_tx, event_rx) = mpsc::unbounded();
            let consumer = BackendEventConsumer::new(Arc::new(move |_account, event| {
                let _ = event_tx.unbounded_send(event);
            }));
            let backend: Box<dyn MailBackend> =
                ImapType::new(&settings, (Box::new(|_: &str| true) as Box<dyn Fn(&str) -> bool + Send + Sync>).into(), consumer).map_err(classify)?;

            let online = backend.is_online().map_err(classify)?;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, online).await {
                Ok(result) => result.map_err(classify)?,
                Err(_) => {
                    return Err(TransportError::timeout(format!(
                        "no answer from {} within {:?}",
                        label, HANDSHAKE_TIMEOUT
                    )))
                }
            }

            let connection: Arc<dyn MailConnection> = Arc::new(ImapConnection {
                backend: Arc::new(Mutex::new(Some(backend))),
                selected: Arc::new(Mutex::new(None)),
                backend_events: Mutex::new(Some(event_rx)),
                label,
            });
            Ok(connection)
        }
        .boxed()
    }
}

/// One melib IMAP session. `close` drops the backend.
pub struct ImapConnection {
    backend: Arc<Mutex<Option<Box<dyn MailBackend>>>>,
    selected: Arc<Mutex<Option<MailboxHash>>>,
    backend_events: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
    label: String,
}

impl fmt::Debug for ImapConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConnection")
            .field("label", &self.label)
            .field("selected", &*lock(&self.selected))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ImapConnection {
    fn with_backend<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn MailBackend>) -> melib::Result<T>,
    ) -> Result<T, TransportError> {
        let mut guard = lock(&self.backend);
        let backend = guard.as_mut().ok_or_else(TransportError::not_connected)?;
        f(backend).map_err(classify)
    }

    fn selected(&self) -> Result<MailboxHash, TransportError> {
        lock(&self.selected)
            .ok_or_else(|| TransportError::protocol("no folder selected"))
    }
}

impl MailConnection for ImapConnection {
    fn open_folder(
        &self,
        name: &str,
        read_only: bool,
    ) -> BoxFuture<'static, Result<FolderInfo, TransportError>> {
        if read_only {
            log::debug!("{}: read-only select is not supported, opening read-write", self.label);
        }
        let mailboxes = self.with_backend(|backend| backend.mailboxes());
        let selected = self.selected.clone();
        let name = name.to_string();
        async move {
            let mailboxes = mailboxes?.await.map_err(classify)?;
            let (hash, mailbox) = mailboxes
                .iter()
                .find(|(_, mailbox)| mailbox.path() == name)
                .ok_or_else(|| TransportError::protocol(format!("no such folder: {name}")))?;
            let (_unseen, total) = mailbox.count().map_err(classify)?;
            *lock(&selected) = Some(*hash);
            Ok(FolderInfo {
                path: mailbox.path().to_string(),
                count: total,
            })
        }
        .boxed()
    }

    // melib's fetch has no window: every envelope in the folder streams in
    // and all but the newest `n` are dropped. Costly on large folders, but
    // only paid once per connection.
    fn list_recent(&self, n: usize) -> BoxFuture<'static, Result<Vec<MailMessage>, TransportError>> {
        let stream = self
            .selected()
            .and_then(|mailbox| self.with_backend(|backend| backend.fetch(mailbox)));
        async move {
            let mut stream = stream?;
            let mut envelopes: Vec<Envelope> = Vec::new();
            while let Some(batch) = stream.next().await {
                envelopes.extend(batch.map_err(classify)?);
            }
            envelopes.sort_by_key(|envelope| envelope.date());
            let skip = envelopes.len().saturating_sub(n);
            Ok(envelopes.iter().skip(skip).map(summarize).collect())
        }
        .boxed()
    }

    fn fetch_body(&self, key: MessageKey) -> BoxStream<'static, Result<Vec<u8>, TransportError>> {
        let bytes = self.with_backend(|backend| backend.envelope_bytes_by_hash(EnvelopeHash(key.uid)));
        stream::once(async move { bytes?.await.map_err(classify) }).boxed()
    }

    fn set_flag(&self, key: MessageKey, flag: MailFlag) -> BoxFuture<'static, Result<(), TransportError>> {
        log::debug!("{}: setting {} on {}", self.label, flag.imap_name(), key);
        let op = match flag {
            MailFlag::Seen => FlagOp::Set(Flag::SEEN),
        };
        let pending = self.selected().and_then(|mailbox| {
            self.with_backend(|backend| {
                backend.set_flags(EnvelopeHash(key.uid).into(), mailbox, vec![op].into())
            })
        });
        async move { pending?.await.map_err(classify) }.boxed()
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        let mailbox = lock(&self.selected).as_ref().copied();
        let watch = match self.with_backend(|backend| backend.watch()) {
            Ok(watch) => watch,
            Err(e) => return stream::once(future::ready(TransportEvent::Error(e))).boxed(),
        };

        let pushed = watch
            .filter_map(move |event| {
                future::ready(match event {
                    Ok(event) => translate(event, mailbox),
                    Err(e) => Some(TransportEvent::Error(classify(e))),
                })
            })
            .chain(stream::once(future::ready(TransportEvent::Disconnected)));

        match lock(&self.backend_events).take() {
            Some(consumer) => {
                let consumed =
                    consumer.filter_map(move |event| future::ready(translate(event, mailbox)));
                stream::select(pushed, consumed).boxed()
            }
            None => pushed.boxed(),
        }
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let backend = lock(&self.backend).take();
        *lock(&self.selected) = None;
        let label = self.label.clone();
        async move {
            if backend.is_some() {
                log::debug!("{}: connection released", label);
            }
            drop(backend);
        }
        .boxed()
    }
}

fn translate(event: BackendEvent, mailbox: Option<MailboxHash>) -> Option<TransportEvent> {
    match event {
        BackendEvent::Refresh(rev) if Some(rev.mailbox_hash) == mailbox => match rev.kind {
            RefreshEventKind::Create(envelope) => Some(TransportEvent::NewMessage(summarize(&envelope))),
            RefreshEventKind::Failure(e) => Some(TransportEvent::Error(classify(e))),
            other => {
                log::debug!("Unhandled IMAP refresh event kind: {:?}", other);
                None
            }
        },
        other => {
            log::debug!("Ignoring backend event: {:?}", other);
            None
        }
    }
}

fn summarize(envelope: &Envelope) -> MailMessage {
    let sender = envelope.from().first();
    let is_seen = envelope.flags().contains(Flag::SEEN);
    MailMessage {
        key: MessageKey::new(envelope.hash().0, None),
        from_name: sender.and_then(|a| a.get_display_name()),
        from_address: sender.map(|a| a.get_email()).unwrap_or_default(),
        subject: envelope.subject().to_string(),
        timestamp: envelope.date() as i64,
        // melib does not surface \Recent; unseen is the closest signal.
        is_recent: !is_seen,
        is_seen,
    }
}

fn classify(err: melib::Error) -> TransportError {
    let kind = io_kind(&err).unwrap_or(match err.kind {
        ErrorKind::TimedOut => TransportErrorKind::Timeout,
        _ => TransportErrorKind::Protocol,
    });
    TransportError::new(kind, err.to_string())
}

fn io_kind(err: &(dyn std::error::Error + 'static)) -> Option<TransportErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(classify_io(io.kind()));
        }
        current = e.source();
    }
    None
}
