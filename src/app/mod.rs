mod actions;
mod body;
mod sync;
pub mod task;
mod watch;

#[cfg(test)]
mod testing;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{AbortHandle, BoxStream};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::config::{Config, ViewerConfig};
use crate::core::error::{TransportError, WatchError};
use crate::core::models::{ConnectionState, FolderInfo, MailMessage, MessageKey};
use crate::core::notify::{NotificationId, NotificationOutcome, Presenter};
use crate::core::transport::{MailConnection, MailConnector, TransportEvent};
use crate::core::viewer::{PreparedView, ViewOutcome, ViewerLauncher};

pub use task::Task;

/// The parts of [`Config`] the watcher consults after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mailbox: String,
    pub recent_window: usize,
    pub connect_delay: Duration,
    pub viewers: ViewerConfig,
    pub spool_dir: PathBuf,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Settings {
            mailbox: config.mailbox.clone(),
            recent_window: config.recent_window,
            connect_delay: config.connect_delay,
            viewers: config.viewer.clone(),
            spool_dir: config.spool_dir.clone(),
        }
    }
}

/// A notification currently on screen.
#[derive(Debug)]
pub(crate) struct LiveNotification {
    pub(crate) id: NotificationId,
    pub(crate) message: MailMessage,
}

/// An open request: fetching the message, then running its viewer.
#[derive(Debug)]
pub(crate) struct ViewSession {
    pub(crate) message: MailMessage,
    pub(crate) started: Instant,
    /// Still waiting on the connection; dropped with it.
    pub(crate) fetching: bool,
}

#[derive(Debug)]
pub enum Event {
    /// Edge from the reachability source.
    Network(bool),

    Connected {
        generation: u64,
        result: Result<Arc<dyn MailConnection>, TransportError>,
    },
    FolderOpened {
        generation: u64,
        result: Result<FolderInfo, TransportError>,
    },
    RecentListed {
        generation: u64,
        result: Result<Vec<MailMessage>, TransportError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },

    NotificationResolved {
        key: MessageKey,
        id: NotificationId,
        outcome: Result<NotificationOutcome, String>,
    },
    FlagOpComplete {
        key: MessageKey,
        result: Result<(), TransportError>,
    },
    BodyFetched {
        generation: u64,
        key: MessageKey,
        result: Result<PreparedView, WatchError>,
    },
    ViewerFinished(ViewOutcome),

    Shutdown,
    Closed,
    Noop,
}

pub struct Watcher {
    pub(super) settings: Settings,
    pub(super) connector: Arc<dyn MailConnector>,
    pub(super) presenter: Arc<dyn Presenter>,
    pub(super) launcher: Arc<dyn ViewerLauncher>,

    pub(super) conn_state: ConnectionState,
    pub(super) online: bool,
    /// Bumped on every teardown; events tagged with an older value are stale.
    pub(super) generation: u64,
    pub(super) connection: Option<Arc<dyn MailConnection>>,
    /// Connect, sync and subscription tasks of the current generation.
    pub(super) inflight: Vec<AbortHandle>,
    /// False when the folder could not be opened: the subscription then
    /// only carries connection errors.
    pub(super) push_enabled: bool,

    // Per connection session
    pub(super) emitted: HashSet<MessageKey>,
    pub(super) marked_read: HashSet<MessageKey>,
    pub(super) flag_pending: HashSet<MessageKey>,

    pub(super) notifications: HashMap<MessageKey, LiveNotification>,
    pub(super) views: HashMap<MessageKey, ViewSession>,

    pub(super) stopping: bool,
}

impl Watcher {
    pub fn new(
        settings: Settings,
        connector: Arc<dyn MailConnector>,
        presenter: Arc<dyn Presenter>,
        launcher: Arc<dyn ViewerLauncher>,
    ) -> Self {
        Watcher {
            settings,
            connector,
            presenter,
            launcher,
            conn_state: ConnectionState::Disconnected,
            online: false,
            generation: 0,
            connection: None,
            inflight: Vec::new(),
            push_enabled: false,
            emitted: HashSet::new(),
            marked_read: HashSet::new(),
            flag_pending: HashSet::new(),
            notifications: HashMap::new(),
            views: HashMap::new(),
            stopping: false,
        }
    }

    pub fn update(&mut self, event: Event) -> Task<Event> {
        match event {
            // Connection lifecycle
            Event::Network(_)
            | Event::Connected { .. }
            | Event::Shutdown
            | Event::Closed => self.handle_sync(event),

            // Folder listing and push
            Event::FolderOpened { .. }
            | Event::RecentListed { .. }
            | Event::Transport { .. } => self.handle_watch(event),

            // Notification actions and flag mutation
            Event::NotificationResolved { .. } | Event::FlagOpComplete { .. } => {
                self.handle_actions(event)
            }

            Event::BodyFetched { .. } | Event::ViewerFinished(_) => self.handle_body(event),

            Event::Noop => Task::none(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn_state
    }

    /// True once shutdown has closed the connection and every viewer exited.
    pub fn is_finished(&self) -> bool {
        self.stopping && self.conn_state == ConnectionState::Disconnected && self.views.is_empty()
    }

    /// The connection, if it can take requests right now.
    pub(super) fn live_connection(&self) -> Option<Arc<dyn MailConnection>> {
        match self.conn_state {
            ConnectionState::Connected => self.connection.clone(),
            _ => None,
        }
    }

    /// Cancel the current generation's tasks. Opens still fetching their
    /// message are forgotten; running viewers are not touched.
    pub(super) fn abort_inflight(&mut self) {
        for handle in self.inflight.drain(..) {
            handle.abort();
        }
        let before = self.views.len();
        self.views.retain(|_, view| !view.fetching);
        let cancelled = before - self.views.len();
        if cancelled > 0 {
            log::info!("Cancelled {} pending message fetch(es)", cancelled);
        }
    }

    /// Log a failure and surface it through an error notification.
    pub(super) fn report(&self, err: WatchError) -> Task<Event> {
        log::warn!("{}", err);
        let pending = self.presenter.report("Mail notifier error", &err.to_string());
        Task::future(async move {
            pending.await;
            Event::Noop
        })
    }

    /// Drive the watcher until shutdown completes.
    pub async fn run(mut self, network: BoxStream<'static, bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        Task::stream(network.map(Event::Network)).spawn(&tx);
        Task::future(shutdown_signal()).spawn(&tx);

        while let Some(event) = rx.recv().await {
            log::trace!("{:?} in state {:?}", event, self.state());
            self.update(event).spawn(&tx);
            if self.is_finished() {
                break;
            }
        }
        log::info!("Stopped");
    }
}

async fn shutdown_signal() -> Event {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    Event::Shutdown
}
