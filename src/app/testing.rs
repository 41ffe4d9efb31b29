//! In-memory collaborators and a paused-clock driver for handler tests.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::channel::{mpsc as chan, oneshot};
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

use crate::config::{ViewerCommand, ViewerConfig};
use crate::core::error::TransportError;
use crate::core::mime::escape_markup;
use crate::core::models::{FolderInfo, MailFlag, MailMessage, MessageKey};
use crate::core::notify::{NotificationId, NotificationOutcome, NotificationRequest, Presenter};
use crate::core::transport::{MailConnection, MailConnector, TransportEvent};
use crate::core::viewer::ViewerLauncher;

use super::{Event, Settings, Watcher};

pub const RAW_MESSAGE: &str = "From: Ada <ada@example.org>\r\n\
To: bob@example.org\r\n\
Subject: Engines\r\n\
\r\n\
Notes on the analytical engine\r\n";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

pub fn message(uid: u64, timestamp: i64) -> MailMessage {
    MailMessage {
        key: MessageKey::new(uid, Some(1)),
        from_name: Some("Ada".into()),
        from_address: "ada@example.org".into(),
        subject: format!("Message {uid}"),
        timestamp,
        is_recent: true,
        is_seen: false,
    }
}

// --- Mailbox ---

#[derive(Default)]
struct ServerState {
    connects: usize,
    connections: Vec<Weak<FakeConnection>>,
    connect_failures: VecDeque<TransportError>,
    folder_failure: Option<TransportError>,
    flag_failures: VecDeque<TransportError>,
    recent: Vec<MailMessage>,
    opened: Vec<(String, bool)>,
    listed_with: Option<usize>,
    flagged: Vec<MessageKey>,
    fetched: Vec<MessageKey>,
    fetch_gate: Option<Arc<Semaphore>>,
}

/// A scripted mail server; also the connector that dials it.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// Connections that were handed out, are still referenced, and were never closed.
    pub fn live(&self) -> usize {
        lock(&self.state)
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        lock(&self.state).connect_failures.push_back(err);
    }

    pub fn fail_folder(&self, err: TransportError) {
        lock(&self.state).folder_failure = Some(err);
    }

    pub fn fail_next_flag(&self, err: TransportError) {
        lock(&self.state).flag_failures.push_back(err);
    }

    pub fn set_recent(&self, messages: Vec<MailMessage>) {
        lock(&self.state).recent = messages;
    }

    pub fn opened(&self) -> Vec<(String, bool)> {
        lock(&self.state).opened.clone()
    }

    pub fn listed_with(&self) -> Option<usize> {
        lock(&self.state).listed_with
    }

    /// Every `set_flag` call, failed ones included.
    pub fn flagged(&self) -> Vec<MessageKey> {
        lock(&self.state).flagged.clone()
    }

    pub fn fetched(&self) -> Vec<MessageKey> {
        lock(&self.state).fetched.clone()
    }

    /// Make body fetches wait until [`FakeServer::release_fetches`].
    pub fn hold_fetches(&self) {
        lock(&self.state).fetch_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_fetches(&self) {
        if let Some(gate) = lock(&self.state).fetch_gate.take() {
            gate.close();
        }
    }

    /// Deliver on the newest open connection's push channel. Dropped when
    /// nothing is subscribed.
    pub fn push(&self, event: TransportEvent) {
        let conn = lock(&self.state)
            .connections
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|c| !c.closed.load(Ordering::SeqCst));
        if let Some(conn) = conn {
            if let Some(push) = lock(&conn.push).as_ref() {
                let _ = push.unbounded_send(event);
            }
        }
    }
}

impl MailConnector for FakeServer {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn MailConnection>, TransportError>> {
        let state = self.state.clone();
        async move {
            let mut server = lock(&state);
            server.connects += 1;
            if let Some(err) = server.connect_failures.pop_front() {
                return Err(err);
            }
            let conn = Arc::new(FakeConnection {
                state: state.clone(),
                closed: AtomicBool::new(false),
                push: Mutex::new(None),
            });
            server.connections.push(Arc::downgrade(&conn));
            let conn: Arc<dyn MailConnection> = conn;
            Ok(conn)
        }
        .boxed()
    }
}

pub struct FakeConnection {
    state: Arc<Mutex<ServerState>>,
    closed: AtomicBool,
    push: Mutex<Option<chan::UnboundedSender<TransportEvent>>>,
}

impl fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeConnection")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FakeConnection {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::not_connected())
        } else {
            Ok(())
        }
    }
}

impl MailConnection for FakeConnection {
    fn open_folder(&self, name: &str, read_only: bool) -> BoxFuture<'static, Result<FolderInfo, TransportError>> {
        let mut server = lock(&self.state);
        server.opened.push((name.to_string(), read_only));
        let result = self.check_open().and_then(|()| match &server.folder_failure {
            Some(err) => Err(err.clone()),
            None => Ok(FolderInfo {
                path: name.to_string(),
                count: server.recent.len(),
            }),
        });
        future::ready(result).boxed()
    }

    fn list_recent(&self, n: usize) -> BoxFuture<'static, Result<Vec<MailMessage>, TransportError>> {
        let mut server = lock(&self.state);
        server.listed_with = Some(n);
        let skip = server.recent.len().saturating_sub(n);
        let recent = server.recent.iter().skip(skip).cloned().collect();
        let result = self.check_open().map(|()| recent);
        future::ready(result).boxed()
    }

    fn fetch_body(&self, key: MessageKey) -> BoxStream<'static, Result<Vec<u8>, TransportError>> {
        let gate = {
            let mut server = lock(&self.state);
            server.fetched.push(key);
            server.fetch_gate.clone()
        };
        let result = self.check_open().map(|()| RAW_MESSAGE.as_bytes().to_vec());
        stream::once(async move {
            if let Some(gate) = gate {
                // Closed on release; either way the wait is over.
                let _ = gate.acquire().await;
            }
            result
        })
        .boxed()
    }

    fn set_flag(&self, key: MessageKey, _flag: MailFlag) -> BoxFuture<'static, Result<(), TransportError>> {
        let mut server = lock(&self.state);
        server.flagged.push(key);
        let result = match server.flag_failures.pop_front() {
            Some(err) => Err(err),
            None => self.check_open(),
        };
        future::ready(result).boxed()
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        let (tx, rx) = chan::unbounded();
        *lock(&self.push) = Some(tx);
        rx.boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.push).take();
        future::ready(()).boxed()
    }
}

// --- Notifications ---

#[derive(Default)]
struct PresenterState {
    requests: Vec<NotificationRequest>,
    pending: Vec<(NotificationRequest, oneshot::Sender<NotificationOutcome>)>,
    reports: Vec<(String, String)>,
    closed: Vec<NotificationId>,
    fail_next: Option<String>,
}

/// Records notifications; the test decides how each one resolves.
#[derive(Default)]
pub struct FakePresenter {
    state: Mutex<PresenterState>,
}

impl FakePresenter {
    pub fn requests(&self) -> Vec<NotificationRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn reports(&self) -> Vec<(String, String)> {
        lock(&self.state).reports.clone()
    }

    /// Notifications the watcher asked to take down.
    pub fn closed(&self) -> Vec<NotificationId> {
        lock(&self.state).closed.clone()
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn fail_next(&self, err: &str) {
        lock(&self.state).fail_next = Some(err.to_string());
    }

    pub fn resolve_all(&self, outcome: NotificationOutcome) {
        for (_, tx) in lock(&self.state).pending.drain(..) {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve the outstanding notification whose subject line is `subject`.
    pub fn resolve(&self, subject: &str, outcome: NotificationOutcome) {
        let suffix = format!("\n{}", escape_markup(subject));
        let mut state = lock(&self.state);
        if let Some(pos) = state
            .pending
            .iter()
            .position(|(request, _)| request.body.ends_with(&suffix))
        {
            let (_, tx) = state.pending.remove(pos);
            let _ = tx.send(outcome);
        }
    }
}

impl Presenter for FakePresenter {
    fn present(&self, request: NotificationRequest) -> BoxFuture<'static, Result<NotificationOutcome, String>> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());
        if let Some(err) = state.fail_next.take() {
            return future::ready(Err(err)).boxed();
        }
        let (tx, rx) = oneshot::channel();
        state.pending.push((request, tx));
        async move { Ok(rx.await.unwrap_or(NotificationOutcome::Dismissed)) }.boxed()
    }

    fn report(&self, summary: &str, body: &str) -> BoxFuture<'static, ()> {
        lock(&self.state)
            .reports
            .push((summary.to_string(), body.to_string()));
        future::ready(()).boxed()
    }

    fn close(&self, id: NotificationId) -> BoxFuture<'static, ()> {
        let mut state = lock(&self.state);
        state.closed.push(id);
        if let Some(pos) = state.pending.iter().position(|(request, _)| request.id == id) {
            let (_, tx) = state.pending.remove(pos);
            let _ = tx.send(NotificationOutcome::Dismissed);
        }
        future::ready(()).boxed()
    }
}

// --- Viewer ---

#[derive(Debug, Clone)]
pub struct Launch {
    pub program: String,
    pub path: PathBuf,
    pub existed: bool,
}

struct LauncherState {
    exit: Option<i32>,
    held: bool,
    launches: Vec<Launch>,
    running: Vec<PathBuf>,
    overlapped: bool,
}

/// Exits with a configured code, optionally only when released.
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    gate: Arc<Semaphore>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        FakeLauncher {
            state: Arc::new(Mutex::new(LauncherState {
                exit: Some(0),
                held: false,
                launches: Vec::new(),
                running: Vec::new(),
                overlapped: false,
            })),
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

impl FakeLauncher {
    pub fn exit_with(&self, code: Option<i32>) {
        lock(&self.state).exit = code;
    }

    /// Keep viewers running until [`FakeLauncher::release_one`].
    pub fn hold(&self) {
        lock(&self.state).held = true;
    }

    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    pub fn launches(&self) -> Vec<Launch> {
        lock(&self.state).launches.clone()
    }

    pub fn launched(&self) -> usize {
        lock(&self.state).launches.len()
    }

    pub fn running(&self) -> usize {
        lock(&self.state).running.len()
    }

    /// True if a file was ever handed to a viewer while another viewer had it.
    pub fn overlapped(&self) -> bool {
        lock(&self.state).overlapped
    }
}

impl ViewerLauncher for FakeLauncher {
    fn launch(&self, command: &ViewerCommand, path: &Path) -> BoxFuture<'static, io::Result<Option<i32>>> {
        let mut state = lock(&self.state);
        state.launches.push(Launch {
            program: command.program.clone(),
            path: path.to_path_buf(),
            existed: path.exists(),
        });
        if state.running.iter().any(|p| p == path) {
            state.overlapped = true;
        }
        state.running.push(path.to_path_buf());

        let held = state.held;
        let exit = state.exit;
        let path = path.to_path_buf();
        let shared = self.state.clone();
        let gate = self.gate.clone();
        async move {
            if held {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let mut state = lock(&shared);
            if let Some(pos) = state.running.iter().position(|p| *p == path) {
                state.running.remove(pos);
            }
            Ok(exit)
        }
        .boxed()
    }
}

// --- Driver ---

/// A [`Watcher`] wired to fakes, driven step by step on a paused clock.
pub struct Harness {
    pub watcher: Watcher,
    pub server: FakeServer,
    pub presenter: Arc<FakePresenter>,
    pub launcher: Arc<FakeLauncher>,
    pub tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    spool: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let spool = tempfile::Builder::new().prefix("mailwatch-test").tempdir().unwrap();

        let settings = Settings {
            mailbox: "INBOX".into(),
            recent_window: 25,
            connect_delay: Duration::from_millis(250),
            viewers: ViewerConfig::default(),
            spool_dir: spool.path().to_path_buf(),
        };
        let server = FakeServer::default();
        let presenter = Arc::new(FakePresenter::default());
        let launcher = Arc::new(FakeLauncher::default());
        let watcher = Watcher::new(
            settings,
            Arc::new(server.clone()),
            presenter.clone(),
            launcher.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            watcher,
            server,
            presenter,
            launcher,
            tx,
            rx,
            spool,
        }
    }

    /// Online, connected, initial sync done, push subscribed.
    pub async fn connected() -> Self {
        let mut h = Self::new();
        h.connect().await;
        h
    }

    pub async fn connect(&mut self) {
        self.send(Event::Network(true));
        self.run_for(Duration::from_millis(300)).await;
    }

    /// Files currently in the spool directory.
    pub fn spooled(&self) -> usize {
        std::fs::read_dir(self.spool.path()).unwrap().count()
    }

    pub fn send(&self, event: Event) {
        self.tx.send(event).unwrap();
    }

    fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.watcher.update(event).spawn(&self.tx);
        }
    }

    /// Process events while `duration` of virtual time passes.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            self.drain();
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.drain();
    }

    pub async fn settle(&mut self) {
        self.run_for(Duration::from_millis(10)).await;
    }

    pub async fn run_until(&mut self, done: impl Fn(&Self) -> bool) {
        for _ in 0..10_000 {
            self.drain();
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }
}
