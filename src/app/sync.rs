use std::sync::Arc;

use futures::future;
use futures::FutureExt;

use crate::core::error::{TransportError, TransportErrorKind, WatchError};
use crate::core::models::ConnectionState;
use crate::core::transport::MailConnection;

use super::{Event, Task, Watcher};

impl Watcher {
    pub(super) fn handle_sync(&mut self, event: Event) -> Task<Event> {
        match event {
            Event::Network(online) => {
                self.online = online;
                if self.stopping {
                    return Task::none();
                }
                if online {
                    if self.conn_state == ConnectionState::Disconnected {
                        log::info!("Network is up, connecting");
                        return self.schedule_connect();
                    }
                } else if self.conn_state.is_active() {
                    log::info!("Network is down, dropping connection");
                    let close = self.teardown();
                    self.conn_state = ConnectionState::Disconnected;
                    return close;
                }
            }

            Event::Connected { generation, result } => {
                if generation != self.generation || self.conn_state != ConnectionState::Connecting {
                    log::debug!("Discarding stale connect result (generation {})", generation);
                    if let Ok(conn) = result {
                        return close_task(conn);
                    }
                    return Task::none();
                }
                match result {
                    Ok(conn) => {
                        log::info!("Connected, opening {}", self.settings.mailbox);
                        self.conn_state = ConnectionState::Connected;
                        self.connection = Some(conn.clone());
                        self.emitted.clear();
                        self.marked_read.clear();
                        self.flag_pending.clear();
                        return self.initial_sync(conn);
                    }
                    Err(e) => return self.on_transport_error(e),
                }
            }

            Event::Shutdown => {
                if self.stopping {
                    return Task::none();
                }
                log::info!("Shutting down");
                self.stopping = true;
                self.generation += 1;
                self.abort_inflight();

                let notifications: Vec<_> = self
                    .notifications
                    .values()
                    .map(|live| self.presenter.close(live.id))
                    .collect();
                let conn = self.connection.take();
                if conn.is_some() || !notifications.is_empty() {
                    self.conn_state = ConnectionState::Closing;
                    return Task::future(async move {
                        if let Some(conn) = conn {
                            conn.close().await;
                        }
                        future::join_all(notifications).await;
                        Event::Closed
                    });
                }
                self.conn_state = ConnectionState::Disconnected;
                if !self.views.is_empty() {
                    log::info!("Waiting for {} viewer(s) to exit", self.views.len());
                }
            }

            Event::Closed => {
                self.conn_state = ConnectionState::Disconnected;
                if !self.views.is_empty() {
                    log::info!("Waiting for {} viewer(s) to exit", self.views.len());
                }
            }

            _ => {}
        }
        Task::none()
    }

    /// Drop whatever connection exists and start a fresh attempt after the
    /// connect delay. Going offline before the delay elapses cancels it.
    pub(super) fn schedule_connect(&mut self) -> Task<Event> {
        let close = self.teardown();
        self.conn_state = ConnectionState::Connecting;

        let generation = self.generation;
        let delay = self.settings.connect_delay;
        let connector = self.connector.clone();
        let (connect, handle) = Task::future(async move {
            tokio::time::sleep(delay).await;
            let result = connector.connect().await;
            Event::Connected { generation, result }
        })
        .abortable();
        self.inflight.push(handle);

        Task::batch([close, connect])
    }

    /// Invalidate the current generation and release its connection.
    /// Leaves `conn_state` to the caller.
    pub(super) fn teardown(&mut self) -> Task<Event> {
        self.generation += 1;
        self.push_enabled = false;
        self.abort_inflight();
        match self.connection.take() {
            Some(conn) => {
                log::debug!("Releasing connection");
                close_task(conn)
            }
            None => Task::none(),
        }
    }

    pub(super) fn on_transport_error(&mut self, err: TransportError) -> Task<Event> {
        match err.kind {
            TransportErrorKind::Timeout => {
                log::warn!("{}; reconnecting", err);
                self.schedule_connect()
            }
            TransportErrorKind::UnreachableHost => {
                let close = self.teardown();
                self.conn_state = ConnectionState::Disconnected;
                log::warn!("{}; waiting for the network", err);
                Task::batch([close, self.report_connection(err)])
            }
            _ => {
                let close = self.teardown();
                self.conn_state = ConnectionState::Disconnected;
                log::error!("Mail connection failed: {}", err);
                Task::batch([close, self.report_connection(err)])
            }
        }
    }

    /// The server closed the connection.
    pub(super) fn on_transport_closed(&mut self) -> Task<Event> {
        if self.online && !self.stopping {
            log::info!("Connection closed by server, reconnecting");
            self.schedule_connect()
        } else {
            log::info!("Connection closed by server");
            let close = self.teardown();
            self.conn_state = ConnectionState::Disconnected;
            close
        }
    }

    fn report_connection(&self, err: TransportError) -> Task<Event> {
        let pending = self
            .presenter
            .report("Mail connection lost", &err.to_string());
        Task::future(pending.map(|()| Event::Noop))
    }

    pub(super) fn folder_failed(&self, folder: String, source: TransportError) -> Task<Event> {
        self.report(WatchError::FolderOpen { folder, source })
    }
}

fn close_task(conn: Arc<dyn MailConnection>) -> Task<Event> {
    Task::future(conn.close().map(|()| Event::Noop))
}
