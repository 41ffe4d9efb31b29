use std::sync::Arc;

use futures::StreamExt;

use crate::core::models::MailMessage;
use crate::core::transport::{MailConnection, TransportEvent};

use super::{Event, Task, Watcher};

impl Watcher {
    pub(super) fn handle_watch(&mut self, event: Event) -> Task<Event> {
        match event {
            Event::FolderOpened { generation, result } => {
                if generation != self.generation {
                    log::debug!("Discarding stale folder result (generation {})", generation);
                    return Task::none();
                }
                let Some(conn) = self.live_connection() else {
                    return Task::none();
                };
                match result {
                    Ok(folder) => {
                        log::info!("{}: {} messages", folder.path, folder.count);
                        return self.list_recent(conn);
                    }
                    // Not a connection failure: a dead connection still
                    // surfaces through the error-only subscription.
                    Err(e) => {
                        let folder = self.settings.mailbox.clone();
                        let report = self.folder_failed(folder, e);
                        let subscribe = self.subscribe(&conn, false);
                        return Task::batch([report, subscribe]);
                    }
                }
            }

            Event::RecentListed { generation, result } => {
                if generation != self.generation {
                    log::debug!("Discarding stale listing (generation {})", generation);
                    return Task::none();
                }
                let Some(conn) = self.live_connection() else {
                    return Task::none();
                };
                match result {
                    Ok(messages) => {
                        let mut recent: Vec<MailMessage> =
                            messages.into_iter().filter(|m| m.is_recent).collect();
                        recent.sort_by_key(|m| m.timestamp);
                        log::info!("{} recent message(s)", recent.len());

                        let mut tasks: Vec<Task<Event>> =
                            recent.into_iter().map(|m| self.emit(m)).collect();
                        // Push starts only after the initial batch is out.
                        tasks.push(self.subscribe(&conn, true));
                        return Task::batch(tasks);
                    }
                    Err(e) => return self.on_transport_error(e),
                }
            }

            Event::Transport { generation, event } => {
                if generation != self.generation {
                    log::debug!("Discarding stale transport event: {:?}", event);
                    return Task::none();
                }
                match event {
                    TransportEvent::NewMessage(message) => {
                        if self.push_enabled {
                            return self.emit(message);
                        }
                        log::debug!("Ignoring push for {} without an open folder", message.key);
                    }
                    TransportEvent::Error(e) => return self.on_transport_error(e),
                    TransportEvent::Disconnected => return self.on_transport_closed(),
                }
            }

            _ => {}
        }
        Task::none()
    }

    /// Open the watched folder read-write; listing follows on success.
    pub(super) fn initial_sync(&mut self, conn: Arc<dyn MailConnection>) -> Task<Event> {
        let generation = self.generation;
        let opened = conn.open_folder(&self.settings.mailbox, false);
        let (task, handle) = Task::future(async move {
            Event::FolderOpened {
                generation,
                result: opened.await,
            }
        })
        .abortable();
        self.inflight.push(handle);
        task
    }

    fn list_recent(&mut self, conn: Arc<dyn MailConnection>) -> Task<Event> {
        let generation = self.generation;
        let listed = conn.list_recent(self.settings.recent_window);
        let (task, handle) = Task::future(async move {
            Event::RecentListed {
                generation,
                result: listed.await,
            }
        })
        .abortable();
        self.inflight.push(handle);
        task
    }

    fn subscribe(&mut self, conn: &Arc<dyn MailConnection>, push: bool) -> Task<Event> {
        self.push_enabled = push;
        let generation = self.generation;
        let (task, handle) = Task::stream(
            conn.events()
                .map(move |event| Event::Transport { generation, event }),
        )
        .abortable();
        self.inflight.push(handle);
        task
    }

    /// Hand a message to the notification side, once per session.
    fn emit(&mut self, message: MailMessage) -> Task<Event> {
        if !self.emitted.insert(message.key) {
            log::debug!("Message {} already seen this session", message.key);
            return Task::none();
        }
        log::info!("New mail from {}: {}", message.sender(), message.subject);
        self.present(message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{message, Harness};
    use super::*;
    use crate::core::error::TransportError;
    use crate::core::models::ConnectionState;

    #[tokio::test(start_paused = true)]
    async fn initial_sync_presents_recent_oldest_first() {
        let mut h = Harness::new();
        let mut seen = message(3, 30);
        seen.is_recent = false;
        seen.is_seen = true;
        h.server.set_recent(vec![message(2, 50), seen, message(1, 10)]);
        h.connect().await;

        let subjects: Vec<String> = h
            .presenter
            .requests()
            .iter()
            .map(|r| r.body.clone())
            .collect();
        assert_eq!(subjects.len(), 2);
        assert!(subjects[0].ends_with("Message 1"));
        assert!(subjects[1].ends_with("Message 2"));
        assert_eq!(h.server.listed_with(), Some(25));
        assert_eq!(h.server.opened(), vec![("INBOX".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_messages_are_presented_once() {
        let mut h = Harness::new();
        h.server.set_recent(vec![message(1, 10)]);
        h.connect().await;

        h.server.push(TransportEvent::NewMessage(message(1, 10)));
        h.server.push(TransportEvent::NewMessage(message(2, 20)));
        h.server.push(TransportEvent::NewMessage(message(2, 20)));
        h.settle().await;

        assert_eq!(h.presenter.requests().len(), 2);
        assert_eq!(h.watcher.notifications.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn folder_refusal_reports_but_stays_connected() {
        let mut h = Harness::new();
        h.server.fail_folder(TransportError::protocol("NO [NONEXISTENT]"));
        h.server.set_recent(vec![message(1, 10)]);
        h.connect().await;

        assert_eq!(h.watcher.state(), ConnectionState::Connected);
        assert_eq!(h.presenter.reports().len(), 1);
        assert!(h.presenter.requests().is_empty());

        // Pushes are ignored, connection errors still supervised.
        h.server.push(TransportEvent::NewMessage(message(2, 20)));
        h.settle().await;
        assert!(h.presenter.requests().is_empty());

        h.server.push(TransportEvent::Error(TransportError::timeout("stalled")));
        h.run_for(std::time::Duration::from_millis(500)).await;
        assert_eq!(h.server.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn folder_open_timeout_reports_but_stays_connected() {
        let mut h = Harness::new();
        h.server.fail_folder(TransportError::timeout("SELECT stalled"));
        h.connect().await;
        h.run_for(std::time::Duration::from_millis(500)).await;

        assert_eq!(h.watcher.state(), ConnectionState::Connected);
        assert_eq!(h.server.connects(), 1);
        assert_eq!(h.server.live(), 1);
        let reports = h.presenter.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].1.contains("cannot open folder INBOX"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_starts_a_new_session() {
        let mut h = Harness::new();
        h.server.set_recent(vec![message(1, 10)]);
        h.connect().await;
        assert_eq!(h.presenter.requests().len(), 1);

        // Dismiss, then reconnect: the message is still recent on the server.
        h.presenter.resolve_all(crate::core::notify::NotificationOutcome::Dismissed);
        h.settle().await;
        h.server.push(TransportEvent::Disconnected);
        h.run_for(std::time::Duration::from_millis(500)).await;

        assert_eq!(h.server.connects(), 2);
        assert_eq!(h.presenter.requests().len(), 2);
    }
}
