use std::time::Instant;

use futures::FutureExt;

use crate::core::error::WatchError;
use crate::core::models::MailMessage;
use crate::core::viewer::{self, ViewRequest};

use super::{Event, Task, ViewSession, Watcher};

impl Watcher {
    pub(super) fn handle_body(&mut self, event: Event) -> Task<Event> {
        match event {
            Event::BodyFetched {
                generation,
                key,
                result,
            } => {
                if generation != self.generation {
                    // Dropping the prepared view removes its file.
                    log::debug!("Discarding stale fetch of {} (generation {})", key, generation);
                    return Task::none();
                }
                match result {
                    Ok(prepared) => {
                        let Some(session) = self.views.get_mut(&key) else {
                            log::debug!("Fetched untracked message {}", key);
                            return Task::none();
                        };
                        session.fetching = false;
                        let launcher = self.launcher.clone();
                        Task::future(viewer::run_viewer(launcher, prepared).map(Event::ViewerFinished))
                    }
                    Err(e) => {
                        self.views.remove(&key);
                        self.report(e)
                    }
                }
            }

            Event::ViewerFinished(outcome) => {
                let key = outcome.key;
                let Some(session) = self.views.remove(&key) else {
                    log::debug!("Viewer finished for untracked message {}", key);
                    return Task::none();
                };
                log::debug!(
                    "Viewer for \"{}\" ({}) ran {:?}",
                    session.message.subject,
                    outcome.representation,
                    session.started.elapsed()
                );

                match outcome.result {
                    Ok(()) => {
                        if self.stopping {
                            return Task::none();
                        }
                        self.mark_read(key)
                    }
                    Err(e) => self.report(e),
                }
            }

            _ => Task::none(),
        }
    }

    /// Fetch the message and show it in an external viewer. The fetch is
    /// tied to the current connection; the viewer is not.
    pub(super) fn open(&mut self, message: MailMessage) -> Task<Event> {
        let key = message.key;
        if self.views.contains_key(&key) {
            log::debug!("Message {} is already open", key);
            return Task::none();
        }
        let Some(conn) = self.live_connection() else {
            return self.report(WatchError::NotConnected { key });
        };

        let generation = self.generation;
        let request = ViewRequest {
            key,
            viewers: self.settings.viewers.clone(),
            spool_dir: self.settings.spool_dir.clone(),
        };
        let prepared = viewer::prepare_view(request, conn.fetch_body(key));
        let (task, handle) = Task::future(prepared.map(move |result| Event::BodyFetched {
            generation,
            key,
            result,
        }))
        .abortable();
        self.inflight.push(handle);
        self.views.insert(
            key,
            ViewSession {
                message,
                started: Instant::now(),
                fetching: true,
            },
        );
        task
    }
}
